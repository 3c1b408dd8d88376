// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::keys::KEY_LEN;

/// Options for constructing a root store.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StoreOptions {
    /// Externally supplied master seed. When absent, the persisted seed is
    /// used, or a fresh one is generated and persisted on first open.
    #[serde(default, with = "serde_opt_hex")]
    pub primary_key: Option<[u8; KEY_LEN]>,

    #[serde(default = "default_manifest_version")]
    /// Manifest version stamped on cores created by name or key pair.
    pub manifest_version: u32,

    #[serde(default = "default_true")]
    /// Default writability of sessions opened through this store.
    pub writable: bool,

    #[serde(default)]
    /// Passive stores never auto-attach their cores to replication streams.
    pub passive: bool,

    #[serde(default)]
    /// Start with storage suspended; `resume()` lifts it.
    pub suspended: bool,

    #[serde(default)]
    /// Idle-core garbage collection knobs.
    pub gc: GcConfig,
}

/// Idle GC: every `tick`, idle cores gain a strike; at `strikes` strikes a
/// core is closed and evicted. Any resume resets the counter.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct GcConfig {
    #[serde(default = "default_gc_tick", with = "serde_millis")]
    pub tick: Duration,

    #[serde(default = "default_gc_strikes")]
    pub strikes: u8,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            tick: default_gc_tick(),
            strikes: default_gc_strikes(),
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            primary_key: None,
            manifest_version: default_manifest_version(),
            writable: true,
            passive: false,
            suspended: false,
            gc: GcConfig::default(),
        }
    }
}

fn default_manifest_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_gc_tick() -> Duration {
    Duration::from_secs(2)
}

fn default_gc_strikes() -> u8 {
    3
}

impl StoreOptions {
    /// Loads the options from YAML, validates them, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut opts: StoreOptions =
            serde_yaml::from_str(&s).context("failed to parse options YAML")?;
        opts.validate_and_normalize()?;
        Ok(opts)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.manifest_version >= 1, "manifest_version must be >= 1");
        ensure!(self.gc.strikes >= 1, "gc.strikes must be >= 1");
        ensure!(
            self.gc.tick >= Duration::from_millis(1),
            "gc.tick must be >= 1ms"
        );
        Ok(())
    }

    pub fn with_primary_key(mut self, primary_key: [u8; KEY_LEN]) -> Self {
        self.primary_key = Some(primary_key);
        self
    }
}

/// Serde helpers for representing an optional 32-byte key as lowercase hex.
mod serde_opt_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::keys::KEY_LEN;

    pub fn serialize<S: Serializer>(
        key: &Option<[u8; KEY_LEN]>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match key {
            Some(key) => s.serialize_some(&hex::encode(key)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<[u8; KEY_LEN]>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw {
            None => Ok(None),
            Some(raw) => {
                let bytes = hex::decode(raw.trim()).map_err(serde::de::Error::custom)?;
                let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
                    serde::de::Error::custom("primary_key must be 32 bytes of hex")
                })?;
                Ok(Some(key))
            },
        }
    }
}

/// Serde helpers for representing `Duration` as a number of milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
