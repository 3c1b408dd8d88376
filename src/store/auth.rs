// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Translates a `get` request into complete core identity material:
//! `(key_pair?, key, discovery_key, manifest?)`.

use anyhow::Result;
use bytes::Bytes;

use crate::{
    engine::{CoreEngine, Manifest},
    errors::StoreError,
    keys::{self, KEY_LEN, KeyPair},
    storage::{CoreAlias, DiscoveryKey},
    store::GetOptions,
};

/// Fully resolved identity of the core a `get` request refers to.
#[derive(Debug, Clone)]
pub struct ResolvedAuth {
    pub key_pair: Option<KeyPair>,
    pub key: Option<[u8; KEY_LEN]>,
    pub discovery_key: DiscoveryKey,
    pub manifest: Option<Manifest>,
    /// Set for named opens so the backend can maintain the alias table.
    pub alias: Option<CoreAlias>,
    /// The name the request carried, for the persisted user-data slots.
    pub name: Option<Bytes>,
}

/// Resolution precedence: name > key pair > manifest > key > discovery key.
/// First match wins.
pub fn resolve(
    opts: &GetOptions,
    primary_key: &[u8; KEY_LEN],
    ns: &[u8; KEY_LEN],
    manifest_version: u32,
    engine: &dyn CoreEngine,
) -> Result<ResolvedAuth> {
    let caller_secret = opts
        .key_pair
        .as_ref()
        .is_some_and(|kp| kp.secret_key.is_some());

    if let Some(name) = &opts.name {
        if caller_secret {
            return Err(StoreError::InvalidInput(
                "a name cannot be combined with a caller-supplied secret key".into(),
            )
            .into());
        }
        let key_pair = keys::create_key_pair(primary_key, ns, name);
        let manifest = Manifest::single_signer(manifest_version, key_pair.public_key);
        let key = engine.key(&manifest);
        return Ok(ResolvedAuth {
            key_pair: Some(key_pair),
            key: Some(key),
            discovery_key: engine.discovery_key(&key),
            manifest: Some(manifest),
            alias: Some(CoreAlias {
                name: name.clone(),
                namespace: *ns,
            }),
            name: Some(name.clone()),
        });
    }

    if let Some(key_pair) = &opts.key_pair {
        let manifest = Manifest::single_signer(manifest_version, key_pair.public_key);
        let key = engine.key(&manifest);
        return Ok(ResolvedAuth {
            key_pair: Some(key_pair.clone()),
            key: Some(key),
            discovery_key: engine.discovery_key(&key),
            manifest: Some(manifest),
            alias: None,
            name: None,
        });
    }

    if let Some(manifest) = &opts.manifest {
        if caller_secret {
            return Err(StoreError::InvalidInput(
                "a manifest cannot be combined with a caller-supplied secret key".into(),
            )
            .into());
        }
        let key = engine.key(manifest);
        return Ok(ResolvedAuth {
            key_pair: None,
            key: Some(key),
            discovery_key: engine.discovery_key(&key),
            manifest: Some(manifest.clone()),
            alias: None,
            name: None,
        });
    }

    if let Some(key) = &opts.key {
        // Read-only open: no manifest is reconstructed from a bare key.
        return Ok(ResolvedAuth {
            key_pair: None,
            key: Some(*key),
            discovery_key: engine.discovery_key(key),
            manifest: None,
            alias: None,
            name: None,
        });
    }

    if let Some(discovery_key) = &opts.discovery_key {
        // Remote-only open: key and manifest stay unknown.
        return Ok(ResolvedAuth {
            key_pair: None,
            key: None,
            discovery_key: *discovery_key,
            manifest: None,
            alias: None,
            name: None,
        });
    }

    Err(StoreError::MissingIdentity.into())
}
