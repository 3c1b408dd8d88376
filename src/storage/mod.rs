// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Persistent blob backend contract consumed by the store: the master-seed
//! slot, core existence by discovery key, the `(name, namespace)` alias
//! table, and the stored authorization info per core. The store never speaks
//! to disk directly; everything goes through [`Storage`].

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::{
    engine::Manifest,
    keys::{KEY_LEN, KeyPair},
};

pub mod memory;

pub use memory::MemoryStorage;

pub type DiscoveryKey = [u8; KEY_LEN];

/// Alias-table key: the user-visible name of a core inside a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoreAlias {
    pub name: Bytes,
    pub namespace: [u8; KEY_LEN],
}

/// Authorization info persisted alongside a core.
#[derive(Debug, Clone)]
pub struct StoredAuth {
    pub key: [u8; KEY_LEN],
    pub manifest: Option<Manifest>,
    pub key_pair: Option<KeyPair>,
}

/// One entry of the persisted-core iteration.
#[derive(Debug, Clone)]
pub struct CoreRecord {
    pub discovery_key: DiscoveryKey,
    pub version: u32,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Reads the master-seed slot. `None` on a fresh backend.
    async fn get_seed(&self) -> Result<Option<[u8; KEY_LEN]>>;

    /// Writes the master-seed slot and returns the persisted value.
    async fn set_seed(&self, seed: [u8; KEY_LEN]) -> Result<[u8; KEY_LEN]>;

    /// Whether a core with this discovery key exists on disk.
    async fn has(&self, discovery_key: &DiscoveryKey) -> Result<bool>;

    /// Looks up the discovery key registered for `(name, namespace)`.
    async fn get_alias(&self, alias: &CoreAlias) -> Result<Option<DiscoveryKey>>;

    /// Reads the stored authorization info for a core.
    async fn get_auth(&self, discovery_key: &DiscoveryKey) -> Result<Option<StoredAuth>>;

    /// Registers a newly created core: its record, its auth info, and the
    /// reverse alias entry when the core was created by name. Called by the
    /// engine at creation time.
    async fn register_core(
        &self,
        record: CoreRecord,
        auth: StoredAuth,
        alias: Option<CoreAlias>,
    ) -> Result<()>;

    /// Lazy iteration over every persisted core. Finite; call again to
    /// iterate again.
    fn create_core_stream(&self) -> BoxStream<'static, Result<CoreRecord>>;

    /// Lazy iteration over persisted discovery keys, optionally restricted
    /// to the cores whose alias entry carries `namespace`. Ordering is not
    /// guaranteed.
    fn create_discovery_key_stream(
        &self,
        namespace: Option<[u8; KEY_LEN]>,
    ) -> BoxStream<'static, Result<DiscoveryKey>>;

    async fn flush(&self) -> Result<()>;

    async fn suspend(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
