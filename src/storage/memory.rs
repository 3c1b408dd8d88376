// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-memory [`Storage`] backend. The default for tests and embedded use;
//! reusing one `Arc<MemoryStorage>` across store constructions models
//! reopening the same on-disk root.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{Result, bail};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::{
    keys::KEY_LEN,
    storage::{CoreAlias, CoreRecord, DiscoveryKey, Storage, StoredAuth},
};

#[derive(Default)]
struct Inner {
    seed: Option<[u8; KEY_LEN]>,
    cores: HashMap<DiscoveryKey, (CoreRecord, StoredAuth)>,
    aliases: HashMap<CoreAlias, DiscoveryKey>,
    suspended: bool,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Inner {
    fn check_open(&self) -> Result<()> {
        if self.suspended {
            bail!("storage is suspended");
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_seed(&self) -> Result<Option<[u8; KEY_LEN]>> {
        let inner = self.inner.lock().expect("storage lock poisoned");
        inner.check_open()?;
        Ok(inner.seed)
    }

    async fn set_seed(&self, seed: [u8; KEY_LEN]) -> Result<[u8; KEY_LEN]> {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        inner.check_open()?;
        inner.seed = Some(seed);
        Ok(seed)
    }

    async fn has(&self, discovery_key: &DiscoveryKey) -> Result<bool> {
        let inner = self.inner.lock().expect("storage lock poisoned");
        inner.check_open()?;
        Ok(inner.cores.contains_key(discovery_key))
    }

    async fn get_alias(&self, alias: &CoreAlias) -> Result<Option<DiscoveryKey>> {
        let inner = self.inner.lock().expect("storage lock poisoned");
        inner.check_open()?;
        Ok(inner.aliases.get(alias).copied())
    }

    async fn get_auth(
        &self,
        discovery_key: &DiscoveryKey,
    ) -> Result<Option<StoredAuth>> {
        let inner = self.inner.lock().expect("storage lock poisoned");
        inner.check_open()?;
        Ok(inner.cores.get(discovery_key).map(|(_, auth)| auth.clone()))
    }

    async fn register_core(
        &self,
        record: CoreRecord,
        auth: StoredAuth,
        alias: Option<CoreAlias>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        inner.check_open()?;
        let dk = record.discovery_key;
        inner.cores.entry(dk).or_insert((record, auth));
        if let Some(alias) = alias {
            inner.aliases.insert(alias, dk);
        }
        Ok(())
    }

    fn create_core_stream(&self) -> BoxStream<'static, Result<CoreRecord>> {
        let inner = self.inner.lock().expect("storage lock poisoned");
        let records: Vec<CoreRecord> = inner
            .cores
            .values()
            .map(|(record, _)| record.clone())
            .collect();
        stream::iter(records.into_iter().map(Ok)).boxed()
    }

    fn create_discovery_key_stream(
        &self,
        namespace: Option<[u8; KEY_LEN]>,
    ) -> BoxStream<'static, Result<DiscoveryKey>> {
        let inner = self.inner.lock().expect("storage lock poisoned");
        let keys: Vec<DiscoveryKey> = match namespace {
            Some(ns) => inner
                .aliases
                .iter()
                .filter(|(alias, _)| alias.namespace == ns)
                .map(|(_, dk)| *dk)
                .collect(),
            None => inner.cores.keys().copied().collect(),
        };
        stream::iter(keys.into_iter().map(Ok)).boxed()
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn suspend(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        inner.suspended = true;
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("storage lock poisoned");
        inner.suspended = false;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Nothing to release in memory; a later store can reopen this root.
        Ok(())
    }
}
