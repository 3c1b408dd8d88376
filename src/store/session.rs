// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! User-visible handle to one open core. Several sessions may share one
//! core; the core stays open while any session (or replication attachment)
//! holds it.

use std::{
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, ensure};
use bytes::Bytes;
use tokio::sync::OwnedMutexGuard;

use crate::{
    engine::{AuditOptions, AuditReport, BlockRequest, Core, FindingPeers, Manifest},
    errors::StoreError,
    keys::{KEY_LEN, KeyPair},
    storage::DiscoveryKey,
    store::StoreInner,
};

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("active", &self.inner.active)
            .field("writable", &self.inner.writable)
            .finish()
    }
}

pub(crate) struct SessionInner {
    core: Arc<dyn Core>,
    id: String,
    store: Weak<StoreInner>,
    active: bool,
    writable: bool,
    wait: bool,
    timeout: Option<Duration>,
    /// Held for the lifetime of an exclusive writable session.
    exclusive: Mutex<Option<OwnedMutexGuard<()>>>,
    finding: Mutex<Vec<FindingPeers>>,
    closed: AtomicBool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        core: Arc<dyn Core>,
        id: String,
        store: Weak<StoreInner>,
        active: bool,
        writable: bool,
        wait: bool,
        timeout: Option<Duration>,
        exclusive: Option<OwnedMutexGuard<()>>,
    ) -> Self {
        core.open_session(active);
        Self {
            inner: Arc::new(SessionInner {
                core,
                id,
                store,
                active,
                writable,
                wait,
                timeout,
                exclusive: Mutex::new(exclusive),
                finding: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn same_session(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn core(&self) -> Arc<dyn Core> {
        self.inner.core.clone()
    }

    pub(crate) fn push_finding_token(&self, token: FindingPeers) {
        let mut finding = self.inner.finding.lock().expect("finding lock poisoned");
        finding.push(token);
    }

    pub(crate) fn release_finding_tokens(&self) {
        let tokens = {
            let mut finding = self.inner.finding.lock().expect("finding lock poisoned");
            std::mem::take(&mut *finding)
        };
        for token in tokens {
            token.release();
        }
    }

    pub(crate) fn acquire_finding_token(&self) {
        let token = self.inner.core.finding_peers();
        self.push_finding_token(token);
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn key(&self) -> [u8; KEY_LEN] {
        self.inner.core.key()
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        self.inner.core.discovery_key()
    }

    pub fn manifest(&self) -> Option<Manifest> {
        self.inner.core.manifest()
    }

    pub fn key_pair(&self) -> Option<KeyPair> {
        self.inner.core.key_pair()
    }

    /// Session-level writability: the owning store's default (or an explicit
    /// override) gated on the core actually holding a signing key.
    pub fn writable(&self) -> bool {
        self.inner.writable && self.inner.core.writable()
    }

    pub fn is_active(&self) -> bool {
        self.inner.active
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn length(&self) -> u64 {
        self.inner.core.length()
    }

    pub async fn ready(&self) -> Result<()> {
        self.ensure_open()?;
        self.inner.core.ready().await
    }

    fn ensure_open(&self) -> Result<()> {
        ensure!(!self.is_closed(), StoreError::StoreClosed);
        Ok(())
    }

    pub async fn append(&self, blocks: &[Bytes]) -> Result<u64> {
        self.ensure_open()?;
        ensure!(
            self.inner.writable,
            StoreError::InvalidInput("session is not writable".into())
        );
        self.inner.core.append(blocks).await
    }

    pub async fn get(&self, index: u64) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let request = BlockRequest {
            wait: self.inner.wait,
            timeout: self.inner.timeout,
        };
        self.inner.core.get(index, &request).await
    }

    pub async fn user_data(&self, key: &str) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        self.inner.core.user_data(key).await
    }

    pub async fn set_user_data(&self, key: &str, value: Bytes) -> Result<()> {
        self.ensure_open()?;
        self.inner.core.set_user_data(key, value).await
    }

    pub async fn audit(&self, opts: AuditOptions) -> Result<AuditReport> {
        self.ensure_open()?;
        self.inner.core.audit(opts).await
    }

    /// Closes the session. Idempotent; the underlying core is released
    /// exactly once, along with the exclusive lock and any finding-peers
    /// grace tokens.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut exclusive = self
                .inner
                .exclusive
                .lock()
                .expect("exclusive lock poisoned");
            exclusive.take();
        }
        self.release_finding_tokens();
        if let Some(store) = self.inner.store.upgrade() {
            store.sessions.remove(&self.inner.id, self);
        }
        self.inner.core.close_session(self.inner.active);
        Ok(())
    }
}
