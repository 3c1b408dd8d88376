// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Core-engine contract consumed by the store. The engine owns the log
//! format (append, block I/O, audit) and the wire protocol (handshake,
//! multiplexing); the store only routes, registers, derives and attaches.
//!
//! [`memory`] provides a reference in-memory engine used by the test-suite.

use std::{any::Any, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;

use crate::{
    keys::{KEY_LEN, KeyPair},
    storage::{CoreAlias, DiscoveryKey, Storage},
};

pub mod memory;

pub use memory::MemoryEngine;

/// A core's authorization: the signer set and the manifest version.
/// Deterministically defines the core's `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub version: u32,
    pub signers: Vec<Signer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signer {
    pub public_key: [u8; KEY_LEN],
}

impl Manifest {
    /// The default single-signer manifest.
    pub fn single_signer(version: u32, public_key: [u8; KEY_LEN]) -> Self {
        Self {
            version,
            signers: vec![Signer { public_key }],
        }
    }
}

/// Options handed to [`CoreEngine::create`].
pub struct CreateCoreOptions {
    pub discovery_key: DiscoveryKey,
    pub key: Option<[u8; KEY_LEN]>,
    pub key_pair: Option<KeyPair>,
    pub manifest: Option<Manifest>,
    pub create_if_missing: bool,
    pub overwrite: bool,
    pub alias: Option<CoreAlias>,
    /// User-data slots written at creation time.
    pub user_data: Vec<(String, Bytes)>,
    /// Opaque pass-throughs; the store never interprets these.
    pub encryption_key: Option<[u8; KEY_LEN]>,
    pub draft: bool,
}

impl CreateCoreOptions {
    pub fn new(discovery_key: DiscoveryKey) -> Self {
        Self {
            discovery_key,
            key: None,
            key_pair: None,
            manifest: None,
            create_if_missing: true,
            overwrite: false,
            alias: None,
            user_data: Vec::new(),
            encryption_key: None,
            draft: false,
        }
    }
}

/// Per-read options forwarded to [`Core::get`].
#[derive(Debug, Clone)]
pub struct BlockRequest {
    /// When false, do not wait for the network.
    pub wait: bool,
    /// Per-read bound; `None` disables it.
    pub timeout: Option<Duration>,
}

impl Default for BlockRequest {
    fn default() -> Self {
        Self {
            wait: true,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AuditOptions {
    /// Report without mutating.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub blocks_checked: u64,
    pub blocks_dropped: u64,
}

/// Installed on a core at creation; invoked when its engine-side session
/// count reaches zero.
pub type IdleHook = Arc<dyn Fn() + Send + Sync>;

/// Invoked when the replicator's `downloading` flag flips.
pub type DownloadingHook = Arc<dyn Fn(bool) + Send + Sync>;

/// Invoked by the muxer when the remote advertises a discovery key that is
/// not attached yet.
pub type DiscoveryKeyHook = Arc<
    dyn Fn(Arc<dyn Muxer>, DiscoveryKey) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;

/// Grace token telling the engine that peer discovery is in progress, so
/// initial reads should not declare "no peers" yet. Released at most once;
/// dropping an unreleased token releases it.
pub struct FindingPeers {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl FindingPeers {
    pub fn new(release: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            release: Some(release),
        }
    }

    pub fn release(mut self) {
        if let Some(f) = self.release.take() {
            f();
        }
    }
}

impl Drop for FindingPeers {
    fn drop(&mut self) {
        if let Some(f) = self.release.take() {
            f();
        }
    }
}

/// How a replication stream is set up.
pub enum StreamRole {
    Initiator,
    Responder,
    /// Caller-owned stream: the store attaches to it but must never
    /// destroy it.
    External(Arc<dyn ProtocolStream>),
}

impl From<bool> for StreamRole {
    fn from(initiator: bool) -> Self {
        if initiator {
            StreamRole::Initiator
        } else {
            StreamRole::Responder
        }
    }
}

#[derive(Default)]
pub struct ProtocolStreamOptions {
    pub on_discovery_key: Option<DiscoveryKeyHook>,
}

#[async_trait]
pub trait CoreEngine: Send + Sync {
    /// The deterministic `key` of a manifest.
    fn key(&self, manifest: &Manifest) -> [u8; KEY_LEN];

    /// The engine-domain discovery key of a core key.
    fn discovery_key(&self, key: &[u8; KEY_LEN]) -> DiscoveryKey;

    /// Opens (or creates) the core identified by `opts.discovery_key` on the
    /// given storage. At most one live core per discovery key per engine.
    async fn create(
        &self,
        storage: Arc<dyn Storage>,
        opts: CreateCoreOptions,
    ) -> Result<Arc<dyn Core>>;

    /// Builds a replication stream for `role`, installing the discovery-key
    /// hook on its muxer.
    fn create_protocol_stream(
        &self,
        role: StreamRole,
        opts: ProtocolStreamOptions,
    ) -> Result<Arc<dyn ProtocolStream>>;
}

#[async_trait]
pub trait Core: Send + Sync {
    async fn ready(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn key(&self) -> [u8; KEY_LEN];

    fn discovery_key(&self) -> DiscoveryKey;

    fn manifest(&self) -> Option<Manifest>;

    fn key_pair(&self) -> Option<KeyPair>;

    fn writable(&self) -> bool;

    /// Upgrades a core opened read-only with its signing key pair.
    async fn set_key_pair(&self, key_pair: KeyPair) -> Result<()>;

    fn length(&self) -> u64;

    async fn append(&self, blocks: &[Bytes]) -> Result<u64>;

    async fn get(&self, index: u64, request: &BlockRequest) -> Result<Option<Bytes>>;

    async fn user_data(&self, key: &str) -> Result<Option<Bytes>>;

    async fn set_user_data(&self, key: &str, value: Bytes) -> Result<()>;

    /// Engine-side reference count: one session per store session plus one
    /// per replication attachment. `active` sessions drive the replicator's
    /// `downloading` flag.
    fn open_session(&self, active: bool);

    fn close_session(&self, active: bool);

    fn set_on_idle(&self, hook: Option<IdleHook>);

    fn replicator(&self) -> Arc<dyn Replicator>;

    fn finding_peers(&self) -> FindingPeers;

    async fn audit(&self, opts: AuditOptions) -> Result<AuditReport>;
}

pub trait Replicator: Send + Sync {
    /// True while at least one active session wants this core replicated.
    fn downloading(&self) -> bool;

    fn set_on_downloading(&self, hook: Option<DownloadingHook>);

    fn attached(&self, muxer: &Arc<dyn Muxer>) -> bool;

    /// Installs a replicator session connecting the core to `muxer`. The
    /// attachment holds an engine session until detach.
    fn attach_to(&self, muxer: &Arc<dyn Muxer>) -> Result<()>;

    fn detach_from(&self, muxer: &Arc<dyn Muxer>);
}

pub trait Muxer: Send + Sync {
    /// Stable identity of this muxer within the process.
    fn id(&self) -> u64;

    /// Buffer outgoing core advertisements until [`Muxer::uncork`].
    fn cork(&self);

    /// Flush buffered advertisements in order. No-op before the handshake
    /// completes.
    fn uncork(&self);

    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
pub trait ProtocolStream: Send + Sync {
    fn muxer(&self) -> Arc<dyn Muxer>;

    /// Resolves when the handshake completes.
    async fn opened(&self) -> Result<()>;

    /// Resolves when the stream is closed or destroyed.
    async fn closed(&self);

    async fn destroy(&self) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}
