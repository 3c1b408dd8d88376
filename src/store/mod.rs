// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The public store API: a factory and lifecycle manager for collections of
//! append-only authenticated logs sharing one root, one master seed, and one
//! replication fabric.

use std::{
    future::Future,
    num::NonZeroUsize,
    pin::Pin,
    sync::{
        Arc, Mutex, RwLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use lru::LruCache;
use once_cell::sync::OnceCell;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::{GcConfig, StoreOptions},
    engine::{
        AuditOptions, AuditReport, Core, CoreEngine, CreateCoreOptions,
        DiscoveryKeyHook, Manifest, Muxer, ProtocolStream, ProtocolStreamOptions,
        StreamRole,
    },
    errors::StoreError,
    keys::{self, DEFAULT_NAMESPACE, KEY_LEN, KeyPair},
    storage::{CoreRecord, DiscoveryKey, Storage},
    store::registry::HandleState,
};

pub mod auth;
pub mod registry;
pub mod session;
pub mod session_tracker;
pub mod stream_tracker;

pub use registry::{CoreHandle, CoreRegistry, WatchCallback, WatcherHandle};
pub use session::Session;
pub use session_tracker::SessionTracker;
pub use stream_tracker::{StreamRecord, StreamTracker};

/// Known-missing negative cache bound: repeated remote advertisements of a
/// key that is not on disk must not thrash storage.
const MISSING_CACHE_CAP: usize = 65_536;

/// User-data slots persisted on cores opened by name.
const USER_DATA_NAME: &str = "corestore/name";
const USER_DATA_NAMESPACE: &str = "corestore/namespace";

/// Deferred option producer for `get`: resolved before auth resolution, its
/// identity fields override the request's.
pub type Preload = Pin<Box<dyn Future<Output = Result<GetOptions>> + Send + Sync + 'static>>;

/// Options accepted by [`Corestore::get`].
pub struct GetOptions {
    pub name: Option<Bytes>,
    pub key: Option<[u8; KEY_LEN]>,
    pub key_pair: Option<KeyPair>,
    pub manifest: Option<Manifest>,
    pub discovery_key: Option<DiscoveryKey>,
    pub preload: Option<Preload>,
    /// Inactive sessions do not trigger download-driven replication.
    pub active: bool,
    /// Overrides the owning store's writability default.
    pub writable: Option<bool>,
    /// Serializes writable opens of one discovery key.
    pub exclusive: bool,
    /// When false, reads do not wait for the network.
    pub wait: bool,
    /// Per-read bound; `None` disables it.
    pub timeout: Option<Duration>,
    /// When false, a core that is not already on disk fails with
    /// storage-empty.
    pub create_if_missing: bool,
    pub encryption_key: Option<[u8; KEY_LEN]>,
    pub draft: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            name: None,
            key: None,
            key_pair: None,
            manifest: None,
            discovery_key: None,
            preload: None,
            active: true,
            writable: None,
            exclusive: false,
            wait: true,
            timeout: None,
            create_if_missing: true,
            encryption_key: None,
            draft: false,
        }
    }
}

impl GetOptions {
    pub fn from_name(name: impl AsRef<[u8]>) -> Self {
        Self {
            name: Some(Bytes::copy_from_slice(name.as_ref())),
            ..Self::default()
        }
    }

    pub fn from_key(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: Some(key),
            ..Self::default()
        }
    }

    pub fn from_key_pair(key_pair: KeyPair) -> Self {
        Self {
            key_pair: Some(key_pair),
            ..Self::default()
        }
    }

    pub fn from_manifest(manifest: Manifest) -> Self {
        Self {
            manifest: Some(manifest),
            ..Self::default()
        }
    }

    pub fn from_discovery_key(discovery_key: DiscoveryKey) -> Self {
        Self {
            discovery_key: Some(discovery_key),
            ..Self::default()
        }
    }

    pub fn from_preload(preload: Preload) -> Self {
        Self {
            preload: Some(preload),
            ..Self::default()
        }
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = Some(writable);
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Folds a resolved preload into the request: identity fields the
    /// preload carries win.
    fn merge_preloaded(&mut self, loaded: GetOptions) {
        if loaded.name.is_some() {
            self.name = loaded.name;
        }
        if loaded.key.is_some() {
            self.key = loaded.key;
        }
        if loaded.key_pair.is_some() {
            self.key_pair = loaded.key_pair;
        }
        if loaded.manifest.is_some() {
            self.manifest = loaded.manifest;
        }
        if loaded.discovery_key.is_some() {
            self.discovery_key = loaded.discovery_key;
        }
        if loaded.encryption_key.is_some() {
            self.encryption_key = loaded.encryption_key;
        }
    }
}

impl From<&str> for GetOptions {
    fn from(name: &str) -> Self {
        Self::from_name(name.as_bytes())
    }
}

/// Options for a child store produced by [`Corestore::session`].
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub namespace: Option<[u8; KEY_LEN]>,
    pub writable: Option<bool>,
    pub manifest_version: Option<u32>,
}

/// One entry of the [`Corestore::audit`] iteration.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub discovery_key: DiscoveryKey,
    pub key: [u8; KEY_LEN],
    pub audit: AuditReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreState {
    Opening,
    Opened,
    Closing,
    Closed,
}

/// Store-wide release handle returned by [`Corestore::finding_peers`].
/// Released at most once; dropping an unreleased handle releases it.
pub struct FindingPeersHandle {
    store: Weak<StoreInner>,
    released: AtomicBool,
}

impl FindingPeersHandle {
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.store.upgrade() {
            inner.release_finding_peers();
        }
    }
}

impl Drop for FindingPeersHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// State shared between the root store and every child store.
pub(crate) struct RootShared {
    storage: Arc<dyn Storage>,
    engine: Arc<dyn CoreEngine>,
    cores: Arc<CoreRegistry>,
    streams: StreamTracker,
    primary_key: OnceCell<[u8; KEY_LEN]>,
    supplied_primary_key: Option<[u8; KEY_LEN]>,
    /// Child stores, closed by the root on shutdown.
    corestores: Mutex<Vec<Weak<StoreInner>>>,
    /// Per-discovery-key exclusive write locks.
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
    /// Known-missing discovery keys.
    missing: Mutex<LruCache<String, ()>>,
    passive: bool,
    suspended: AtomicBool,
    gc: GcConfig,
    root: OnceCell<Weak<StoreInner>>,
}

impl RootShared {
    fn note_missing(&self, id: &str) {
        let mut missing = self.missing.lock().expect("missing lock poisoned");
        missing.put(id.to_string(), ());
    }

    fn clear_missing(&self, id: &str) {
        let mut missing = self.missing.lock().expect("missing lock poisoned");
        missing.pop(id);
    }

    fn is_known_missing(&self, id: &str) -> bool {
        let mut missing = self.missing.lock().expect("missing lock poisoned");
        missing.get(id).is_some()
    }
}

pub(crate) struct StoreInner {
    shared: Arc<RootShared>,
    ns: RwLock<[u8; KEY_LEN]>,
    writable: bool,
    manifest_version: u32,
    bootstrap: Option<Arc<dyn Core>>,
    is_root: bool,
    pub(crate) sessions: SessionTracker,
    state: watch::Sender<StoreState>,
    open_once: tokio::sync::OnceCell<()>,
    close_once: tokio::sync::OnceCell<()>,
    closing: CancellationToken,
    /// Outstanding finding-peers calls on this store.
    finding: Mutex<usize>,
}

impl StoreInner {
    fn release_finding_peers(&self) {
        let release_all = {
            let mut finding = self.finding.lock().expect("finding lock poisoned");
            if *finding == 0 {
                return;
            }
            *finding -= 1;
            *finding == 0
        };
        if release_all {
            for session in self.sessions.all() {
                session.release_finding_tokens();
            }
        }
    }
}

/// A store handle. The first constructed store is the root; stores produced
/// by [`Corestore::session`] and [`Corestore::namespace`] are children
/// sharing the root's registry, streams, storage, and master seed.
#[derive(Clone)]
pub struct Corestore {
    inner: Arc<StoreInner>,
}

impl Corestore {
    /// Builds a root store over the given storage backend and engine.
    pub fn new(
        storage: Arc<dyn Storage>,
        engine: Arc<dyn CoreEngine>,
        mut opts: StoreOptions,
    ) -> Result<Self> {
        opts.validate_and_normalize()?;
        let cap = NonZeroUsize::new(MISSING_CACHE_CAP)
            .expect("missing cache capacity is non-zero");
        let shared = Arc::new(RootShared {
            storage,
            engine,
            cores: Arc::new(CoreRegistry::new()),
            streams: StreamTracker::new(),
            primary_key: OnceCell::new(),
            supplied_primary_key: opts.primary_key,
            corestores: Mutex::new(Vec::new()),
            locks: DashMap::new(),
            missing: Mutex::new(LruCache::new(cap)),
            passive: opts.passive,
            suspended: AtomicBool::new(opts.suspended),
            gc: opts.gc.clone(),
            root: OnceCell::new(),
        });
        let (state, _) = watch::channel(StoreState::Opening);
        let inner = Arc::new(StoreInner {
            shared: shared.clone(),
            ns: RwLock::new(DEFAULT_NAMESPACE),
            writable: opts.writable,
            manifest_version: opts.manifest_version,
            bootstrap: None,
            is_root: true,
            sessions: SessionTracker::new(),
            state,
            open_once: tokio::sync::OnceCell::new(),
            close_once: tokio::sync::OnceCell::new(),
            closing: CancellationToken::new(),
            finding: Mutex::new(0),
        });
        let _ = shared.root.set(Arc::downgrade(&inner));
        Ok(Self { inner })
    }

    /// Root store over the in-memory backend and reference engine.
    pub fn memory() -> Result<Self> {
        Self::memory_with(StoreOptions::default())
    }

    pub fn memory_with(opts: StoreOptions) -> Result<Self> {
        Self::new(
            crate::storage::MemoryStorage::new(),
            crate::engine::MemoryEngine::new(),
            opts,
        )
    }

    fn child(
        &self,
        ns: [u8; KEY_LEN],
        opts: SessionOptions,
        bootstrap: Option<Arc<dyn Core>>,
    ) -> Self {
        let (state, _) = watch::channel(StoreState::Opening);
        // Children never widen writability beyond their parent.
        let writable = opts.writable.unwrap_or(self.inner.writable) && self.inner.writable;
        let inner = Arc::new(StoreInner {
            shared: self.inner.shared.clone(),
            ns: RwLock::new(ns),
            writable,
            manifest_version: opts
                .manifest_version
                .unwrap_or(self.inner.manifest_version),
            bootstrap,
            is_root: false,
            sessions: SessionTracker::new(),
            state,
            open_once: tokio::sync::OnceCell::new(),
            close_once: tokio::sync::OnceCell::new(),
            closing: CancellationToken::new(),
            finding: Mutex::new(0),
        });
        {
            let mut corestores = self
                .inner
                .shared
                .corestores
                .lock()
                .expect("corestores lock poisoned");
            corestores.push(Arc::downgrade(&inner));
        }
        Self { inner }
    }

    /// A child store sharing everything with this one, with optional
    /// namespace / writability / manifest-version overrides.
    pub fn session(&self, opts: SessionOptions) -> Result<Self> {
        self.ensure_not_closing()?;
        let ns = opts.namespace.unwrap_or(self.ns());
        Ok(self.child(ns, opts, None))
    }

    /// A child store whose namespace is `H(parent_ns || name)`.
    pub fn namespace(&self, name: impl AsRef<[u8]>) -> Result<Self> {
        self.ensure_not_closing()?;
        let ns = keys::derive_namespace(&self.ns(), name.as_ref());
        Ok(self.child(ns, SessionOptions::default(), None))
    }

    /// A child store that recovers its namespace from a core's persisted
    /// user data at open time.
    pub fn namespace_from_core(&self, session: &Session) -> Result<Self> {
        self.ensure_not_closing()?;
        Ok(self.child(
            self.ns(),
            SessionOptions::default(),
            Some(session.core()),
        ))
    }

    pub fn ns(&self) -> [u8; KEY_LEN] {
        *self.inner.ns.read().expect("ns lock poisoned")
    }

    pub fn writable(&self) -> bool {
        self.inner.writable
    }

    /// The master seed, available once the store opened.
    pub fn primary_key(&self) -> Option<[u8; KEY_LEN]> {
        self.inner.shared.primary_key.get().copied()
    }

    /// Number of open cores in the shared registry.
    pub fn cores_len(&self) -> usize {
        self.inner.shared.cores.len()
    }

    /// Number of live replication streams.
    pub fn streams_len(&self) -> usize {
        self.inner.shared.streams.len()
    }

    fn ensure_not_closing(&self) -> Result<()> {
        if self.inner.closing.is_cancelled() {
            return Err(StoreError::StoreClosed.into());
        }
        Ok(())
    }

    /// Drives the open protocol once; later calls await the same result.
    pub async fn ready(&self) -> Result<()> {
        self.ensure_not_closing()?;
        self.inner
            .open_once
            .get_or_try_init(|| self.open_impl())
            .await?;
        Ok(())
    }

    async fn open_impl(&self) -> Result<()> {
        let shared = &self.inner.shared;
        if self.inner.is_root {
            if shared.suspended.load(Ordering::SeqCst) {
                shared.storage.suspend().await?;
            }
            let persisted = shared.storage.get_seed().await?;
            let primary_key = match (persisted, shared.supplied_primary_key) {
                (Some(stored), Some(supplied)) if stored != supplied => {
                    return Err(StoreError::ConflictingSeed.into());
                },
                (Some(stored), _) => stored,
                (None, Some(supplied)) => shared.storage.set_seed(supplied).await?,
                (None, None) => shared.storage.set_seed(keys::create_token()).await?,
            };
            let _ = shared.primary_key.set(primary_key);
            shared.cores.spawn_gc(shared.gc.tick, shared.gc.strikes);
        } else {
            let root = shared
                .root
                .get()
                .and_then(Weak::upgrade)
                .ok_or(StoreError::StoreClosed)?;
            Box::pin(Corestore { inner: root }.ready()).await?;
            if let Some(bootstrap) = &self.inner.bootstrap {
                bootstrap.ready().await?;
                let stored = bootstrap.user_data(USER_DATA_NAMESPACE).await?;
                if let Some(stored) = stored {
                    let ns: [u8; KEY_LEN] =
                        stored.as_ref().try_into().map_err(|_| {
                            StoreError::InvalidInput(
                                "persisted namespace is not 32 bytes".into(),
                            )
                        })?;
                    *self.inner.ns.write().expect("ns lock poisoned") = ns;
                }
            }
        }
        let _ = self.inner.state.send(StoreState::Opened);
        Ok(())
    }

    /// Opens (or joins) the core the options identify and returns a session
    /// on it.
    pub async fn get(&self, opts: impl Into<GetOptions>) -> Result<Session> {
        let mut opts = opts.into();
        self.ensure_not_closing()?;
        self.ready().await?;

        if let Some(preload) = opts.preload.take() {
            let loaded = preload.await?;
            opts.merge_preloaded(loaded);
        }

        let shared = &self.inner.shared;
        let primary_key = shared
            .primary_key
            .get()
            .ok_or_else(|| anyhow!("store opened without a primary key"))?;
        let ns = self.ns();
        let resolved = auth::resolve(
            &opts,
            primary_key,
            &ns,
            self.inner.manifest_version,
            &*shared.engine,
        )?;
        let id = hex::encode(resolved.discovery_key);

        // A discovery-key-only request can never create a core.
        let remote_only = opts.name.is_none()
            && opts.key.is_none()
            && opts.key_pair.is_none()
            && opts.manifest.is_none();
        let create_if_missing = opts.create_if_missing && !remote_only;
        if !create_if_missing
            && !shared.cores.opened(&id)
            && !shared.storage.has(&resolved.discovery_key).await?
        {
            return Err(StoreError::StorageEmpty.into());
        }

        let handle = loop {
            self.ensure_not_closing()?;
            let Ok((handle, created)) = shared.cores.get_or_insert(&id) else {
                return Err(StoreError::StoreClosed.into());
            };
            if created {
                match self
                    .open_core(&handle, &resolved, create_if_missing, &opts)
                    .await
                {
                    Ok(core) => {
                        if self.inner.closing.is_cancelled() {
                            shared.cores.fail(
                                &handle,
                                Arc::new(StoreError::StoreClosed.into()),
                            );
                            let _ = core.close().await;
                            return Err(StoreError::StoreClosed.into());
                        }
                        shared.cores.set_opened(&handle, core);
                        shared.clear_missing(&id);
                        break handle;
                    },
                    Err(e) => {
                        let err = Arc::new(anyhow!("{e:#}"));
                        shared.cores.fail(&handle, err);
                        shared.note_missing(&id);
                        return Err(e);
                    },
                }
            }
            match handle.state() {
                HandleState::Opened => {
                    shared.cores.resume(&id);
                    break handle;
                },
                HandleState::Opening => match handle.settled().await {
                    HandleState::Opened => {
                        shared.cores.resume(&id);
                        break handle;
                    },
                    // The open we joined failed or the core went away;
                    // start over.
                    _ => continue,
                },
                HandleState::Closing | HandleState::Closed => {
                    handle.closed().await;
                    shared.cores.evict(&handle);
                    continue;
                },
                HandleState::Failed(_) => continue,
            }
        };

        let core = handle
            .core()
            .ok_or_else(|| anyhow!("opened core handle without a core"))?;

        self.verify_stored_auth(&resolved, &core).await?;

        let session_writable = opts.writable.unwrap_or(self.inner.writable);
        let exclusive = if opts.exclusive && session_writable {
            let lock = shared
                .locks
                .entry(id.clone())
                .or_default()
                .value()
                .clone();
            let guard = tokio::select! {
                biased;
                _ = self.inner.closing.cancelled() => {
                    return Err(StoreError::ExclusiveWaitCancelled.into());
                },
                guard = lock.lock_owned() => guard,
            };
            if self.inner.closing.is_cancelled() {
                return Err(StoreError::ExclusiveWaitCancelled.into());
            }
            Some(guard)
        } else {
            None
        };

        let session = Session::new(
            core,
            id.clone(),
            Arc::downgrade(&self.inner),
            opts.active,
            session_writable,
            opts.wait,
            opts.timeout,
            exclusive,
        );
        self.inner.sessions.add(&id, session.clone());
        {
            let finding = self.inner.finding.lock().expect("finding lock poisoned");
            if *finding > 0 {
                session.acquire_finding_token();
            }
        }
        // A racing close may already have drained the tracker.
        if self.inner.closing.is_cancelled() {
            session.close().await?;
            return Err(StoreError::StoreClosed.into());
        }
        Ok(session)
    }

    /// Creator path: engine open plus hook installation.
    async fn open_core(
        &self,
        handle: &Arc<CoreHandle>,
        resolved: &auth::ResolvedAuth,
        create_if_missing: bool,
        opts: &GetOptions,
    ) -> Result<Arc<dyn Core>> {
        let shared = &self.inner.shared;
        let mut create = CreateCoreOptions::new(resolved.discovery_key);
        create.key = resolved.key;
        create.key_pair = resolved.key_pair.clone();
        create.manifest = resolved.manifest.clone();
        create.create_if_missing = create_if_missing;
        create.alias = resolved.alias.clone();
        create.encryption_key = opts.encryption_key;
        create.draft = opts.draft;
        if let Some(name) = &resolved.name {
            create.user_data.push((
                USER_DATA_NAME.to_string(),
                name.clone(),
            ));
            create.user_data.push((
                USER_DATA_NAMESPACE.to_string(),
                Bytes::copy_from_slice(&self.ns()),
            ));
        }

        let core = shared
            .engine
            .create(shared.storage.clone(), create)
            .await
            .context("engine failed to open core")?;
        core.ready().await?;

        let id = handle.id().to_string();
        let registry = Arc::downgrade(&shared.cores);
        core.set_on_idle(Some(Arc::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.mark_idle(&id);
            }
        })));

        if !shared.passive {
            let weak_shared = Arc::downgrade(shared);
            let weak_core = Arc::downgrade(&core);
            core.replicator()
                .set_on_downloading(Some(Arc::new(move |downloading| {
                    if !downloading {
                        return;
                    }
                    let (Some(shared), Some(core)) =
                        (weak_shared.upgrade(), weak_core.upgrade())
                    else {
                        return;
                    };
                    shared.streams.attach_all(&core);
                })));
        }

        Ok(core)
    }

    /// Fatal check for named opens: the re-derived key pair must match what
    /// the core has on disk.
    async fn verify_stored_auth(
        &self,
        resolved: &auth::ResolvedAuth,
        core: &Arc<dyn Core>,
    ) -> Result<()> {
        let Some(want) = &resolved.key_pair else {
            return Ok(());
        };
        match core.key_pair() {
            Some(have) if have.public_key != want.public_key => {
                Err(StoreError::StoredKeyMismatch.into())
            },
            Some(have) => {
                // Writable upgrade of a core previously opened read-only.
                if have.secret_key.is_none() && want.secret_key.is_some() {
                    core.set_key_pair(want.clone()).await?;
                }
                Ok(())
            },
            None => {
                core.set_key_pair(want.clone()).await?;
                Ok(())
            },
        }
    }

    /// Creates a replication stream (or adopts a caller-owned one), attaches
    /// every downloading core, and installs the on-demand discovery-key
    /// handler.
    pub async fn replicate(&self, role: impl Into<StreamRole>) -> Result<Arc<dyn ProtocolStream>> {
        self.ensure_not_closing()?;
        self.ready().await?;
        let shared = &self.inner.shared;

        let role = role.into();
        let is_external = matches!(role, StreamRole::External(_));

        let weak = Arc::downgrade(&self.inner);
        let hook: DiscoveryKeyHook = Arc::new(move |muxer, discovery_key| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                let store = Corestore { inner };
                store.attach_on_demand(muxer, discovery_key).await
            })
        });

        let stream = shared.engine.create_protocol_stream(
            role,
            ProtocolStreamOptions {
                on_discovery_key: Some(hook),
            },
        )?;

        let record = shared.streams.add(stream.clone(), is_external);
        {
            let weak_shared = Arc::downgrade(shared);
            let record = record.clone();
            let stream = stream.clone();
            tokio::spawn(async move {
                stream.closed().await;
                if let Some(shared) = weak_shared.upgrade() {
                    shared.streams.remove(&record);
                }
            });
        }

        if !shared.passive {
            let downloading: Vec<Arc<dyn Core>> = shared
                .cores
                .opened_cores()
                .into_iter()
                .filter(|core| core.replicator().downloading())
                .collect();
            if !downloading.is_empty() {
                let muxer = stream.muxer();
                muxer.cork();
                for core in downloading {
                    let replicator = core.replicator();
                    if !replicator.attached(&muxer)
                        && let Err(e) = replicator.attach_to(&muxer)
                    {
                        warn!("failed to attach core during replicate: {e}");
                    }
                }
                let stream = stream.clone();
                tokio::spawn(async move {
                    // Advertisements stay corked until the handshake opens.
                    if stream.opened().await.is_ok() {
                        stream.muxer().uncork();
                    }
                });
            }
        }

        Ok(stream)
    }

    /// Discovery-key handler: transiently opens a locally known core so it
    /// attaches to the requesting stream. Unknown keys are ignored; failed
    /// opens land in the negative cache.
    async fn attach_on_demand(
        &self,
        muxer: Arc<dyn Muxer>,
        discovery_key: DiscoveryKey,
    ) -> Result<()> {
        if self.inner.closing.is_cancelled() {
            return Ok(());
        }
        let shared = &self.inner.shared;
        let id = hex::encode(discovery_key);
        if shared.is_known_missing(&id) {
            return Ok(());
        }
        if !shared.cores.opened(&id) && !shared.storage.has(&discovery_key).await? {
            return Ok(());
        }
        let session = match self
            .get(
                GetOptions::from_discovery_key(discovery_key)
                    .active(false)
                    .create_if_missing(false),
            )
            .await
        {
            Ok(session) => session,
            Err(e) => {
                debug!("on-demand open of {id} failed: {e}");
                return Ok(());
            },
        };
        let replicator = session.core().replicator();
        if !replicator.attached(&muxer) {
            replicator.attach_to(&muxer)?;
        }
        // The attachment keeps the core registered; our session can go.
        session.close().await?;
        Ok(())
    }

    /// Lazy sequence of persisted discovery keys, optionally restricted to
    /// one namespace. Ordering is not guaranteed.
    pub fn list(
        &self,
        namespace: Option<[u8; KEY_LEN]>,
    ) -> BoxStream<'static, Result<DiscoveryKey>> {
        self.inner.shared.storage.create_discovery_key_stream(namespace)
    }

    /// Derives the key pair for `name` under `namespace` (this store's
    /// namespace when not given).
    pub async fn create_key_pair(
        &self,
        name: impl AsRef<[u8]>,
        namespace: Option<[u8; KEY_LEN]>,
    ) -> Result<KeyPair> {
        self.ready().await?;
        let primary_key = self
            .inner
            .shared
            .primary_key
            .get()
            .ok_or_else(|| anyhow!("store opened without a primary key"))?;
        let ns = namespace.unwrap_or(self.ns());
        Ok(keys::create_key_pair(primary_key, &ns, name.as_ref()))
    }

    /// Fresh random token.
    pub fn create_token() -> [u8; KEY_LEN] {
        keys::create_token()
    }

    /// Registers a callback fired for every core opened after this call.
    /// There is no replay of earlier opens.
    pub fn watch(&self, cb: WatchCallback) -> WatcherHandle {
        self.inner.shared.cores.watch(cb)
    }

    pub fn unwatch(&self, handle: WatcherHandle) {
        self.inner.shared.cores.unwatch(handle);
    }

    /// Signals that peer discovery is in progress: while any handle is
    /// outstanding, every session (current and future) holds a grace token
    /// so early reads wait for at least one discovery attempt.
    pub fn finding_peers(&self) -> FindingPeersHandle {
        let first = {
            let mut finding = self.inner.finding.lock().expect("finding lock poisoned");
            *finding += 1;
            *finding == 1
        };
        if first {
            for session in self.inner.sessions.all() {
                session.acquire_finding_token();
            }
        }
        FindingPeersHandle {
            store: Arc::downgrade(&self.inner),
            released: AtomicBool::new(false),
        }
    }

    /// Iterates every persisted core, audits it, and yields one entry per
    /// core. Per-core failures are yielded, not thrown.
    pub fn audit(&self, opts: AuditOptions) -> BoxStream<'static, Result<AuditEntry>> {
        let store = self.clone();
        self.inner
            .shared
            .storage
            .create_core_stream()
            .then(move |record| {
                let store = store.clone();
                async move {
                    let record = record?;
                    store.audit_one(record, opts).await
                }
            })
            .boxed()
    }

    async fn audit_one(
        &self,
        record: CoreRecord,
        opts: AuditOptions,
    ) -> Result<AuditEntry> {
        let session = self
            .get(
                GetOptions::from_discovery_key(record.discovery_key)
                    .active(false)
                    .create_if_missing(false),
            )
            .await?;
        let key = session.key();
        let audit = session.audit(opts).await;
        session.close().await?;
        Ok(AuditEntry {
            discovery_key: record.discovery_key,
            key,
            audit: audit?,
        })
    }

    /// Suspends the storage backend; `get` keeps serving already-open cores.
    pub async fn suspend(&self) -> Result<()> {
        self.inner.shared.suspended.store(true, Ordering::SeqCst);
        self.inner.shared.storage.suspend().await
    }

    pub async fn resume(&self) -> Result<()> {
        self.inner.shared.storage.resume().await?;
        self.inner.shared.suspended.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.is_cancelled()
    }

    /// Closes this store. A child closes only its own sessions; the root
    /// closes every child store, then every core, then the storage.
    /// Idempotent: a second call joins the in-flight close.
    pub async fn close(&self) -> Result<()> {
        self.inner.closing.cancel();
        let _ = self.inner.state.send_if_modified(|state| {
            if matches!(*state, StoreState::Closed) {
                false
            } else {
                *state = StoreState::Closing;
                true
            }
        });
        self.inner
            .close_once
            .get_or_init(|| self.close_impl())
            .await;
        Ok(())
    }

    async fn close_impl(&self) {
        for session in self.inner.sessions.take_all() {
            if let Err(e) = session.close().await {
                warn!("failed to close session: {e}");
            }
        }
        let shared = &self.inner.shared;
        if self.inner.is_root {
            let children: Vec<Weak<StoreInner>> = {
                let mut corestores = shared
                    .corestores
                    .lock()
                    .expect("corestores lock poisoned");
                corestores.drain(..).collect()
            };
            for child in children {
                if let Some(child) = child.upgrade() {
                    let child = Corestore { inner: child };
                    if let Err(e) = Box::pin(child.close()).await {
                        warn!("failed to close child store: {e}");
                    }
                }
            }
            shared.cores.close().await;
            shared.streams.destroy().await;
            if let Err(e) = shared.storage.close().await {
                warn!("failed to close storage: {e}");
            }
        } else {
            let mut corestores = shared
                .corestores
                .lock()
                .expect("corestores lock poisoned");
            corestores.retain(|weak| {
                weak.upgrade()
                    .is_some_and(|inner| !Arc::ptr_eq(&inner, &self.inner))
            });
        }
        let _ = self.inner.state.send(StoreState::Closed);
    }
}
