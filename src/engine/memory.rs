// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Reference in-memory engine. Implements the full [`CoreEngine`] contract
//! over process memory: manifest-keyed core identities, session refcounting
//! with idle notification, and block sync between muxers linked with
//! [`pipe`]. This is a replication fabric for tests and embedded use, not
//! the real log format: no Merkle proofs, no wire encoding.

use std::{
    any::Any,
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail, ensure};
use async_trait::async_trait;
use blake2b_simd::Params;
use bytes::Bytes;
use once_cell::sync::OnceCell;
use tokio::{
    sync::{Notify, watch},
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    engine::{
        AuditOptions, AuditReport, BlockRequest, Core, CoreEngine,
        CreateCoreOptions, DiscoveryKeyHook, DownloadingHook, FindingPeers,
        IdleHook, Manifest, Muxer, ProtocolStream, ProtocolStreamOptions,
        Replicator, StreamRole,
    },
    keys::{KEY_LEN, KeyPair},
    storage::{CoreRecord, DiscoveryKey, Storage, StoredAuth},
};

/// Interval between remote lookups while a blocking `get` waits for a peer.
const REMOTE_POLL: Duration = Duration::from_millis(20);

static MUXER_IDS: AtomicU64 = AtomicU64::new(1);

/// Persistent per-core data. Survives open/close cycles for as long as the
/// engine instance lives, standing in for the core's on-disk directory.
struct CoreState {
    key: [u8; KEY_LEN],
    discovery_key: DiscoveryKey,
    manifest: Mutex<Option<Manifest>>,
    key_pair: Mutex<Option<KeyPair>>,
    blocks: Mutex<BTreeMap<u64, Bytes>>,
    length: AtomicU64,
    user_data: Mutex<HashMap<String, Bytes>>,
    corrupt: Mutex<HashSet<u64>>,
    changed: Notify,
}

impl CoreState {
    fn new(key: [u8; KEY_LEN], discovery_key: DiscoveryKey) -> Self {
        Self {
            key,
            discovery_key,
            manifest: Mutex::new(None),
            key_pair: Mutex::new(None),
            blocks: Mutex::new(BTreeMap::new()),
            length: AtomicU64::new(0),
            user_data: Mutex::new(HashMap::new()),
            corrupt: Mutex::new(HashSet::new()),
            changed: Notify::new(),
        }
    }
}

#[derive(Default)]
pub struct MemoryEngine {
    states: Mutex<HashMap<DiscoveryKey, Arc<CoreState>>>,
}

impl MemoryEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Test hook: marks a stored block corrupt so that `audit` has
    /// something to find.
    pub fn corrupt_block(&self, discovery_key: &DiscoveryKey, index: u64) {
        let states = self.states.lock().expect("engine lock poisoned");
        if let Some(state) = states.get(discovery_key) {
            state
                .corrupt
                .lock()
                .expect("corrupt lock poisoned")
                .insert(index);
        }
    }
}

fn manifest_key(manifest: &Manifest) -> [u8; KEY_LEN] {
    let mut state = Params::new()
        .hash_length(KEY_LEN)
        .key(b"corestore-manifest")
        .to_state();
    state.update(&manifest.version.to_le_bytes());
    for signer in &manifest.signers {
        state.update(&signer.public_key);
    }
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(state.finalize().as_bytes());
    out
}

fn key_discovery_key(key: &[u8; KEY_LEN]) -> DiscoveryKey {
    let mut state = Params::new().hash_length(KEY_LEN).key(key).to_state();
    state.update(b"hypercore");
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(state.finalize().as_bytes());
    out
}

#[async_trait]
impl CoreEngine for MemoryEngine {
    fn key(&self, manifest: &Manifest) -> [u8; KEY_LEN] {
        manifest_key(manifest)
    }

    fn discovery_key(&self, key: &[u8; KEY_LEN]) -> DiscoveryKey {
        key_discovery_key(key)
    }

    async fn create(
        &self,
        storage: Arc<dyn Storage>,
        mut opts: CreateCoreOptions,
    ) -> Result<Arc<dyn Core>> {
        let dk = opts.discovery_key;
        let alias = opts.alias.take();

        let existing = {
            let states = self.states.lock().expect("engine lock poisoned");
            states.get(&dk).cloned()
        };

        let state = match existing {
            Some(state) => {
                if opts.overwrite {
                    state.blocks.lock().expect("blocks lock poisoned").clear();
                    state.length.store(0, Ordering::SeqCst);
                    state
                        .user_data
                        .lock()
                        .expect("user data lock poisoned")
                        .clear();
                }
                state
            },
            None => {
                // The engine instance has no data for this core; storage may
                // still know it (same root reopened through a fresh engine).
                let stored = storage.get_auth(&dk).await?;
                let auth = match stored {
                    Some(auth) => auth,
                    None => {
                        ensure!(
                            opts.create_if_missing,
                            "core is not present in storage"
                        );
                        let key = match (&opts.key, &opts.manifest) {
                            (Some(key), _) => *key,
                            (None, Some(manifest)) => manifest_key(manifest),
                            (None, None) => {
                                bail!("cannot create a core without key material")
                            },
                        };
                        StoredAuth {
                            key,
                            manifest: opts.manifest.clone(),
                            key_pair: opts.key_pair.clone(),
                        }
                    },
                };

                let state = Arc::new(CoreState::new(auth.key, dk));
                *state.manifest.lock().expect("manifest lock poisoned") =
                    auth.manifest.clone();
                *state.key_pair.lock().expect("key pair lock poisoned") =
                    auth.key_pair.clone();

                storage
                    .register_core(
                        CoreRecord {
                            discovery_key: dk,
                            version: 1,
                        },
                        auth,
                        alias,
                    )
                    .await
                    .context("failed to register core with storage")?;

                let mut states = self.states.lock().expect("engine lock poisoned");
                states.entry(dk).or_insert_with(|| state.clone());
                state
            },
        };

        // Writable upgrade: adopt a signing key pair when none is stored yet.
        if let Some(kp) = &opts.key_pair {
            let mut stored = state.key_pair.lock().expect("key pair lock poisoned");
            match stored.as_ref() {
                None => *stored = Some(kp.clone()),
                Some(existing) if existing.public_key != kp.public_key => {
                    bail!("key pair does not match the stored core key");
                },
                Some(existing)
                    if existing.secret_key.is_none() && kp.secret_key.is_some() =>
                {
                    *stored = Some(kp.clone());
                },
                Some(_) => {},
            }
        }

        {
            let mut user_data = state.user_data.lock().expect("user data lock poisoned");
            for (slot, value) in &opts.user_data {
                user_data
                    .entry(slot.clone())
                    .or_insert_with(|| value.clone());
            }
        }

        Ok(MemoryCore::open(state))
    }

    fn create_protocol_stream(
        &self,
        role: StreamRole,
        opts: ProtocolStreamOptions,
    ) -> Result<Arc<dyn ProtocolStream>> {
        match role {
            StreamRole::Initiator | StreamRole::Responder => {
                let stream = MemoryProtocolStream::new();
                if let Some(hook) = opts.on_discovery_key {
                    stream.muxer.add_hook(hook);
                }
                Ok(stream)
            },
            StreamRole::External(stream) => {
                let mem = stream
                    .as_any()
                    .downcast_ref::<MemoryProtocolStream>()
                    .ok_or_else(|| {
                        anyhow!("external stream is not a memory protocol stream")
                    })?;
                if let Some(hook) = opts.on_discovery_key {
                    mem.muxer.add_hook(hook);
                }
                Ok(stream)
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Core handle

pub struct MemoryCore {
    state: Arc<CoreState>,
    sessions: AtomicUsize,
    active_sessions: AtomicUsize,
    on_idle: Mutex<Option<IdleHook>>,
    replicator: Arc<MemoryReplicator>,
    closed: AtomicBool,
}

impl MemoryCore {
    fn open(state: Arc<CoreState>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<MemoryCore>| Self {
            state,
            sessions: AtomicUsize::new(0),
            active_sessions: AtomicUsize::new(0),
            on_idle: Mutex::new(None),
            replicator: Arc::new(MemoryReplicator {
                core: weak.clone(),
                attached: Mutex::new(Vec::new()),
                on_downloading: Mutex::new(None),
            }),
            closed: AtomicBool::new(false),
        })
    }

    fn fire_downloading(&self, downloading: bool) {
        let hook = {
            let guard = self
                .replicator
                .on_downloading
                .lock()
                .expect("hook lock poisoned");
            guard.clone()
        };
        if let Some(hook) = hook {
            hook(downloading);
        }
    }

    /// Looks for `index` on any core attached to the other end of one of our
    /// muxers and downloads it locally when found.
    fn fetch_remote(&self, index: u64) -> Option<Bytes> {
        let muxers = self.replicator.attached_muxers();
        for muxer in muxers {
            let Some(peer) = muxer.peer() else { continue };
            let Some(remote) = peer.attached_state(&self.state.discovery_key) else {
                continue;
            };
            let block = {
                let blocks = remote.blocks.lock().expect("blocks lock poisoned");
                blocks.get(&index).cloned()
            };
            if let Some(block) = block {
                let mut blocks = self.state.blocks.lock().expect("blocks lock poisoned");
                blocks.insert(index, block.clone());
                drop(blocks);
                let len = self.state.length.load(Ordering::SeqCst);
                if index + 1 > len {
                    self.state.length.store(index + 1, Ordering::SeqCst);
                }
                self.state.changed.notify_waiters();
                return Some(block);
            }
        }
        None
    }
}

#[async_trait]
impl Core for MemoryCore {
    async fn ready(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("core is closed");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Replication attachments go away with the core.
        let muxers = {
            let mut attached = self
                .replicator
                .attached
                .lock()
                .expect("attached lock poisoned");
            std::mem::take(&mut *attached)
        };
        for muxer in muxers {
            muxer.detach(&self.state.discovery_key);
            self.sessions.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn key(&self) -> [u8; KEY_LEN] {
        self.state.key
    }

    fn discovery_key(&self) -> DiscoveryKey {
        self.state.discovery_key
    }

    fn manifest(&self) -> Option<Manifest> {
        self.state
            .manifest
            .lock()
            .expect("manifest lock poisoned")
            .clone()
    }

    fn key_pair(&self) -> Option<KeyPair> {
        self.state
            .key_pair
            .lock()
            .expect("key pair lock poisoned")
            .clone()
    }

    fn writable(&self) -> bool {
        self.state
            .key_pair
            .lock()
            .expect("key pair lock poisoned")
            .as_ref()
            .is_some_and(|kp| kp.secret_key.is_some())
    }

    async fn set_key_pair(&self, key_pair: KeyPair) -> Result<()> {
        let mut stored = self.state.key_pair.lock().expect("key pair lock poisoned");
        if let Some(existing) = stored.as_ref()
            && existing.public_key != key_pair.public_key
        {
            bail!("key pair does not match the stored core key");
        }
        *stored = Some(key_pair);
        Ok(())
    }

    fn length(&self) -> u64 {
        self.state.length.load(Ordering::SeqCst)
    }

    async fn append(&self, blocks: &[Bytes]) -> Result<u64> {
        ensure!(!self.closed.load(Ordering::SeqCst), "core is closed");
        ensure!(self.writable(), "core is not writable");
        let mut stored = self.state.blocks.lock().expect("blocks lock poisoned");
        let mut length = self.state.length.load(Ordering::SeqCst);
        for block in blocks {
            stored.insert(length, block.clone());
            length += 1;
        }
        drop(stored);
        self.state.length.store(length, Ordering::SeqCst);
        self.state.changed.notify_waiters();
        Ok(length)
    }

    async fn get(&self, index: u64, request: &BlockRequest) -> Result<Option<Bytes>> {
        ensure!(!self.closed.load(Ordering::SeqCst), "core is closed");
        {
            let blocks = self.state.blocks.lock().expect("blocks lock poisoned");
            if let Some(block) = blocks.get(&index) {
                return Ok(Some(block.clone()));
            }
        }
        if let Some(block) = self.fetch_remote(index) {
            return Ok(Some(block));
        }
        if !request.wait {
            return Ok(None);
        }

        let deadline = request.timeout.map(|t| Instant::now() + t);
        loop {
            tokio::select! {
                _ = self.state.changed.notified() => {},
                _ = sleep(REMOTE_POLL) => {},
            }
            if self.closed.load(Ordering::SeqCst) {
                bail!("core closed while waiting for block {index}");
            }
            {
                let blocks = self.state.blocks.lock().expect("blocks lock poisoned");
                if let Some(block) = blocks.get(&index) {
                    return Ok(Some(block.clone()));
                }
            }
            if let Some(block) = self.fetch_remote(index) {
                return Ok(Some(block));
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                bail!("timed out waiting for block {index}");
            }
        }
    }

    async fn user_data(&self, key: &str) -> Result<Option<Bytes>> {
        let user_data = self
            .state
            .user_data
            .lock()
            .expect("user data lock poisoned");
        Ok(user_data.get(key).cloned())
    }

    async fn set_user_data(&self, key: &str, value: Bytes) -> Result<()> {
        let mut user_data = self
            .state
            .user_data
            .lock()
            .expect("user data lock poisoned");
        user_data.insert(key.to_string(), value);
        Ok(())
    }

    fn open_session(&self, active: bool) {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        if active && self.active_sessions.fetch_add(1, Ordering::SeqCst) == 0 {
            self.fire_downloading(true);
        }
    }

    fn close_session(&self, active: bool) {
        if active && self.active_sessions.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.fire_downloading(false);
        }
        if self.sessions.fetch_sub(1, Ordering::SeqCst) == 1 {
            let hook = {
                let guard = self.on_idle.lock().expect("idle lock poisoned");
                guard.clone()
            };
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    fn set_on_idle(&self, hook: Option<IdleHook>) {
        *self.on_idle.lock().expect("idle lock poisoned") = hook;
    }

    fn replicator(&self) -> Arc<dyn Replicator> {
        self.replicator.clone()
    }

    fn finding_peers(&self) -> FindingPeers {
        // The memory fabric resolves lookups eagerly; the token only has to
        // be release-once.
        let released = Arc::new(AtomicBool::new(false));
        FindingPeers::new(Box::new(move || {
            released.store(true, Ordering::SeqCst);
        }))
    }

    async fn audit(&self, opts: AuditOptions) -> Result<AuditReport> {
        let corrupt: Vec<u64> = {
            let corrupt = self.state.corrupt.lock().expect("corrupt lock poisoned");
            corrupt.iter().copied().collect()
        };
        let blocks_checked = {
            let blocks = self.state.blocks.lock().expect("blocks lock poisoned");
            blocks.len() as u64
        };
        let mut blocks_dropped = 0u64;
        for index in corrupt {
            blocks_dropped += 1;
            if !opts.dry_run {
                let mut blocks = self.state.blocks.lock().expect("blocks lock poisoned");
                blocks.remove(&index);
                drop(blocks);
                self.state
                    .corrupt
                    .lock()
                    .expect("corrupt lock poisoned")
                    .remove(&index);
            }
        }
        Ok(AuditReport {
            blocks_checked,
            blocks_dropped,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Replicator

pub struct MemoryReplicator {
    core: Weak<MemoryCore>,
    attached: Mutex<Vec<Arc<MemoryMuxer>>>,
    on_downloading: Mutex<Option<DownloadingHook>>,
}

impl MemoryReplicator {
    fn attached_muxers(&self) -> Vec<Arc<MemoryMuxer>> {
        self.attached.lock().expect("attached lock poisoned").clone()
    }
}

impl Replicator for MemoryReplicator {
    fn downloading(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| core.active_sessions.load(Ordering::SeqCst) > 0)
    }

    fn set_on_downloading(&self, hook: Option<DownloadingHook>) {
        *self.on_downloading.lock().expect("hook lock poisoned") = hook;
    }

    fn attached(&self, muxer: &Arc<dyn Muxer>) -> bool {
        let attached = self.attached.lock().expect("attached lock poisoned");
        attached.iter().any(|m| m.id == muxer.id())
    }

    fn attach_to(&self, muxer: &Arc<dyn Muxer>) -> Result<()> {
        let core = self
            .core
            .upgrade()
            .ok_or_else(|| anyhow!("core is gone"))?;
        let mem = muxer
            .as_any()
            .downcast_ref::<MemoryMuxer>()
            .ok_or_else(|| anyhow!("muxer is not a memory muxer"))?;
        let mem = mem
            .self_weak
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| anyhow!("muxer is gone"))?;

        {
            let mut attached = self.attached.lock().expect("attached lock poisoned");
            if attached.iter().any(|m| m.id == mem.id) {
                return Ok(());
            }
            attached.push(mem.clone());
        }
        // The attachment holds a (passive) engine session.
        core.open_session(false);
        mem.attach(core.state.discovery_key, core.clone());
        Ok(())
    }

    fn detach_from(&self, muxer: &Arc<dyn Muxer>) {
        let removed = {
            let mut attached = self.attached.lock().expect("attached lock poisoned");
            let before = attached.len();
            attached.retain(|m| m.id != muxer.id());
            before != attached.len()
        };
        if removed && let Some(core) = self.core.upgrade() {
            if let Some(mem) = muxer.as_any().downcast_ref::<MemoryMuxer>() {
                mem.detach(&core.state.discovery_key);
            }
            core.close_session(false);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Muxer & protocol stream

pub struct MemoryMuxer {
    id: u64,
    self_weak: OnceCell<Weak<MemoryMuxer>>,
    peer: Mutex<Option<Weak<MemoryMuxer>>>,
    attached: Mutex<HashMap<DiscoveryKey, Arc<MemoryCore>>>,
    corked: AtomicBool,
    opened: watch::Sender<bool>,
    pending: Mutex<VecDeque<DiscoveryKey>>,
    hooks: Mutex<Vec<DiscoveryKeyHook>>,
    closed: CancellationToken,
}

impl MemoryMuxer {
    fn new(closed: CancellationToken) -> Arc<Self> {
        let (opened, _) = watch::channel(false);
        let muxer = Arc::new(Self {
            id: MUXER_IDS.fetch_add(1, Ordering::SeqCst),
            self_weak: OnceCell::new(),
            peer: Mutex::new(None),
            attached: Mutex::new(HashMap::new()),
            corked: AtomicBool::new(false),
            opened,
            pending: Mutex::new(VecDeque::new()),
            hooks: Mutex::new(Vec::new()),
            closed,
        });
        let _ = muxer.self_weak.set(Arc::downgrade(&muxer));
        muxer
    }

    fn add_hook(&self, hook: DiscoveryKeyHook) {
        self.hooks.lock().expect("hooks lock poisoned").push(hook);
    }

    fn peer(&self) -> Option<Arc<MemoryMuxer>> {
        let peer = self.peer.lock().expect("peer lock poisoned");
        peer.as_ref().and_then(Weak::upgrade)
    }

    fn attached_state(&self, discovery_key: &DiscoveryKey) -> Option<Arc<CoreState>> {
        let attached = self.attached.lock().expect("attached lock poisoned");
        attached.get(discovery_key).map(|core| core.state.clone())
    }

    fn attach(&self, discovery_key: DiscoveryKey, core: Arc<MemoryCore>) {
        {
            let mut attached = self.attached.lock().expect("attached lock poisoned");
            attached.insert(discovery_key, core);
        }
        {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.push_back(discovery_key);
        }
        self.maybe_flush();
        // A new attachment may satisfy reads already waiting on the peer.
        if let Some(peer) = self.peer()
            && let Some(state) = peer.attached_state(&discovery_key)
        {
            state.changed.notify_waiters();
        }
    }

    fn detach(&self, discovery_key: &DiscoveryKey) {
        let mut attached = self.attached.lock().expect("attached lock poisoned");
        attached.remove(discovery_key);
    }

    /// Delivers pending advertisements once the handshake is done and the
    /// stream is not corked. Order is preserved.
    fn maybe_flush(&self) {
        if self.corked.load(Ordering::SeqCst) || !*self.opened.borrow() {
            return;
        }
        let Some(peer) = self.peer() else { return };
        loop {
            let next = {
                let mut pending = self.pending.lock().expect("pending lock poisoned");
                pending.pop_front()
            };
            let Some(dk) = next else { break };
            peer.receive_advertisement(dk);
        }
    }

    fn receive_advertisement(&self, discovery_key: DiscoveryKey) {
        {
            let attached = self.attached.lock().expect("attached lock poisoned");
            if let Some(core) = attached.get(&discovery_key) {
                // Both sides hold the core now; wake any blocked readers.
                core.state.changed.notify_waiters();
                return;
            }
        }
        let hooks = {
            let hooks = self.hooks.lock().expect("hooks lock poisoned");
            hooks.clone()
        };
        if hooks.is_empty() {
            return;
        }
        let Some(muxer) = self.self_weak.get().and_then(Weak::upgrade) else {
            return;
        };
        let muxer: Arc<dyn Muxer> = muxer;
        tokio::spawn(async move {
            for hook in hooks {
                if let Err(e) = hook(muxer.clone(), discovery_key).await {
                    warn!("discovery-key hook failed: {e}");
                }
            }
        });
    }

    fn mark_open(&self) {
        let _ = self.opened.send(true);
        self.maybe_flush();
    }
}

impl Muxer for MemoryMuxer {
    fn id(&self) -> u64 {
        self.id
    }

    fn cork(&self) {
        self.corked.store(true, Ordering::SeqCst);
    }

    fn uncork(&self) {
        self.corked.store(false, Ordering::SeqCst);
        self.maybe_flush();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct MemoryProtocolStream {
    muxer: Arc<MemoryMuxer>,
    closed: CancellationToken,
}

impl MemoryProtocolStream {
    fn new() -> Arc<Self> {
        let closed = CancellationToken::new();
        Arc::new(Self {
            muxer: MemoryMuxer::new(closed.clone()),
            closed,
        })
    }
}

#[async_trait]
impl ProtocolStream for MemoryProtocolStream {
    fn muxer(&self) -> Arc<dyn Muxer> {
        self.muxer.clone()
    }

    async fn opened(&self) -> Result<()> {
        let mut rx = self.muxer.opened.subscribe();
        loop {
            if *rx.borrow() {
                return Ok(());
            }
            tokio::select! {
                _ = self.closed.cancelled() => bail!("stream destroyed before handshake"),
                res = rx.changed() => {
                    if res.is_err() {
                        bail!("stream gone before handshake");
                    }
                },
            }
        }
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    async fn destroy(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        debug!("destroying protocol stream muxer={}", self.muxer.id);
        let cores = {
            let mut attached = self
                .muxer
                .attached
                .lock()
                .expect("attached lock poisoned");
            attached.drain().collect::<Vec<_>>()
        };
        let muxer: Arc<dyn Muxer> = self.muxer.clone();
        for (_, core) in cores {
            core.replicator.detach_from(&muxer);
        }
        self.closed.cancel();
        if let Some(peer) = self.muxer.peer() {
            peer.closed.cancel();
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Links two protocol streams the way test-suites pipe duplex streams:
/// peers are wired both ways and the handshake completes on both sides.
pub fn pipe(a: &Arc<dyn ProtocolStream>, b: &Arc<dyn ProtocolStream>) -> Result<()> {
    let a = a
        .as_any()
        .downcast_ref::<MemoryProtocolStream>()
        .ok_or_else(|| anyhow!("pipe expects memory protocol streams"))?;
    let b = b
        .as_any()
        .downcast_ref::<MemoryProtocolStream>()
        .ok_or_else(|| anyhow!("pipe expects memory protocol streams"))?;

    {
        let mut peer = a.muxer.peer.lock().expect("peer lock poisoned");
        *peer = Some(Arc::downgrade(&b.muxer));
    }
    {
        let mut peer = b.muxer.peer.lock().expect("peer lock poisoned");
        *peer = Some(Arc::downgrade(&a.muxer));
    }

    a.muxer.mark_open();
    b.muxer.mark_open();
    Ok(())
}
