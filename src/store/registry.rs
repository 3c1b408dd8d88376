// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Process-wide core registry: at most one live core per discovery key,
//! deduplication of concurrent opens, watcher fan-out on insert, and the
//! cooperative idle GC.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, bail};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::Core;

/// Open/close lifecycle of one registry entry. `Failed` entries are already
/// evicted from the map when observed.
#[derive(Debug, Clone)]
pub enum HandleState {
    Opening,
    Opened,
    Failed(Arc<anyhow::Error>),
    Closing,
    Closed,
}

/// One interned core. The handle exists from the moment the first opener
/// claims the discovery key, before the engine open completes; later openers
/// await its state instead of racing a second open.
pub struct CoreHandle {
    id: String,
    core: OnceCell<Arc<dyn Core>>,
    state: watch::Sender<HandleState>,
}

impl CoreHandle {
    fn new(id: String) -> Arc<Self> {
        let (state, _) = watch::channel(HandleState::Opening);
        Arc::new(Self {
            id,
            core: OnceCell::new(),
            state,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn core(&self) -> Option<Arc<dyn Core>> {
        self.core.get().cloned()
    }

    pub fn state(&self) -> HandleState {
        self.state.borrow().clone()
    }

    pub fn is_opened(&self) -> bool {
        matches!(*self.state.borrow(), HandleState::Opened)
    }

    pub fn is_closing(&self) -> bool {
        matches!(
            *self.state.borrow(),
            HandleState::Closing | HandleState::Closed
        )
    }

    /// Waits until the handle leaves `Opening` and returns the settled state.
    pub async fn settled(&self) -> HandleState {
        let mut rx = self.state.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if !matches!(current, HandleState::Opening) {
                return current;
            }
            if rx.changed().await.is_err() {
                return HandleState::Closed;
            }
        }
    }

    /// Waits until the handle reaches `Closed` (or `Failed`, which is final
    /// too).
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        loop {
            if matches!(
                *rx.borrow_and_update(),
                HandleState::Closed | HandleState::Failed(_)
            ) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub type WatchCallback = Arc<dyn Fn(Arc<dyn Core>) + Send + Sync>;

/// Keeps the callback registered for as long as it lives; dropping it (or
/// passing it to `unwatch`) removes the callback.
pub struct WatcherHandle {
    id: u64,
    registry: std::sync::Weak<RegistryShared>,
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        if let Some(shared) = self.registry.upgrade() {
            shared.remove_watcher(self.id);
        }
    }
}

struct RegistryShared {
    watchers: Mutex<Vec<(u64, WatchCallback)>>,
}

impl RegistryShared {
    fn remove_watcher(&self, id: u64) {
        let mut watchers = self.watchers.lock().expect("watcher lock poisoned");
        watchers.retain(|(watcher_id, _)| *watcher_id != id);
    }
}

pub struct CoreRegistry {
    cores: DashMap<String, Arc<CoreHandle>>,
    shared: Arc<RegistryShared>,
    watcher_ids: AtomicU64,
    /// Strike counters of idle cores; reset by eviction or resume.
    idle: DashMap<String, u8>,
    gc_cancel: CancellationToken,
    closing: AtomicBool,
}

impl Default for CoreRegistry {
    fn default() -> Self {
        Self {
            cores: DashMap::new(),
            shared: Arc::new(RegistryShared {
                watchers: Mutex::new(Vec::new()),
            }),
            watcher_ids: AtomicU64::new(1),
            idle: DashMap::new(),
            gc_cancel: CancellationToken::new(),
            closing: AtomicBool::new(false),
        }
    }
}

impl CoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live (opened, not closing) core for `id`. Closing cores are reported
    /// as absent; the opener must wait out the close before re-opening.
    pub fn get(&self, id: &str) -> Option<Arc<CoreHandle>> {
        let handle = self.cores.get(id)?.clone();
        if handle.is_opened() { Some(handle) } else { None }
    }

    pub fn opened(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Number of interned cores.
    pub fn len(&self) -> usize {
        self.cores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    /// Every opened core, in no particular order.
    pub fn opened_cores(&self) -> Vec<Arc<dyn Core>> {
        self.cores
            .iter()
            .filter(|entry| entry.value().is_opened())
            .filter_map(|entry| entry.value().core())
            .collect()
    }

    /// Claims `id` or joins the existing claim. Returns the handle and
    /// whether this caller created it (and therefore must drive the open).
    pub fn get_or_insert(&self, id: &str) -> Result<(Arc<CoreHandle>, bool)> {
        if self.closing.load(Ordering::SeqCst) {
            bail!("registry is closing");
        }
        let entry = self.cores.entry(id.to_string());
        match entry {
            dashmap::Entry::Occupied(occupied) => Ok((occupied.get().clone(), false)),
            dashmap::Entry::Vacant(vacant) => {
                let handle = CoreHandle::new(id.to_string());
                vacant.insert(handle.clone());
                Ok((handle, true))
            },
        }
    }

    /// Completes a claim: publish the core and fire watcher callbacks in
    /// LIFO order.
    pub fn set_opened(&self, handle: &Arc<CoreHandle>, core: Arc<dyn Core>) {
        let _ = handle.core.set(core.clone());
        let _ = handle.state.send(HandleState::Opened);
        let watchers = {
            let watchers = self
                .shared
                .watchers
                .lock()
                .expect("watcher lock poisoned");
            watchers.clone()
        };
        for (_, cb) in watchers.iter().rev() {
            cb(core.clone());
        }
    }

    /// Aborts a claim: evict the handle and mark it failed.
    pub fn fail(&self, handle: &Arc<CoreHandle>, err: Arc<anyhow::Error>) {
        self.cores
            .remove_if(handle.id(), |_, existing| Arc::ptr_eq(existing, handle));
        let _ = handle.state.send(HandleState::Failed(err));
    }

    /// Cancels any pending idle GC on `id` and returns its handle, closing
    /// or not, so the caller can decide to await or reuse.
    pub fn resume(&self, id: &str) -> Option<Arc<CoreHandle>> {
        self.idle.remove(id);
        self.cores.get(id).map(|entry| entry.clone())
    }

    /// Marks a core idle; after enough GC ticks without a resume it is
    /// closed and evicted.
    pub fn mark_idle(&self, id: &str) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        if self.cores.contains_key(id) {
            self.idle.insert(id.to_string(), 0);
        }
    }

    /// Runs the idle scan every `tick`; a core idle for `strikes`
    /// consecutive ticks is closed. Stops when the registry closes.
    pub fn spawn_gc(self: &Arc<Self>, tick: Duration, strikes: u8) {
        let registry = Arc::downgrade(self);
        let cancel = self.gc_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(tick) => {},
                }
                let Some(registry) = registry.upgrade() else { return };
                registry.gc_tick(strikes).await;
            }
        });
    }

    async fn gc_tick(&self, strikes: u8) {
        let mut expired = Vec::new();
        for mut entry in self.idle.iter_mut() {
            *entry.value_mut() += 1;
            if *entry.value() >= strikes {
                expired.push(entry.key().clone());
            }
        }
        for id in expired {
            // A resume since the scan clears the entry; the core stays.
            if self.idle.remove(&id).is_none() {
                continue;
            }
            let handle = self.cores.get(&id).map(|entry| entry.clone());
            if let Some(handle) = handle {
                // The entry stays interned (reported as absent) while the
                // close runs; a concurrent open waits it out.
                debug!("gc: closing idle core {id}");
                close_handle(&handle).await;
                self.evict(&handle);
            }
        }
    }

    /// Removes a fully closed handle so a successor can be interned.
    pub fn evict(&self, handle: &Arc<CoreHandle>) {
        self.cores
            .remove_if(handle.id(), |_, existing| Arc::ptr_eq(existing, handle));
    }

    pub fn watch(&self, cb: WatchCallback) -> WatcherHandle {
        let id = self.watcher_ids.fetch_add(1, Ordering::SeqCst);
        {
            let mut watchers = self
                .shared
                .watchers
                .lock()
                .expect("watcher lock poisoned");
            watchers.push((id, cb));
        }
        WatcherHandle {
            id,
            registry: Arc::downgrade(&self.shared),
        }
    }

    pub fn unwatch(&self, handle: WatcherHandle) {
        drop(handle);
    }

    /// Stops the GC ticker, forbids idle reentry, and closes every core.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.gc_cancel.cancel();
        self.idle.clear();
        let handles: Vec<Arc<CoreHandle>> = self
            .cores
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in handles {
            self.cores.remove(handle.id());
            close_handle(&handle).await;
        }
    }
}

async fn close_handle(handle: &Arc<CoreHandle>) {
    let _ = handle.state.send(HandleState::Closing);
    if let Some(core) = handle.core() {
        // Forbid idle reentry while the close runs.
        core.set_on_idle(None);
        if let Err(e) = core.close().await {
            warn!("failed to close core {}: {e}", handle.id());
        }
    }
    let _ = handle.state.send(HandleState::Closed);
}
