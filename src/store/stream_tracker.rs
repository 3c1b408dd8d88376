// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Live peer streams. Removal is O(1): the tail record is swapped into the
//! vacated slot and its index fixed up.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use tracing::warn;

use crate::engine::{Core, ProtocolStream};

pub struct StreamRecord {
    pub stream: Arc<dyn ProtocolStream>,
    /// Caller-owned streams are never destroyed by us.
    pub is_external: bool,
    index: AtomicUsize,
}

#[derive(Default)]
pub struct StreamTracker {
    streams: Mutex<Vec<Arc<StreamRecord>>>,
}

impl StreamTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        stream: Arc<dyn ProtocolStream>,
        is_external: bool,
    ) -> Arc<StreamRecord> {
        let mut streams = self.streams.lock().expect("stream lock poisoned");
        let record = Arc::new(StreamRecord {
            stream,
            is_external,
            index: AtomicUsize::new(streams.len()),
        });
        streams.push(record.clone());
        record
    }

    pub fn remove(&self, record: &Arc<StreamRecord>) {
        let mut streams = self.streams.lock().expect("stream lock poisoned");
        let index = record.index.load(Ordering::SeqCst);
        if index >= streams.len() || !Arc::ptr_eq(&streams[index], record) {
            return;
        }
        streams.swap_remove(index);
        if index < streams.len() {
            streams[index].index.store(index, Ordering::SeqCst);
        }
    }

    pub fn len(&self) -> usize {
        self.streams.lock().expect("stream lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attaches `core` to every stream its replicator is not already on.
    pub fn attach_all(&self, core: &Arc<dyn Core>) {
        let records: Vec<Arc<StreamRecord>> = {
            let streams = self.streams.lock().expect("stream lock poisoned");
            streams.clone()
        };
        let replicator = core.replicator();
        for record in records {
            let muxer = record.stream.muxer();
            if !replicator.attached(&muxer)
                && let Err(e) = replicator.attach_to(&muxer)
            {
                warn!("failed to attach core to stream: {e}");
            }
        }
    }

    /// Destroys every stream we created, in reverse registration order.
    /// External streams are left to their owners.
    pub async fn destroy(&self) {
        let records: Vec<Arc<StreamRecord>> = {
            let mut streams = self.streams.lock().expect("stream lock poisoned");
            streams.drain(..).collect()
        };
        for record in records.into_iter().rev() {
            if record.is_external {
                continue;
            }
            if let Err(e) = record.stream.destroy().await {
                warn!("failed to destroy stream: {e}");
            }
        }
    }
}
