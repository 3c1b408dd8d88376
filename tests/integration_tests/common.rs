// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use corestore_rs::{
    Corestore, StoreOptions, cfg::logger::init_logger, engine::MemoryEngine,
    storage::MemoryStorage,
};

pub fn init_test_logger() {
    let _ = init_logger("tests/config_logger.yaml");
}

/// One "disk": a storage/engine pair shared by every store constructed over
/// it, standing in for a filesystem root reopened across processes.
pub struct TestRoot {
    pub storage: Arc<MemoryStorage>,
    pub engine: Arc<MemoryEngine>,
}

impl TestRoot {
    pub fn new() -> Self {
        Self {
            storage: MemoryStorage::new(),
            engine: MemoryEngine::new(),
        }
    }

    pub fn store(&self, opts: StoreOptions) -> Result<Corestore> {
        Corestore::new(self.storage.clone(), self.engine.clone(), opts)
    }
}

/// GC knobs small enough for paused-time tests.
pub fn fast_gc(tick: Duration, strikes: u8) -> StoreOptions {
    let mut opts = StoreOptions::default();
    opts.gc.tick = tick;
    opts.gc.strikes = strikes;
    opts
}
