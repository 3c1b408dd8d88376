// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use corestore_rs::Corestore;

use crate::integration_tests::common::init_test_logger;

#[tokio::test]
async fn release_is_idempotent() -> Result<()> {
    init_test_logger();
    let store = Corestore::memory()?;
    let _session = store.get("doc").await?;

    let handle = store.finding_peers();
    handle.release();
    // Only the first release changes the counter.
    handle.release();
    handle.release();

    // The counter is back at zero: a fresh handle transitions 0 -> 1 again
    // without underflow.
    let second = store.finding_peers();
    second.release();

    store.close().await?;
    Ok(())
}

#[tokio::test]
async fn overlapping_handles_release_once_each() -> Result<()> {
    let store = Corestore::memory()?;
    let _session = store.get("doc").await?;

    let first = store.finding_peers();
    let second = store.finding_peers();

    first.release();
    // Still outstanding: new sessions acquire grace tokens.
    let _late = store.get("late").await?;
    second.release();

    store.close().await?;
    Ok(())
}

#[tokio::test]
async fn dropping_a_handle_releases_it() -> Result<()> {
    let store = Corestore::memory()?;
    let _session = store.get("doc").await?;

    {
        let _handle = store.finding_peers();
        // Dropped without an explicit release.
    }
    let again = store.finding_peers();
    again.release();

    store.close().await?;
    Ok(())
}
