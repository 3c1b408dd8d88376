// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use corestore_rs::{Corestore, GetOptions, StoreError};
use tokio::time::timeout;

use crate::integration_tests::common::init_test_logger;

#[tokio::test]
async fn exclusive_open_waits_for_the_holder_to_close() -> Result<()> {
    init_test_logger();
    let store = Corestore::memory()?;

    let x = store.get(GetOptions::from_name("a").exclusive(true)).await?;

    let store2 = store.clone();
    let y_task = tokio::spawn(async move {
        store2.get(GetOptions::from_name("a").exclusive(true)).await
    });

    // y must not complete while x holds the lock.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!y_task.is_finished(), "second exclusive open must wait");

    x.close().await?;
    let y = timeout(Duration::from_secs(5), y_task).await???;
    assert!(x.is_closed(), "y only proceeds once x has closed");

    y.close().await?;
    store.close().await?;
    Ok(())
}

#[tokio::test]
async fn read_only_sessions_skip_the_lock() -> Result<()> {
    let store = Corestore::memory()?;

    let x = store.get(GetOptions::from_name("a").exclusive(true)).await?;

    // A read-only exclusive open never takes the lock.
    let z = timeout(
        Duration::from_secs(1),
        store.get(GetOptions::from_name("a").exclusive(true).writable(false)),
    )
    .await??;
    assert!(!z.writable());

    x.close().await?;
    z.close().await?;
    store.close().await?;
    Ok(())
}

#[tokio::test]
async fn pending_exclusive_open_cancelled_by_store_close() -> Result<()> {
    let store = Corestore::memory()?;

    let x = store.get(GetOptions::from_name("a").exclusive(true)).await?;

    let store2 = store.clone();
    let y_task = tokio::spawn(async move {
        store2.get(GetOptions::from_name("a").exclusive(true)).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    store.close().await?;
    let err = timeout(Duration::from_secs(5), y_task)
        .await??
        .expect_err("a pending exclusive open must be cancelled");
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::ExclusiveWaitCancelled)
    ));

    assert!(x.is_closed(), "the store close also closed x");
    Ok(())
}

#[tokio::test]
async fn lock_hands_over_between_consecutive_holders() -> Result<()> {
    let store = Corestore::memory()?;

    for _ in 0..3 {
        let holder = store.get(GetOptions::from_name("a").exclusive(true)).await?;
        holder.close().await?;
    }
    // A released lock must be acquirable again without contention.
    let last = timeout(
        Duration::from_secs(1),
        store.get(GetOptions::from_name("a").exclusive(true)),
    )
    .await??;
    last.close().await?;

    store.close().await?;
    Ok(())
}
