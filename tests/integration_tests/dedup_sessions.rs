// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use corestore_rs::{Corestore, GetOptions, store::Preload};

use crate::integration_tests::common::{fast_gc, init_test_logger};

#[tokio::test]
async fn concurrent_opens_share_one_core() -> Result<()> {
    init_test_logger();
    let store = Corestore::memory()?;

    let (a, b) = tokio::join!(store.get("test"), store.get("test"));
    let (a, b) = (a?, b?);

    assert_eq!(a.key(), b.key());
    assert_eq!(a.discovery_key(), b.discovery_key());
    assert_eq!(store.cores_len(), 1, "both sessions share one core");

    a.close().await?;
    b.close().await?;
    store.close().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn closing_all_sessions_empties_the_registry() -> Result<()> {
    let store =
        Corestore::memory_with(fast_gc(Duration::from_millis(100), 3))?;

    let a = store.get("test").await?;
    let b = store.get("test").await?;
    assert_eq!(store.cores_len(), 1);

    a.close().await?;
    assert_eq!(store.cores_len(), 1, "one session still holds the core");
    b.close().await?;

    // Idle GC takes three ticks to evict the core.
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(store.cores_len(), 0);

    store.close().await?;
    Ok(())
}

#[tokio::test]
async fn sequential_opens_reuse_the_core() -> Result<()> {
    let store = Corestore::memory()?;

    let a = store.get("test").await?;
    let key = a.key();
    let b = store.get("test").await?;
    assert_eq!(b.key(), key);
    assert_eq!(store.cores_len(), 1);

    // A different name is a different core.
    let c = store.get("other").await?;
    assert_ne!(c.key(), key);
    assert_eq!(store.cores_len(), 2);

    store.close().await?;
    Ok(())
}

#[tokio::test]
async fn preload_resolves_before_auth() -> Result<()> {
    let store = Corestore::memory()?;

    let preload: Preload = Box::pin(async { Ok(GetOptions::from_name("preloaded")) });
    let via_preload = store.get(GetOptions::from_preload(preload)).await?;
    let direct = store.get("preloaded").await?;

    assert_eq!(via_preload.key(), direct.key());
    assert_eq!(store.cores_len(), 1);

    store.close().await?;
    Ok(())
}

#[tokio::test]
async fn open_by_key_joins_the_named_core() -> Result<()> {
    let store = Corestore::memory()?;

    let named = store.get("test").await?;
    named.append(&[bytes::Bytes::from_static(b"block")]).await?;

    let by_key = store.get(GetOptions::from_key(named.key())).await?;
    assert_eq!(by_key.get(0).await?.as_deref(), Some(b"block".as_slice()));
    assert_eq!(store.cores_len(), 1);

    store.close().await?;
    Ok(())
}
