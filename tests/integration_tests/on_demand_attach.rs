// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use corestore_rs::{Corestore, GetOptions, StoreOptions, engine::memory::pipe};
use tokio::time::timeout;

use crate::integration_tests::common::{TestRoot, init_test_logger};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn peer_request_opens_a_core_from_disk() -> Result<()> {
    init_test_logger();
    let root_a = TestRoot::new();

    // Seed the core on a's disk, then drop every open handle to it.
    let seeder = root_a.store(StoreOptions::default())?;
    let writer = seeder.get("cold").await?;
    writer.append(&[Bytes::from_static(b"from disk")]).await?;
    let key = writer.key();
    seeder.close().await?;

    let a = root_a.store(StoreOptions::default())?;
    a.ready().await?;
    assert_eq!(a.cores_len(), 0, "nothing is open on a before the request");

    let b = Corestore::memory()?;
    let s1 = a.replicate(false).await?;
    let s2 = b.replicate(true).await?;
    pipe(&s1, &s2)?;

    // b advertises the key; a transiently opens the core and attaches it.
    let reader = b.get(GetOptions::from_key(key)).await?;
    let block = timeout(WAIT, reader.get(0)).await??;
    assert_eq!(block.as_deref(), Some(b"from disk".as_slice()));
    assert_eq!(a.cores_len(), 1, "the attachment keeps the core registered");

    a.close().await?;
    b.close().await?;
    Ok(())
}

#[tokio::test]
async fn unknown_discovery_keys_are_ignored() -> Result<()> {
    let a = Corestore::memory()?;
    let b = Corestore::memory()?;

    let s1 = a.replicate(false).await?;
    let s2 = b.replicate(true).await?;
    pipe(&s1, &s2)?;

    // b opens a core a has never heard of and advertises it.
    let reader = b.get(GetOptions::from_name("only-on-b")).await?;
    reader.append(&[Bytes::from_static(b"local")]).await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(a.cores_len(), 0, "a must not open cores it does not hold");

    a.close().await?;
    b.close().await?;
    Ok(())
}
