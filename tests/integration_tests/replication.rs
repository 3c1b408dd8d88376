// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use corestore_rs::{
    Corestore, GetOptions,
    engine::{StreamRole, memory::pipe},
};
use tokio::time::timeout;

use crate::integration_tests::common::init_test_logger;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn blocks_replicate_between_two_stores() -> Result<()> {
    init_test_logger();
    let a = Corestore::memory()?;
    let b = Corestore::memory()?;

    let writer = a.get("foo").await?;
    writer.append(&[Bytes::from_static(b"hello")]).await?;

    let s1 = a.replicate(false).await?;
    let s2 = b.replicate(true).await?;
    pipe(&s1, &s2)?;

    let reader = b.get(GetOptions::from_key(writer.key())).await?;
    let block = timeout(WAIT, reader.get(0)).await??;
    assert_eq!(block.as_deref(), Some(b"hello".as_slice()));

    a.close().await?;
    b.close().await?;
    Ok(())
}

#[tokio::test]
async fn appends_flow_to_a_live_peer() -> Result<()> {
    let a = Corestore::memory()?;
    let b = Corestore::memory()?;

    let writer = a.get("feed").await?;

    let s1 = a.replicate(false).await?;
    let s2 = b.replicate(true).await?;
    pipe(&s1, &s2)?;

    let reader = b.get(GetOptions::from_key(writer.key())).await?;

    // The append happens after both sides are attached.
    writer.append(&[Bytes::from_static(b"late")]).await?;
    let block = timeout(WAIT, reader.get(0)).await??;
    assert_eq!(block.as_deref(), Some(b"late".as_slice()));

    a.close().await?;
    b.close().await?;
    Ok(())
}

#[tokio::test]
async fn passive_stores_do_not_advertise() -> Result<()> {
    use corestore_rs::StoreOptions;

    // With a passive writer and a reader that never advertises (inactive),
    // no side initiates the attachment.
    let mut opts = StoreOptions::default();
    opts.passive = true;
    let a = Corestore::memory_with(opts)?;
    let b = Corestore::memory()?;

    let writer = a.get("quiet").await?;
    writer.append(&[Bytes::from_static(b"secret")]).await?;

    let s1 = a.replicate(false).await?;
    let s2 = b.replicate(true).await?;
    pipe(&s1, &s2)?;

    let reader = b
        .get(GetOptions::from_key(writer.key()).active(false).wait(false))
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        reader.get(0).await?,
        None,
        "a passive store never attaches its cores"
    );

    a.close().await?;
    b.close().await?;

    // Control: the same wiring with a non-passive writer replicates.
    let a = Corestore::memory()?;
    let b = Corestore::memory()?;
    let writer = a.get("loud").await?;
    writer.append(&[Bytes::from_static(b"public")]).await?;
    let s1 = a.replicate(false).await?;
    let s2 = b.replicate(true).await?;
    pipe(&s1, &s2)?;
    let reader = b
        .get(GetOptions::from_key(writer.key()).active(false))
        .await?;
    let block = timeout(WAIT, reader.get(0)).await??;
    assert_eq!(block.as_deref(), Some(b"public".as_slice()));

    a.close().await?;
    b.close().await?;
    Ok(())
}

#[tokio::test]
async fn external_streams_survive_store_close() -> Result<()> {
    let a = Corestore::memory()?;
    let b = Corestore::memory()?;

    let s1 = a.replicate(true).await?;
    // b adopts a caller-owned stream; closing b must not destroy it.
    let s2 = b.replicate(StreamRole::External(s1.clone())).await?;
    assert_eq!(b.streams_len(), 1);

    b.close().await?;
    assert!(
        timeout(Duration::from_millis(100), s2.closed()).await.is_err(),
        "external stream must stay open after the adopting store closes"
    );

    a.close().await?;
    // The creating store owns the stream and destroys it.
    timeout(Duration::from_millis(100), s1.closed())
        .await
        .expect("owning store destroys its stream");
    Ok(())
}

#[tokio::test]
async fn inactive_sessions_do_not_trigger_attachment() -> Result<()> {
    let a = Corestore::memory()?;
    let b = Corestore::memory()?;

    let writer = a.get(GetOptions::from_name("idle").active(false)).await?;
    writer.append(&[Bytes::from_static(b"data")]).await?;

    let s1 = a.replicate(false).await?;
    let s2 = b.replicate(true).await?;
    pipe(&s1, &s2)?;

    // Neither side holds an active session, so nobody advertises.
    let reader = b
        .get(GetOptions::from_key(writer.key()).active(false).wait(false))
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        reader.get(0).await?,
        None,
        "inactive sessions do not drive replication"
    );

    a.close().await?;
    b.close().await?;
    Ok(())
}
