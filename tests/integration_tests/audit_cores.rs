// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::Bytes;
use corestore_rs::{StoreOptions, engine::AuditOptions};
use futures::TryStreamExt;

use crate::integration_tests::common::{TestRoot, init_test_logger};

#[tokio::test]
async fn audit_reports_every_persisted_core() -> Result<()> {
    init_test_logger();
    let root = TestRoot::new();
    let store = root.store(StoreOptions::default())?;

    let a = store.get("a").await?;
    a.append(&[Bytes::from_static(b"1"), Bytes::from_static(b"2")]).await?;
    let b = store.get("b").await?;
    b.append(&[Bytes::from_static(b"3")]).await?;

    let mut entries: Vec<_> = store
        .audit(AuditOptions { dry_run: true })
        .try_collect()
        .await?;
    entries.sort_unstable_by_key(|entry| entry.discovery_key);

    let mut expected = vec![
        (a.discovery_key(), a.key(), 2u64),
        (b.discovery_key(), b.key(), 1u64),
    ];
    expected.sort_unstable_by_key(|(dk, _, _)| *dk);

    assert_eq!(entries.len(), 2);
    for (entry, (dk, key, blocks)) in entries.iter().zip(expected) {
        assert_eq!(entry.discovery_key, dk);
        assert_eq!(entry.key, key);
        assert_eq!(entry.audit.blocks_checked, blocks);
        assert_eq!(entry.audit.blocks_dropped, 0);
    }

    store.close().await?;
    Ok(())
}

#[tokio::test]
async fn dry_run_reports_without_mutating() -> Result<()> {
    let root = TestRoot::new();
    let store = root.store(StoreOptions::default())?;

    let session = store.get("damaged").await?;
    session
        .append(&[Bytes::from_static(b"ok"), Bytes::from_static(b"bad")])
        .await?;
    root.engine.corrupt_block(&session.discovery_key(), 1);

    let entries: Vec<_> = store
        .audit(AuditOptions { dry_run: true })
        .try_collect()
        .await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].audit.blocks_dropped, 1);

    // Nothing was mutated: a second dry run finds the damage again.
    let entries: Vec<_> = store
        .audit(AuditOptions { dry_run: true })
        .try_collect()
        .await?;
    assert_eq!(entries[0].audit.blocks_dropped, 1);

    store.close().await?;
    Ok(())
}

#[tokio::test]
async fn destructive_audit_drops_bad_blocks() -> Result<()> {
    let root = TestRoot::new();
    let store = root.store(StoreOptions::default())?;

    let session = store.get("damaged").await?;
    session
        .append(&[Bytes::from_static(b"ok"), Bytes::from_static(b"bad")])
        .await?;
    root.engine.corrupt_block(&session.discovery_key(), 1);

    let entries: Vec<_> = store
        .audit(AuditOptions { dry_run: false })
        .try_collect()
        .await?;
    assert_eq!(entries[0].audit.blocks_dropped, 1);

    // The damage is gone now.
    let entries: Vec<_> = store
        .audit(AuditOptions { dry_run: false })
        .try_collect()
        .await?;
    assert_eq!(entries[0].audit.blocks_dropped, 0);

    let reader = store
        .get(corestore_rs::GetOptions::from_name("damaged").wait(false))
        .await?;
    assert_eq!(
        reader.get(1).await?,
        None,
        "the dropped block is no longer readable"
    );

    store.close().await?;
    Ok(())
}
