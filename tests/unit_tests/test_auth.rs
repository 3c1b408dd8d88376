// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use corestore_rs::{
    GetOptions, StoreError,
    engine::{CoreEngine, Manifest, MemoryEngine},
    keys::{DEFAULT_NAMESPACE, KEY_LEN, KeyPair, create_key_pair},
    store::auth::resolve,
};

const PRIMARY: [u8; KEY_LEN] = [3u8; KEY_LEN];

fn engine() -> std::sync::Arc<MemoryEngine> {
    MemoryEngine::new()
}

#[test]
fn name_resolves_to_derived_key_pair() -> Result<()> {
    let engine = engine();
    let resolved = resolve(
        &GetOptions::from_name("main"),
        &PRIMARY,
        &DEFAULT_NAMESPACE,
        1,
        &*engine,
    )?;

    let expected = create_key_pair(&PRIMARY, &DEFAULT_NAMESPACE, b"main");
    let key_pair = resolved.key_pair.expect("named open derives a key pair");
    assert_eq!(key_pair.public_key, expected.public_key);

    let manifest = resolved.manifest.expect("named open carries a manifest");
    assert_eq!(manifest.version, 1);
    assert_eq!(manifest.signers.len(), 1);
    assert_eq!(manifest.signers[0].public_key, expected.public_key);

    let key = resolved.key.expect("named open has a key");
    assert_eq!(key, engine.key(&manifest));
    assert_eq!(resolved.discovery_key, engine.discovery_key(&key));

    let alias = resolved.alias.expect("named open registers an alias");
    assert_eq!(alias.name.as_ref(), b"main");
    assert_eq!(alias.namespace, DEFAULT_NAMESPACE);
    Ok(())
}

#[test]
fn name_wins_over_key() -> Result<()> {
    let engine = engine();
    let mut opts = GetOptions::from_name("main");
    opts.key = Some([9u8; KEY_LEN]);
    let resolved = resolve(&opts, &PRIMARY, &DEFAULT_NAMESPACE, 1, &*engine)?;
    let expected = create_key_pair(&PRIMARY, &DEFAULT_NAMESPACE, b"main");
    assert_eq!(
        resolved.key_pair.expect("key pair").public_key,
        expected.public_key
    );
    Ok(())
}

#[test]
fn name_with_caller_secret_key_rejected() {
    let engine = engine();
    let mut opts = GetOptions::from_name("main");
    opts.key_pair = Some(create_key_pair(&[5u8; KEY_LEN], &DEFAULT_NAMESPACE, b"x"));
    let err = resolve(&opts, &PRIMARY, &DEFAULT_NAMESPACE, 1, &*engine)
        .expect_err("name + secret key must be rejected");
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::InvalidInput(_))
    ));
}

#[test]
fn key_pair_resolves_to_single_signer_manifest() -> Result<()> {
    let engine = engine();
    let key_pair = create_key_pair(&PRIMARY, &DEFAULT_NAMESPACE, b"kp");
    let resolved = resolve(
        &GetOptions::from_key_pair(key_pair.clone()),
        &PRIMARY,
        &DEFAULT_NAMESPACE,
        2,
        &*engine,
    )?;
    let manifest = resolved.manifest.expect("manifest");
    assert_eq!(manifest.version, 2);
    assert_eq!(manifest.signers[0].public_key, key_pair.public_key);
    assert!(resolved.alias.is_none(), "no alias without a name");
    Ok(())
}

#[test]
fn manifest_resolves_key_without_key_pair() -> Result<()> {
    let engine = engine();
    let manifest = Manifest::single_signer(1, [4u8; KEY_LEN]);
    let resolved = resolve(
        &GetOptions::from_manifest(manifest.clone()),
        &PRIMARY,
        &DEFAULT_NAMESPACE,
        1,
        &*engine,
    )?;
    assert!(resolved.key_pair.is_none());
    assert_eq!(resolved.key.expect("key"), engine.key(&manifest));
    Ok(())
}

#[test]
fn bare_key_is_read_only() -> Result<()> {
    let engine = engine();
    let key = [6u8; KEY_LEN];
    let resolved = resolve(
        &GetOptions::from_key(key),
        &PRIMARY,
        &DEFAULT_NAMESPACE,
        1,
        &*engine,
    )?;
    assert!(resolved.key_pair.is_none());
    assert!(resolved.manifest.is_none(), "bare key leaves manifest unset");
    assert_eq!(resolved.discovery_key, engine.discovery_key(&key));
    Ok(())
}

#[test]
fn discovery_key_alone_is_remote_only() -> Result<()> {
    let engine = engine();
    let dk = [8u8; KEY_LEN];
    let resolved = resolve(
        &GetOptions::from_discovery_key(dk),
        &PRIMARY,
        &DEFAULT_NAMESPACE,
        1,
        &*engine,
    )?;
    assert!(resolved.key.is_none(), "key is unknown for remote-only opens");
    assert!(resolved.manifest.is_none());
    assert_eq!(resolved.discovery_key, dk);
    Ok(())
}

#[test]
fn missing_identity_rejected() {
    let engine = engine();
    let err = resolve(
        &GetOptions::default(),
        &PRIMARY,
        &DEFAULT_NAMESPACE,
        1,
        &*engine,
    )
    .expect_err("empty request must be rejected");
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::MissingIdentity)
    ));
}

#[test]
fn public_only_key_pair_is_not_a_secret() -> Result<()> {
    // A public-only key pair combined with a name is legal; only a caller
    // secret key conflicts.
    let engine = engine();
    let mut opts = GetOptions::from_name("main");
    opts.key_pair = Some(KeyPair::public_only([2u8; KEY_LEN]));
    let resolved = resolve(&opts, &PRIMARY, &DEFAULT_NAMESPACE, 1, &*engine)?;
    assert!(resolved.key_pair.expect("derived").secret_key.is_some());
    Ok(())
}
