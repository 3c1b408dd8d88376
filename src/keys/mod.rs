// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Deterministic key material: namespace chaining, per-core seed derivation
//! and Ed25519 signing key-pairs, all rooted in a single 32-byte master seed.

use blake2b_simd::Params;
use ed25519_dalek::SigningKey;
use once_cell::sync::Lazy;
use rand::RngExt;

/// Every 32-byte identifier in the store (seeds, namespaces, keys,
/// discovery keys) has this length.
pub const KEY_LEN: usize = 32;

/// Namespace of the root store: all zeroes.
pub const DEFAULT_NAMESPACE: [u8; KEY_LEN] = [0u8; KEY_LEN];

/// Domain tag mixed into every seed derivation so that seeds can never
/// collide with other applications sharing the same master seed.
static NS: Lazy<[u8; KEY_LEN]> = Lazy::new(|| hash_unkeyed(&[b"corestore"]));

/// Ed25519 key pair. `secret_key` is the 32-byte seed form and is absent for
/// key pairs reconstructed from a public key alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public_key: [u8; KEY_LEN],
    pub secret_key: Option<[u8; KEY_LEN]>,
}

impl KeyPair {
    /// Wraps a bare verifier key (no signing capability).
    pub fn public_only(public_key: [u8; KEY_LEN]) -> Self {
        Self {
            public_key,
            secret_key: None,
        }
    }
}

fn hash_unkeyed(inputs: &[&[u8]]) -> [u8; KEY_LEN] {
    let mut state = Params::new().hash_length(KEY_LEN).to_state();
    for chunk in inputs {
        state.update(chunk);
    }
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(state.finalize().as_bytes());
    out
}

/// `H(parent_ns || name)`. Namespaces chain: deriving "a" then "b" is
/// distinct from deriving "b" then "a".
pub fn derive_namespace(parent: &[u8; KEY_LEN], name: &[u8]) -> [u8; KEY_LEN] {
    hash_unkeyed(&[parent, name])
}

/// `H_keyed(NS || ns || name; key = primary_key)`. Inputs are
/// length-unprefixed; the domain tag plus the namespace provide the
/// cross-domain separation.
pub fn derive_seed(
    primary_key: &[u8; KEY_LEN],
    ns: &[u8; KEY_LEN],
    name: &[u8],
) -> [u8; KEY_LEN] {
    let mut state = Params::new()
        .hash_length(KEY_LEN)
        .key(primary_key)
        .to_state();
    state.update(NS.as_slice());
    state.update(ns);
    state.update(name);
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(state.finalize().as_bytes());
    out
}

/// Derives the signing key pair for `(primary_key, ns, name)`. A zero-length
/// `name` is legal; text names are hashed as their UTF-8 bytes.
pub fn create_key_pair(
    primary_key: &[u8; KEY_LEN],
    ns: &[u8; KEY_LEN],
    name: &[u8],
) -> KeyPair {
    let seed = derive_seed(primary_key, ns, name);
    let signing = SigningKey::from_bytes(&seed);
    KeyPair {
        public_key: signing.verifying_key().to_bytes(),
        secret_key: Some(seed),
    }
}

/// Fresh 32 bytes from the CSPRNG. Used for master seeds and opaque tokens.
pub fn create_token() -> [u8; KEY_LEN] {
    let mut token = [0u8; KEY_LEN];
    rand::rng().fill(&mut token);
    token
}
