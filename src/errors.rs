// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed failure kinds surfaced by the store. Public APIs return
//! `anyhow::Result`; callers that need to branch on a kind downcast to
//! [`StoreError`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unrecognized or contradictory `get` options, wrong-sized buffers.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// `get` was supplied with none of name / key / key pair / manifest /
    /// discovery key / preload.
    #[error("no core identity supplied")]
    MissingIdentity,

    /// Operation attempted on a closing or closed store.
    #[error("store is closed")]
    StoreClosed,

    /// The persisted master seed disagrees with the caller-supplied one.
    #[error("primary key conflicts with the seed persisted in storage")]
    ConflictingSeed,

    /// Re-derived key for a named core does not match its stored key.
    #[error("derived key pair does not match the stored core key")]
    StoredKeyMismatch,

    /// Discovery-key-only open for a core that is not on disk.
    #[error("core is not present in storage")]
    StorageEmpty,

    /// A pending exclusive writable open whose store closed underneath it.
    #[error("exclusive open cancelled by store close")]
    ExclusiveWaitCancelled,

    /// Propagated from the core engine.
    #[error("engine failure: {0}")]
    Engine(String),
}
