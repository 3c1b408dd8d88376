// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod cfg;
pub mod engine;
pub mod errors;
pub mod keys;
pub mod storage;
pub mod store;

pub use crate::{
    cfg::config::StoreOptions,
    errors::StoreError,
    store::{Corestore, GetOptions, Session, SessionOptions},
};
