// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-store registry of outstanding sessions, keyed by discovery key. The
//! engine-side reference count follows these lists: when a list empties the
//! entry is collected.

use std::{collections::HashMap, sync::Mutex};

use crate::store::session::Session;

#[derive(Default)]
pub struct SessionTracker {
    sessions: Mutex<HashMap<String, Vec<Session>>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session under the core id, creating the list lazily.
    pub fn add(&self, id: &str, session: Session) {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        sessions.entry(id.to_string()).or_default().push(session);
    }

    /// Removes one session by identity and GCs the list when it empties.
    pub fn remove(&self, id: &str, session: &Session) {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        if let Some(list) = sessions.get_mut(id) {
            list.retain(|s| !s.same_session(session));
            if list.is_empty() {
                sessions.remove(id);
            }
        }
    }

    /// Every live session across every core, in registration order per core.
    pub fn all(&self) -> Vec<Session> {
        let sessions = self.sessions.lock().expect("session lock poisoned");
        sessions.values().flatten().cloned().collect()
    }

    /// Drains the tracker for store close.
    pub fn take_all(&self) -> Vec<Session> {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        sessions.drain().flat_map(|(_, list)| list).collect()
    }

    pub fn len(&self) -> usize {
        let sessions = self.sessions.lock().expect("session lock poisoned");
        sessions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
