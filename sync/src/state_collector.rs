// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

//! Aggregated daemon-visible folder state.
//!
//! Every folder group publishes keyed JSON blobs here (`"secret"` once,
//! `"peers"` and `"traffic_stats"` on the state tick). The control server
//! reads snapshots out to serve the UI; this crate only writes.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use serde_json::Value;

use crate::secret::FolderId;

/// Cheaply cloneable sink for folder state. All methods are thread-safe.
#[derive(Debug, Clone, Default)]
pub struct StateCollector {
    folders: Arc<RwLock<HashMap<FolderId, HashMap<String, Value>>>>,
}

impl StateCollector {
    pub fn new() -> Self {
        Default::default()
    }

    /// Set one state key for a folder, creating the folder entry on first use.
    pub fn folder_state_set(&self, folder_id: FolderId, key: &str, value: Value) {
        let mut folders = self.folders.write().expect("state collector lock poisoned");
        folders
            .entry(folder_id)
            .or_default()
            .insert(key.to_owned(), value);
    }

    /// Drop all state for a folder. Called when the folder shuts down.
    pub fn folder_state_purge(&self, folder_id: FolderId) {
        let mut folders = self.folders.write().expect("state collector lock poisoned");
        folders.remove(&folder_id);
    }

    /// Snapshot of one folder's state keys.
    pub fn folder_state(&self, folder_id: FolderId) -> Option<HashMap<String, Value>> {
        let folders = self.folders.read().expect("state collector lock poisoned");
        folders.get(&folder_id).cloned()
    }

    /// Ids of all folders that currently have state.
    pub fn folder_ids(&self) -> Vec<FolderId> {
        let folders = self.folders.read().expect("state collector lock poisoned");
        folders.keys().copied().collect()
    }
}
