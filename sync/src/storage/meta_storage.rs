// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    collections::HashMap,
    sync::RwLock,
};

use log::*;
use tokio::sync::broadcast;

use super::STORAGE_EVENT_CHANNEL_SIZE;
use crate::meta::{PathHash, PathRevision, SignedMeta};

const LOG_TARGET: &str = "sync::storage::meta";

/// Result of [`MetaStorage::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaPutOutcome {
    /// Newer than anything stored for the path; committed and announced.
    Stored,
    /// An equal or newer revision is already stored; nothing changed.
    Stale,
}

/// Signed-metadata index for one folder.
///
/// Holds at most one [`SignedMeta`] per path hash: the maximal revision seen.
/// Signature validity is the caller's responsibility — the indexer signs what
/// it produces and the meta exchange verifies before it stores, so everything
/// committed here announces with a valid signature.
#[derive(Debug)]
pub struct MetaStorage {
    entries: RwLock<HashMap<PathHash, SignedMeta>>,
    meta_added_tx: broadcast::Sender<SignedMeta>,
}

impl MetaStorage {
    pub fn new() -> Self {
        let (meta_added_tx, _) = broadcast::channel(STORAGE_EVENT_CHANNEL_SIZE);
        Self {
            entries: RwLock::new(HashMap::new()),
            meta_added_tx,
        }
    }

    /// Stream of metas as they are committed.
    pub fn subscribe(&self) -> broadcast::Receiver<SignedMeta> {
        self.meta_added_tx.subscribe()
    }

    /// Snapshot of every stored meta. Order is unspecified.
    pub fn get_meta(&self) -> Vec<SignedMeta> {
        let entries = self.entries.read().expect("meta storage lock poisoned");
        entries.values().cloned().collect()
    }

    /// The stored meta for a path, whatever its revision.
    pub fn get(&self, path_hash: PathHash) -> Option<SignedMeta> {
        let entries = self.entries.read().expect("meta storage lock poisoned");
        entries.get(&path_hash).cloned()
    }

    /// The stored meta only if it is exactly the requested revision.
    pub fn get_by_revision(&self, path_revision: PathRevision) -> Option<SignedMeta> {
        self.get(path_revision.path_hash)
            .filter(|smeta| smeta.meta().revision() == path_revision.revision)
    }

    /// Revision currently stored for a path, if any.
    pub fn stored_revision(&self, path_hash: PathHash) -> Option<u64> {
        self.get(path_hash).map(|smeta| smeta.meta().revision())
    }

    /// Commit a meta if it is newer than what is stored for its path.
    /// Emits `metaAdded` exactly once per committed meta.
    pub fn put(&self, smeta: SignedMeta) -> MetaPutOutcome {
        let revision = smeta.path_revision();
        {
            let mut entries = self.entries.write().expect("meta storage lock poisoned");
            match entries.get(&revision.path_hash) {
                Some(existing) if existing.meta().revision() >= revision.revision => {
                    trace!(
                        target: LOG_TARGET,
                        "Ignoring stale meta {} (stored revision {})",
                        revision,
                        existing.meta().revision()
                    );
                    return MetaPutOutcome::Stale;
                },
                _ => {
                    entries.insert(revision.path_hash, smeta.clone());
                },
            }
        }
        debug!(target: LOG_TARGET, "Committed meta {}", revision);
        // No subscribers is fine; the folder loop subscribes before any put.
        let _ = self.meta_added_tx.send(smeta);
        MetaPutOutcome::Stored
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("meta storage lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MetaStorage {
    fn default() -> Self {
        Self::new()
    }
}
