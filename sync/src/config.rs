// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

use std::path::PathBuf;

use crate::secret::{FolderId, Secret};

/// Immutable per-folder parameters, fixed for the folder's lifetime.
#[derive(Clone, Debug)]
pub struct FolderParams {
    /// Directory being replicated.
    pub root: PathBuf,
    /// Private directory for folder-internal state (index, assembling files).
    pub system_path: PathBuf,
    /// Folder credential; its public hash is the folder id.
    pub secret: Secret,
    /// User-defined glob patterns excluded from replication.
    pub ignore_patterns: Vec<String>,
}

impl FolderParams {
    pub fn new(root: impl Into<PathBuf>, secret: Secret) -> Self {
        let root = root.into();
        let system_path = root.join(".rivulet");
        Self {
            root,
            system_path,
            secret,
            ignore_patterns: Vec::new(),
        }
    }

    pub fn folder_id(&self) -> FolderId {
        self.secret.folder_id()
    }
}
