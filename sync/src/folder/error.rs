// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum FolderError {
    /// The folder could not be brought up. The daemon may retry or
    /// quarantine the folder; nothing was spawned.
    #[error("Failed to prepare folder directory {path}: {source}")]
    Startup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid ignore pattern: {0}")]
    InvalidIgnorePattern(String),
    #[error("Folder actor is no longer running")]
    ActorDisconnected,
    #[error("Folder actor dropped the reply")]
    ActorResponseCancelled,
}
