// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

//! The per-folder coordinator.
//!
//! [`FolderGroup`] owns one folder's storage, collaborators and transfer
//! engines, and runs the actor that wires local index events and per-peer
//! protocol messages together. Everything stateful runs on one task; the
//! outside world talks to it through the cloneable [`FolderGroupHandle`].

mod config;
mod error;
mod group;
mod handle;
mod registry;

pub use config::FolderConfig;
pub use error::FolderError;
pub use group::FolderGroup;
pub use handle::{FolderEvent, FolderEventRx, FolderGroupHandle};
pub use registry::RegistryCounts;
