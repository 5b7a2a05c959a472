// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

//! # Rivulet sync core
//!
//! The per-folder synchronization core of the rivulet daemon. One
//! [`FolderGroup`](folder::FolderGroup) is spawned per shared folder; it owns
//! the folder's metadata index and chunk store, tracks the remote peers the
//! transport attaches to it, and drives the meta/chunk exchange that converges
//! every participant toward the newest signed revision of every path.
//!
//! The transport layer (sockets, framing, handshake crypto) and the
//! path-indexer live outside this crate. They interact with the core through
//! [`RemoteFolder`](peer::RemoteFolder) session handles and the storage APIs.

pub mod bitfield;
pub mod config;
pub mod folder;
pub mod meta;
pub mod path;
pub mod peer;
pub mod secret;
pub mod state_collector;
pub mod storage;
pub mod traffic;
pub mod transfer;

pub mod test_utils;

pub use bitfield::Bitfield;
pub use config::FolderParams;
pub use folder::{FolderEvent, FolderGroup, FolderGroupHandle};
pub use meta::{ChunkRef, Meta, MetaKind, PathRevision, SignedMeta};
pub use peer::RemoteFolder;
pub use secret::{FolderId, Secret, SecretKind};
