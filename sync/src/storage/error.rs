// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

use crate::meta::CtHash;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Chunk {0} is not in the store")]
    ChunkNotFound(CtHash),
    #[error("Chunk {ct_hash} bytes do not hash to their content hash")]
    ChunkHashMismatch { ct_hash: CtHash },
    #[error("Block {offset}+{size} is out of bounds for chunk {ct_hash} ({chunk_size} bytes)")]
    BlockOutOfBounds {
        ct_hash: CtHash,
        offset: u32,
        size: u32,
        chunk_size: u32,
    },
}
