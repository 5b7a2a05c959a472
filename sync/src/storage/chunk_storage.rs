// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    collections::HashMap,
    sync::RwLock,
};

use bytes::Bytes;
use log::*;
use tokio::sync::broadcast;

use super::{error::StorageError, STORAGE_EVENT_CHANNEL_SIZE};
use crate::{
    bitfield::Bitfield,
    meta::{CtHash, Meta},
};

const LOG_TARGET: &str = "sync::storage::chunk";

/// Content-addressed chunk store for one folder.
///
/// Chunks are opaque ciphertext; the store verifies the content hash on
/// `put_chunk` and serves sub-ranges through `read_block`. `chunkAdded` fires
/// at most once per content hash, after the chunk is verified and persisted.
#[derive(Debug)]
pub struct ChunkStorage {
    chunks: RwLock<HashMap<CtHash, Bytes>>,
    chunk_added_tx: broadcast::Sender<CtHash>,
}

impl ChunkStorage {
    pub fn new() -> Self {
        let (chunk_added_tx, _) = broadcast::channel(STORAGE_EVENT_CHANNEL_SIZE);
        Self {
            chunks: RwLock::new(HashMap::new()),
            chunk_added_tx,
        }
    }

    /// Stream of content hashes as chunks are committed.
    pub fn subscribe(&self) -> broadcast::Receiver<CtHash> {
        self.chunk_added_tx.subscribe()
    }

    pub fn have_chunk(&self, ct_hash: CtHash) -> bool {
        let chunks = self.chunks.read().expect("chunk storage lock poisoned");
        chunks.contains_key(&ct_hash)
    }

    /// Availability bitfield for a meta: bit `i` reflects possession of the
    /// meta's chunk `i`. Safe to call concurrently with `put_chunk`.
    pub fn make_bitfield(&self, meta: &Meta) -> Bitfield {
        let chunks = self.chunks.read().expect("chunk storage lock poisoned");
        let mut bitfield = Bitfield::new(meta.chunks().len());
        for (i, chunk) in meta.chunks().iter().enumerate() {
            if chunks.contains_key(&chunk.ct_hash) {
                bitfield.set(i, true);
            }
        }
        bitfield
    }

    /// Verify and persist a chunk. Returns `false` when the chunk was already
    /// present (no event is re-emitted), `true` on first commit.
    pub fn put_chunk(&self, ct_hash: CtHash, data: Bytes) -> Result<bool, StorageError> {
        if CtHash::compute(&data) != ct_hash {
            return Err(StorageError::ChunkHashMismatch { ct_hash });
        }

        {
            let mut chunks = self.chunks.write().expect("chunk storage lock poisoned");
            if chunks.contains_key(&ct_hash) {
                return Ok(false);
            }
            chunks.insert(ct_hash, data);
        }

        debug!(target: LOG_TARGET, "Committed chunk {}", ct_hash);
        let _ = self.chunk_added_tx.send(ct_hash);
        Ok(true)
    }

    /// Read a block out of a stored chunk. Zero-copy slice of the chunk.
    pub fn read_block(&self, ct_hash: CtHash, offset: u32, size: u32) -> Result<Bytes, StorageError> {
        let chunks = self.chunks.read().expect("chunk storage lock poisoned");
        let chunk = chunks
            .get(&ct_hash)
            .ok_or(StorageError::ChunkNotFound(ct_hash))?;

        let chunk_size = chunk.len() as u32;
        let end = offset.checked_add(size).filter(|&end| end <= chunk_size);
        match end {
            Some(end) => Ok(chunk.slice(offset as usize..end as usize)),
            None => Err(StorageError::BlockOutOfBounds {
                ct_hash,
                offset,
                size,
                chunk_size,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.read().expect("chunk storage lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChunkStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::meta::{ChunkRef, MetaKind, PathHash};

    fn stored_chunk(storage: &ChunkStorage, data: &'static [u8]) -> CtHash {
        let ct_hash = CtHash::compute(data);
        storage.put_chunk(ct_hash, Bytes::from_static(data)).unwrap();
        ct_hash
    }

    #[test]
    fn put_verifies_content_hash() {
        let storage = ChunkStorage::new();
        let wrong = CtHash::from_bytes([0; 32]);
        let err = storage.put_chunk(wrong, Bytes::from_static(b"data")).unwrap_err();
        assert_eq!(err, StorageError::ChunkHashMismatch { ct_hash: wrong });
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn chunk_added_fires_once() {
        let storage = ChunkStorage::new();
        let mut events = storage.subscribe();

        let ct_hash = CtHash::compute(b"payload");
        assert!(storage.put_chunk(ct_hash, Bytes::from_static(b"payload")).unwrap());
        // Idempotent re-put: stored, but no second event.
        assert!(!storage.put_chunk(ct_hash, Bytes::from_static(b"payload")).unwrap());

        assert_eq!(events.recv().await.unwrap(), ct_hash);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn read_block_slices_and_bounds_checks() {
        let storage = ChunkStorage::new();
        let ct_hash = stored_chunk(&storage, b"0123456789");

        assert_eq!(storage.read_block(ct_hash, 2, 3).unwrap(), Bytes::from_static(b"234"));
        assert_eq!(storage.read_block(ct_hash, 0, 10).unwrap(), Bytes::from_static(b"0123456789"));

        assert!(matches!(
            storage.read_block(ct_hash, 8, 3),
            Err(StorageError::BlockOutOfBounds { .. })
        ));
        assert!(matches!(
            storage.read_block(ct_hash, u32::MAX, 1),
            Err(StorageError::BlockOutOfBounds { .. })
        ));
        assert!(matches!(
            storage.read_block(CtHash::from_bytes([9; 32]), 0, 1),
            Err(StorageError::ChunkNotFound(_))
        ));
    }

    #[test]
    fn bitfield_reflects_present_chunks() {
        let storage = ChunkStorage::new();
        let have = stored_chunk(&storage, b"present");
        let missing = CtHash::compute(b"missing");

        let meta = Meta::new(
            PathHash::from_bytes([1; 32]),
            1,
            MetaKind::File,
            vec![
                ChunkRef { ct_hash: have, size: 7 },
                ChunkRef { ct_hash: missing, size: 7 },
            ],
        );

        let bitfield = storage.make_bitfield(&meta);
        assert!(bitfield.get(0));
        assert!(!bitfield.get(1));
        assert_eq!(bitfield.count_ones(), 1);
    }
}
