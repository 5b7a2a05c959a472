// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

//! Serving side of the meta exchange.

use std::sync::Arc;

use log::*;

use crate::{
    bitfield::Bitfield,
    meta::PathRevision,
    peer::RemoteFolder,
    storage::{ChunkStorage, MetaStorage},
};

const LOG_TARGET: &str = "sync::transfer::meta_uploader";

/// Answers meta requests and announces local metas. Stateless apart from its
/// storage handles: the coordinator decides which peers it talks to.
pub struct MetaUploader {
    meta_storage: Arc<MetaStorage>,
    chunk_storage: Arc<ChunkStorage>,
}

impl MetaUploader {
    pub fn new(meta_storage: Arc<MetaStorage>, chunk_storage: Arc<ChunkStorage>) -> Self {
        Self {
            meta_storage,
            chunk_storage,
        }
    }

    /// Announce one meta revision to the given peers.
    pub fn broadcast_meta(&self, peers: &[RemoteFolder], revision: PathRevision, bitfield: &Bitfield) {
        for peer in peers {
            if let Err(err) = peer.send_have_meta(revision, bitfield.clone()) {
                debug!(
                    target: LOG_TARGET,
                    "Failed to announce meta {} to {}: {}",
                    revision,
                    peer.key(),
                    err
                );
            }
        }
    }

    /// Serve one meta request. Unknown revisions are dropped silently; the
    /// requester retries or times out.
    pub fn handle_meta_request(&self, peer: &RemoteFolder, revision: PathRevision) {
        match self.meta_storage.get_by_revision(revision) {
            Some(smeta) => {
                let bitfield = self.chunk_storage.make_bitfield(smeta.meta());
                if let Err(err) = peer.send_meta_reply(smeta, bitfield) {
                    debug!(
                        target: LOG_TARGET,
                        "Failed to reply meta {} to {}: {}",
                        revision,
                        peer.key(),
                        err
                    );
                }
            },
            None => {
                trace!(
                    target: LOG_TARGET,
                    "Peer {} requested unknown meta {}",
                    peer.key(),
                    revision
                );
            },
        }
    }

    /// Advertise everything we know to a freshly handshaken peer.
    pub fn handle_handshake(&self, peer: &RemoteFolder) {
        let metas = self.meta_storage.get_meta();
        debug!(
            target: LOG_TARGET,
            "Advertising {} meta(s) to {}",
            metas.len(),
            peer.key()
        );
        for smeta in metas {
            let bitfield = self.chunk_storage.make_bitfield(smeta.meta());
            if let Err(err) = peer.send_have_meta(smeta.path_revision(), bitfield) {
                debug!(
                    target: LOG_TARGET,
                    "Failed to advertise meta to {}: {}",
                    peer.key(),
                    err
                );
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;
    use crate::{
        meta::{ChunkRef, CtHash, Meta, MetaKind, PathHash, SignedMeta},
        peer::PeerMessage,
        secret::{Secret, SecretKind},
        test_utils::peer_pair,
    };

    fn setup() -> (MetaUploader, Arc<MetaStorage>, Arc<ChunkStorage>, Secret) {
        let meta_storage = Arc::new(MetaStorage::new());
        let chunk_storage = Arc::new(ChunkStorage::new());
        let uploader = MetaUploader::new(meta_storage.clone(), chunk_storage.clone());
        (uploader, meta_storage, chunk_storage, Secret::generate(SecretKind::Owner))
    }

    fn store_meta(
        meta_storage: &MetaStorage,
        secret: &Secret,
        path_fill: u8,
        chunks: Vec<ChunkRef>,
    ) -> SignedMeta {
        let meta = Meta::new(PathHash::from_bytes([path_fill; 32]), 1, MetaKind::File, chunks);
        let smeta = SignedMeta::sign(meta, secret).unwrap();
        meta_storage.put(smeta.clone());
        smeta
    }

    #[test]
    fn meta_request_served_with_bitfield() {
        let (uploader, meta_storage, chunk_storage, secret) = setup();
        let data = Bytes::from_static(b"chunk");
        let ct_hash = CtHash::compute(&data);
        chunk_storage.put_chunk(ct_hash, data).unwrap();

        let smeta = store_meta(
            &meta_storage,
            &secret,
            1,
            vec![
                ChunkRef { ct_hash, size: 5 },
                ChunkRef { ct_hash: CtHash::from_bytes([9; 32]), size: 5 },
            ],
        );

        let (remote, mut driver) = peer_pair(1);
        uploader.handle_meta_request(&remote, smeta.path_revision());

        match driver.outbound_rx.try_recv().unwrap() {
            PeerMessage::MetaReply { smeta: reply, bitfield } => {
                assert_eq!(reply, smeta);
                assert!(bitfield.get(0));
                assert!(!bitfield.get(1));
            },
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn unknown_revision_is_dropped() {
        let (uploader, _meta_storage, _chunk_storage, _secret) = setup();
        let (remote, mut driver) = peer_pair(1);
        uploader.handle_meta_request(
            &remote,
            PathRevision {
                path_hash: PathHash::from_bytes([1; 32]),
                revision: 7,
            },
        );
        assert!(driver.outbound_rx.try_recv().is_err());
    }

    #[test]
    fn handshake_advertises_every_meta() {
        let (uploader, meta_storage, _chunk_storage, secret) = setup();
        let a = store_meta(&meta_storage, &secret, 1, vec![ChunkRef {
            ct_hash: CtHash::from_bytes([1; 32]),
            size: 4,
        }]);
        let b = store_meta(&meta_storage, &secret, 2, vec![ChunkRef {
            ct_hash: CtHash::from_bytes([2; 32]),
            size: 4,
        }]);

        let (remote, mut driver) = peer_pair(1);
        uploader.handle_handshake(&remote);

        let mut announced = Vec::new();
        while let Ok(PeerMessage::HaveMeta { revision, .. }) = driver.outbound_rx.try_recv() {
            announced.push(revision);
        }
        assert_eq!(announced.len(), 2);
        assert!(announced.contains(&a.path_revision()));
        assert!(announced.contains(&b.path_revision()));
    }
}
