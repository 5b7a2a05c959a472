// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

//! Serving side of the chunk exchange.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use log::*;

use super::{
    choke::{CapUnchokePolicy, ChokePolicy},
    config::TransferConfig,
    error::TransferError,
};
use crate::{
    meta::CtHash,
    peer::{PeerKey, RemoteFolder},
    storage::{ChunkStorage, StorageError},
    traffic::TrafficCounters,
};

const LOG_TARGET: &str = "sync::transfer::uploader";

#[derive(Debug)]
struct UploadPeer {
    remote: RemoteFolder,
    am_choking: bool,
    peer_interested: bool,
    /// Content hashes already announced to this peer, so `HaveChunk` goes
    /// out at most once per (peer, chunk).
    announced: HashSet<CtHash>,
}

impl UploadPeer {
    fn new(remote: RemoteFolder) -> Self {
        Self {
            remote,
            am_choking: true,
            peer_interested: false,
            announced: HashSet::new(),
        }
    }
}

/// Answers block requests from unchoked peers and announces newly acquired
/// chunks. Tracks the `am_choking`/`peer_interested` half of the
/// flow-control state; which peers get unchoked is delegated to the
/// [`ChokePolicy`].
pub struct Uploader {
    config: TransferConfig,
    chunk_storage: Arc<ChunkStorage>,
    traffic: Arc<TrafficCounters>,
    peers: HashMap<PeerKey, UploadPeer>,
    /// Track order, oldest first; feeds the choke policy.
    order: Vec<PeerKey>,
    policy: Box<dyn ChokePolicy>,
}

impl Uploader {
    pub fn new(
        config: TransferConfig,
        chunk_storage: Arc<ChunkStorage>,
        traffic: Arc<TrafficCounters>,
    ) -> Self {
        let policy = Box::new(CapUnchokePolicy::new(config.unchoke_cap));
        Self::with_policy(config, chunk_storage, traffic, policy)
    }

    pub fn with_policy(
        config: TransferConfig,
        chunk_storage: Arc<ChunkStorage>,
        traffic: Arc<TrafficCounters>,
        policy: Box<dyn ChokePolicy>,
    ) -> Self {
        Self {
            config,
            chunk_storage,
            traffic,
            peers: HashMap::new(),
            order: Vec::new(),
            policy,
        }
    }

    /// Start serving a handshaken peer. Initial state chokes it.
    pub fn track_remote(&mut self, remote: RemoteFolder) {
        let key = remote.key();
        if self.peers.insert(key, UploadPeer::new(remote)).is_none() {
            self.order.push(key);
        }
    }

    pub fn untrack_remote(&mut self, peer: PeerKey) {
        if self.peers.remove(&peer).is_some() {
            self.order.retain(|k| *k != peer);
            self.rechoke();
        }
    }

    pub fn is_tracked(&self, peer: PeerKey) -> bool {
        self.peers.contains_key(&peer)
    }

    pub fn am_choking(&self, peer: PeerKey) -> Option<bool> {
        self.peers.get(&peer).map(|p| p.am_choking)
    }

    /// Announce a newly acquired chunk to every tracked (i.e. handshaken)
    /// peer, at most once per peer and chunk.
    pub fn broadcast_chunk(&mut self, ct_hash: CtHash) {
        for peer in self.peers.values_mut() {
            if !peer.announced.insert(ct_hash) {
                continue;
            }
            if let Err(err) = peer.remote.send_have_chunk(ct_hash) {
                debug!(
                    target: LOG_TARGET,
                    "Failed to announce chunk {} to {}: {}",
                    ct_hash,
                    peer.remote.key(),
                    err
                );
            }
        }
    }

    pub fn handle_interested(&mut self, peer: PeerKey) -> Result<(), TransferError> {
        let state = self
            .peers
            .get_mut(&peer)
            .ok_or(TransferError::PeerNotTracked(peer))?;
        state.peer_interested = true;
        self.rechoke();
        Ok(())
    }

    pub fn handle_not_interested(&mut self, peer: PeerKey) -> Result<(), TransferError> {
        let state = self
            .peers
            .get_mut(&peer)
            .ok_or(TransferError::PeerNotTracked(peer))?;
        state.peer_interested = false;
        self.rechoke();
        Ok(())
    }

    /// Serve one block. Requests from choked peers and for unknown chunks
    /// are dropped silently; an oversized request is a violation.
    pub fn handle_block_request(
        &mut self,
        peer: PeerKey,
        ct_hash: CtHash,
        offset: u32,
        size: u32,
    ) -> Result<(), TransferError> {
        let state = self
            .peers
            .get(&peer)
            .ok_or(TransferError::PeerNotTracked(peer))?;

        if size == 0 || size > self.config.block_size {
            return Err(TransferError::violation(
                peer,
                format!("block request of {} bytes (max {})", size, self.config.block_size),
            ));
        }
        if state.am_choking {
            trace!(
                target: LOG_TARGET,
                "Dropping block request from choked peer {}",
                peer
            );
            return Ok(());
        }

        match self.chunk_storage.read_block(ct_hash, offset, size) {
            Ok(data) => {
                let len = data.len() as u64;
                if state.remote.send_block_reply(ct_hash, offset, data).is_ok() {
                    self.traffic.record_up(len);
                }
                Ok(())
            },
            Err(StorageError::ChunkNotFound(_)) => {
                trace!(
                    target: LOG_TARGET,
                    "Peer {} requested unknown chunk {}",
                    peer,
                    ct_hash
                );
                Ok(())
            },
            Err(err @ StorageError::BlockOutOfBounds { .. }) => {
                Err(TransferError::violation(peer, err.to_string()))
            },
            Err(err) => Err(err.into()),
        }
    }

    /// Recompute the unchoked set and send the transitions.
    fn rechoke(&mut self) {
        let interested = self
            .order
            .iter()
            .copied()
            .filter(|key| self.peers.get(key).map(|p| p.peer_interested).unwrap_or(false))
            .collect::<Vec<_>>();
        let unchoked = self.policy.select_unchoked(&interested);

        for (key, state) in &mut self.peers {
            let should_choke = !unchoked.contains(key);
            if should_choke == state.am_choking {
                continue;
            }
            state.am_choking = should_choke;
            let result = if should_choke {
                state.remote.send_choke()
            } else {
                state.remote.send_unchoke()
            };
            if let Err(err) = result {
                debug!(target: LOG_TARGET, "Failed to send (un)choke to {}: {}", key, err);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;
    use crate::{
        peer::{PeerMessage, PeerSessionDriver},
        test_utils::peer_pair,
    };

    fn uploader_with_storage() -> (Uploader, Arc<ChunkStorage>) {
        let storage = Arc::new(ChunkStorage::new());
        let uploader = Uploader::new(
            TransferConfig::default(),
            storage.clone(),
            Arc::new(TrafficCounters::new()),
        );
        (uploader, storage)
    }

    fn drain(driver: &mut PeerSessionDriver) -> Vec<PeerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = driver.outbound_rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn interested_peer_gets_unchoked_up_to_cap() {
        let (mut uploader, _storage) = uploader_with_storage();
        let mut sessions = (0..5).map(|i| peer_pair(i as u8)).collect::<Vec<_>>();
        for (remote, _) in &sessions {
            uploader.track_remote(remote.clone());
        }

        for (remote, _) in &sessions {
            uploader.handle_interested(remote.key()).unwrap();
        }

        // Default cap is 4: the first four unchoked, the fifth stays choked.
        let unchoked = sessions
            .iter_mut()
            .map(|(_, driver)| drain(driver).contains(&PeerMessage::Unchoke))
            .collect::<Vec<_>>();
        assert_eq!(unchoked, vec![true, true, true, true, false]);

        // One slot frees up, the fifth peer takes it.
        uploader.handle_not_interested(sessions[0].0.key()).unwrap();
        assert!(drain(&mut sessions[0].1).contains(&PeerMessage::Choke));
        assert!(drain(&mut sessions[4].1).contains(&PeerMessage::Unchoke));
    }

    #[test]
    fn block_request_served_only_when_unchoked() {
        let (mut uploader, storage) = uploader_with_storage();
        let (remote, mut driver) = peer_pair(1);
        uploader.track_remote(remote.clone());

        let ct_hash = crate::meta::CtHash::compute(b"block bytes");
        storage.put_chunk(ct_hash, Bytes::from_static(b"block bytes")).unwrap();

        // Choked: dropped without reply.
        uploader.handle_block_request(remote.key(), ct_hash, 0, 5).unwrap();
        assert!(drain(&mut driver).is_empty());

        uploader.handle_interested(remote.key()).unwrap();
        drain(&mut driver);
        uploader.handle_block_request(remote.key(), ct_hash, 6, 5).unwrap();
        assert_eq!(
            drain(&mut driver),
            vec![PeerMessage::BlockReply {
                ct_hash,
                offset: 6,
                data: Bytes::from_static(b"bytes"),
            }]
        );
    }

    #[test]
    fn unknown_chunk_is_dropped_oversize_is_violation() {
        let (mut uploader, _storage) = uploader_with_storage();
        let (remote, mut driver) = peer_pair(1);
        uploader.track_remote(remote.clone());
        uploader.handle_interested(remote.key()).unwrap();
        drain(&mut driver);

        let ct_hash = crate::meta::CtHash::from_bytes([7; 32]);
        uploader.handle_block_request(remote.key(), ct_hash, 0, 16).unwrap();
        assert!(drain(&mut driver).is_empty());

        let oversize = TransferConfig::default().block_size + 1;
        let err = uploader
            .handle_block_request(remote.key(), ct_hash, 0, oversize)
            .unwrap_err();
        assert!(err.is_violation());
    }

    #[test]
    fn have_chunk_broadcast_is_deduplicated() {
        let (mut uploader, _storage) = uploader_with_storage();
        let (remote, mut driver) = peer_pair(1);
        uploader.track_remote(remote.clone());

        let ct_hash = crate::meta::CtHash::from_bytes([3; 32]);
        uploader.broadcast_chunk(ct_hash);
        uploader.broadcast_chunk(ct_hash);

        assert_eq!(drain(&mut driver), vec![PeerMessage::HaveChunk { ct_hash }]);
    }

    #[test]
    fn untracked_peer_is_reported() {
        let (mut uploader, _storage) = uploader_with_storage();
        let (remote, _driver) = peer_pair(1);
        assert!(matches!(
            uploader.handle_interested(remote.key()),
            Err(TransferError::PeerNotTracked(_))
        ));
    }
}
