// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

//! Fetching side of the chunk exchange.
//!
//! The downloader tracks which chunks are still missing locally, which peers
//! claim to have them, and the choke state each peer applies to us. It
//! schedules block requests across unchoked claimants under a per-peer
//! concurrency window, reassembles arriving blocks and verifies whole chunks
//! before they are handed to storage.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

use bytes::Bytes;
use log::*;

use super::{config::TransferConfig, error::TransferError};
use crate::{
    bitfield::Bitfield,
    meta::{CtHash, SignedMeta},
    peer::{PeerKey, RemoteFolder},
    traffic::TrafficCounters,
};

const LOG_TARGET: &str = "sync::transfer::downloader";

/// What one `BlockReply` amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum PutBlockOutcome {
    /// More blocks outstanding, or a benign late duplicate.
    Incomplete,
    /// Last block arrived and the chunk verified; hand it to storage.
    Completed { ct_hash: CtHash, data: Bytes },
    /// Last block arrived but the assembly did not hash to `ct_hash`. The
    /// contributors were demoted and the chunk was rescheduled.
    HashMismatch { ct_hash: CtHash },
}

#[derive(Debug)]
struct DownloadPeer {
    remote: RemoteFolder,
    peer_choking: bool,
    am_interested: bool,
    /// Chunks this peer claims to have.
    claims: HashSet<CtHash>,
    /// Outstanding block requests to this peer.
    inflight: usize,
    /// Timeout and bad-data strikes; higher means scheduled later.
    strikes: u32,
    /// Round-robin marker: scheduling prefers the least recently assigned
    /// peer among equals.
    last_assigned: u64,
}

impl DownloadPeer {
    fn new(remote: RemoteFolder) -> Self {
        Self {
            remote,
            peer_choking: true,
            am_interested: false,
            claims: HashSet::new(),
            inflight: 0,
            strikes: 0,
            last_assigned: 0,
        }
    }
}

#[derive(Debug)]
struct RequestSlot {
    peer: PeerKey,
    size: u32,
    deadline: Instant,
}

#[derive(Debug)]
struct MissingChunk {
    size: u32,
    buffer: Vec<u8>,
    /// One bit per block.
    received: Bitfield,
    /// Outstanding request per block index.
    slots: HashMap<u32, RequestSlot>,
    /// Which peer supplied each received block, for demotion on a hash
    /// mismatch.
    contributors: HashMap<u32, PeerKey>,
    /// Peers claiming to have this chunk.
    owners: HashSet<PeerKey>,
}

impl MissingChunk {
    fn new(size: u32, block_size: u32) -> Self {
        let block_count = size.div_ceil(block_size).max(1) as usize;
        Self {
            size,
            buffer: vec![0u8; size as usize],
            received: Bitfield::new(block_count),
            slots: HashMap::new(),
            contributors: HashMap::new(),
            owners: HashSet::new(),
        }
    }

    fn block_count(&self) -> u32 {
        self.received.len() as u32
    }

    fn block_len(&self, index: u32, block_size: u32) -> u32 {
        let start = index * block_size;
        (self.size - start).min(block_size)
    }

    /// Lowest-offset block that is neither received nor requested.
    fn next_wanted_block(&self) -> Option<u32> {
        (0..self.block_count())
            .find(|i| !self.received.get(*i as usize) && !self.slots.contains_key(i))
    }

    fn reset_assembly(&mut self) {
        self.buffer.fill(0);
        self.received = Bitfield::new(self.received.len());
        self.contributors.clear();
    }
}

/// Fetching engine for one folder. Confined to the folder loop.
pub struct Downloader {
    config: TransferConfig,
    traffic: Arc<TrafficCounters>,
    peers: HashMap<PeerKey, DownloadPeer>,
    missing: HashMap<CtHash, MissingChunk>,
    /// Chunks known to be locally present and verified.
    have: HashSet<CtHash>,
    /// Monotonic assignment counter driving the round-robin.
    assignment_seq: u64,
}

impl Downloader {
    pub fn new(config: TransferConfig, traffic: Arc<TrafficCounters>) -> Self {
        Self {
            config,
            traffic,
            peers: HashMap::new(),
            missing: HashMap::new(),
            have: HashSet::new(),
            assignment_seq: 0,
        }
    }

    pub fn is_tracked(&self, peer: PeerKey) -> bool {
        self.peers.contains_key(&peer)
    }

    pub fn missing_count(&self) -> usize {
        self.missing.len()
    }

    /// Outstanding block requests to one peer.
    pub fn inflight_to(&self, peer: PeerKey) -> usize {
        self.peers.get(&peer).map(|p| p.inflight).unwrap_or(0)
    }

    pub fn track_remote(&mut self, remote: RemoteFolder) {
        self.peers.entry(remote.key()).or_insert_with(|| DownloadPeer::new(remote));
    }

    /// Forget a peer entirely: cancel its outstanding requests (the blocks
    /// return to the unassigned pool) and drop its claims.
    pub fn untrack_remote(&mut self, peer: PeerKey) {
        if self.peers.remove(&peer).is_none() {
            return;
        }
        for chunk in self.missing.values_mut() {
            chunk.owners.remove(&peer);
            chunk.slots.retain(|_, slot| slot.peer != peer);
        }
        self.schedule();
    }

    /// Register the chunks a local meta requires. Bits already set (chunks
    /// on disk) are recorded as present, everything else becomes eligible
    /// for scheduling.
    pub fn notify_local_meta(&mut self, smeta: &SignedMeta, bitfield: &Bitfield) {
        let chunks = smeta.meta().chunks();
        debug_assert_eq!(bitfield.len(), chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            if bitfield.get(i) {
                self.have.insert(chunk.ct_hash);
            } else if !self.have.contains(&chunk.ct_hash) {
                let block_size = self.config.block_size;
                let entry = self
                    .missing
                    .entry(chunk.ct_hash)
                    .or_insert_with(|| MissingChunk::new(chunk.size, block_size));
                // Peers may have announced the chunk before we learned of
                // the meta that needs it.
                for (key, peer) in &self.peers {
                    if peer.claims.contains(&chunk.ct_hash) {
                        entry.owners.insert(*key);
                    }
                }
            }
        }
        self.update_interest();
        self.schedule();
    }

    /// Put a chunk back on the missing list after a storage failure, so it
    /// is fetched again instead of being lost until restart.
    pub fn requeue_chunk(&mut self, ct_hash: CtHash, size: u32) {
        self.have.remove(&ct_hash);
        let block_size = self.config.block_size;
        let entry = self
            .missing
            .entry(ct_hash)
            .or_insert_with(|| MissingChunk::new(size, block_size));
        for (key, peer) in &self.peers {
            if peer.claims.contains(&ct_hash) {
                entry.owners.insert(*key);
            }
        }
        self.update_interest();
        self.schedule();
    }

    /// A chunk was verified and persisted locally; stop wanting it.
    pub fn notify_local_chunk(&mut self, ct_hash: CtHash) {
        self.have.insert(ct_hash);
        if let Some(chunk) = self.missing.remove(&ct_hash) {
            // Cancel outstanding requests for it.
            for slot in chunk.slots.values() {
                if let Some(peer) = self.peers.get_mut(&slot.peer) {
                    peer.inflight = peer.inflight.saturating_sub(1);
                }
            }
        }
        self.update_interest();
        self.schedule();
    }

    /// A peer announced possession of a chunk.
    pub fn notify_remote_chunk(&mut self, peer: PeerKey, ct_hash: CtHash) -> Result<(), TransferError> {
        let state = self
            .peers
            .get_mut(&peer)
            .ok_or(TransferError::PeerNotTracked(peer))?;
        state.claims.insert(ct_hash);
        if let Some(chunk) = self.missing.get_mut(&ct_hash) {
            chunk.owners.insert(peer);
        }
        self.update_interest();
        self.schedule();
        Ok(())
    }

    pub fn handle_choke(&mut self, peer: PeerKey) -> Result<(), TransferError> {
        let state = self
            .peers
            .get_mut(&peer)
            .ok_or(TransferError::PeerNotTracked(peer))?;
        state.peer_choking = true;
        state.inflight = 0;
        // A choking peer will not answer what is outstanding; requeue.
        for chunk in self.missing.values_mut() {
            chunk.slots.retain(|_, slot| slot.peer != peer);
        }
        Ok(())
    }

    pub fn handle_unchoke(&mut self, peer: PeerKey) -> Result<(), TransferError> {
        let state = self
            .peers
            .get_mut(&peer)
            .ok_or(TransferError::PeerNotTracked(peer))?;
        state.peer_choking = false;
        self.schedule();
        Ok(())
    }

    /// Accept one block. The reply must match an outstanding request from
    /// that exact peer, both in position and size.
    pub fn put_block(
        &mut self,
        peer: PeerKey,
        ct_hash: CtHash,
        offset: u32,
        data: Bytes,
    ) -> Result<PutBlockOutcome, TransferError> {
        if !self.peers.contains_key(&peer) {
            return Err(TransferError::PeerNotTracked(peer));
        }

        let block_size = self.config.block_size;
        let Some(chunk) = self.missing.get_mut(&ct_hash) else {
            if self.have.contains(&ct_hash) {
                // Late reply for a chunk completed from elsewhere.
                trace!(target: LOG_TARGET, "Late block for completed chunk {}", ct_hash);
                return Ok(PutBlockOutcome::Incomplete);
            }
            return Err(TransferError::violation(
                peer,
                format!("block for unknown chunk {}", ct_hash),
            ));
        };

        if offset % block_size != 0 || offset >= chunk.size {
            return Err(TransferError::violation(
                peer,
                format!("block at unaligned or out-of-range offset {}", offset),
            ));
        }
        let index = offset / block_size;

        let expected = match chunk.slots.get(&index) {
            Some(slot) if slot.peer == peer => slot.size,
            _ => {
                return Err(TransferError::violation(
                    peer,
                    format!("unrequested block {}+{} of chunk {}", offset, data.len(), ct_hash),
                ));
            },
        };
        chunk.slots.remove(&index);
        if let Some(state) = self.peers.get_mut(&peer) {
            state.inflight = state.inflight.saturating_sub(1);
        }
        if expected as usize != data.len() {
            return Err(TransferError::violation(
                peer,
                format!("block of {} bytes where {} were requested", data.len(), expected),
            ));
        }
        self.traffic.record_down(data.len() as u64);

        let start = offset as usize;
        chunk.buffer[start..start + data.len()].copy_from_slice(&data);
        chunk.received.set(index as usize, true);
        chunk.contributors.insert(index, peer);

        if !chunk.received.all_set() {
            self.schedule();
            return Ok(PutBlockOutcome::Incomplete);
        }

        // Whole chunk assembled: integrity is checked only now, across
        // whatever mix of peers contributed.
        if CtHash::compute(&chunk.buffer) == ct_hash {
            let chunk = self.missing.remove(&ct_hash).expect("entry exists");
            self.have.insert(ct_hash);
            self.update_interest();
            self.schedule();
            debug!(target: LOG_TARGET, "Chunk {} downloaded and verified", ct_hash);
            return Ok(PutBlockOutcome::Completed {
                ct_hash,
                data: Bytes::from(chunk.buffer),
            });
        }

        // Corrupt assembly: demote every contributor and start over with the
        // remaining owners.
        let contributors = chunk.contributors.values().copied().collect::<HashSet<_>>();
        chunk.reset_assembly();
        chunk.owners.retain(|k| !contributors.contains(k));
        warn!(
            target: LOG_TARGET,
            "Chunk {} failed verification; demoting {} contributor(s)",
            ct_hash,
            contributors.len()
        );
        for key in &contributors {
            if let Some(state) = self.peers.get_mut(key) {
                state.claims.remove(&ct_hash);
                state.strikes = state.strikes.saturating_add(1);
            }
        }
        self.update_interest();
        self.schedule();
        Ok(PutBlockOutcome::HashMismatch { ct_hash })
    }

    /// Requeue requests whose deadline passed, striking the slow peers.
    pub fn sweep(&mut self, now: Instant) {
        let mut timed_out: Vec<(CtHash, u32, PeerKey)> = Vec::new();
        for (ct_hash, chunk) in &mut self.missing {
            chunk.slots.retain(|index, slot| {
                if slot.deadline <= now {
                    timed_out.push((*ct_hash, *index, slot.peer));
                    false
                } else {
                    true
                }
            });
        }
        for (ct_hash, index, peer) in &timed_out {
            debug!(
                target: LOG_TARGET,
                "Block {} of chunk {} timed out at {}", index, ct_hash, peer
            );
            if let Some(state) = self.peers.get_mut(peer) {
                state.inflight = state.inflight.saturating_sub(1);
                state.strikes = state.strikes.saturating_add(1);
            }
        }
        if !timed_out.is_empty() {
            self.schedule();
        }
    }

    /// Issue block requests for every missing chunk that has an unchoked
    /// claimant with window room. Peers rotate round-robin among candidates
    /// with the fewest strikes.
    fn schedule(&mut self) {
        let block_size = self.config.block_size;
        let window = self.config.requests_per_peer;
        let ct_hashes = self.missing.keys().copied().collect::<Vec<_>>();

        for ct_hash in ct_hashes {
            loop {
                let Some(chunk) = self.missing.get(&ct_hash) else {
                    break;
                };
                let Some(index) = chunk.next_wanted_block() else {
                    break;
                };

                let candidate = chunk
                    .owners
                    .iter()
                    .filter_map(|key| self.peers.get(key).map(|p| (*key, p)))
                    .filter(|(_, p)| !p.peer_choking && p.inflight < window)
                    .min_by_key(|(_, p)| (p.strikes, p.last_assigned))
                    .map(|(key, _)| key);
                let Some(key) = candidate else {
                    break;
                };

                let chunk = self.missing.get_mut(&ct_hash).expect("entry exists");
                let size = chunk.block_len(index, block_size);
                let state = self.peers.get_mut(&key).expect("candidate is tracked");
                if state
                    .remote
                    .send_block_request(ct_hash, index * block_size, size)
                    .is_err()
                {
                    // Transport gone; the session close will untrack it.
                    state.strikes = state.strikes.saturating_add(1);
                    break;
                }
                self.assignment_seq += 1;
                state.inflight += 1;
                state.last_assigned = self.assignment_seq;
                chunk.slots.insert(index, RequestSlot {
                    peer: key,
                    size,
                    deadline: Instant::now() + self.config.block_request_timeout,
                });
            }
        }
    }

    /// Express interest to exactly the peers whose claims intersect the
    /// missing set.
    fn update_interest(&mut self) {
        for state in self.peers.values_mut() {
            let wanted = state.claims.iter().any(|ct| self.missing.contains_key(ct));
            if wanted == state.am_interested {
                continue;
            }
            state.am_interested = wanted;
            let result = if wanted {
                state.remote.send_interested()
            } else {
                state.remote.send_not_interested()
            };
            if let Err(err) = result {
                debug!(
                    target: LOG_TARGET,
                    "Failed to send interest change to {}: {}",
                    state.remote.key(),
                    err
                );
            }
        }
    }
}
