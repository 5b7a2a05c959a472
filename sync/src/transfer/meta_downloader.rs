// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

//! Fetching side of the meta exchange.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Instant,
};

use log::*;

use super::{config::TransferConfig, error::TransferError};
use crate::{
    bitfield::Bitfield,
    meta::{PathRevision, SignedMeta},
    peer::{PeerKey, RemoteFolder},
    secret::Secret,
    storage::{MetaPutOutcome, MetaStorage},
};

const LOG_TARGET: &str = "sync::transfer::meta_downloader";

/// What a `HaveMeta` announcement amounted to.
#[derive(Debug)]
pub enum HaveMetaOutcome {
    /// We hold a strictly newer revision; the announcement was discarded.
    Stale,
    /// We hold exactly this revision; the peer's bitfield applies to it.
    Known(RecordedBitfield),
    /// A `MetaRequest` went out to the announcer.
    Requested,
    /// A request for this revision is already in flight; the announcer was
    /// remembered as a fallback.
    Pending,
}

/// A peer's availability bitfield, resolved against the meta it covers, for
/// the coordinator to feed into the downloader.
#[derive(Debug)]
pub struct RecordedBitfield {
    pub peer: PeerKey,
    pub smeta: SignedMeta,
    pub bitfield: Bitfield,
}

#[derive(Debug)]
struct InflightMeta {
    peer: PeerKey,
    deadline: Instant,
    fallbacks: VecDeque<PeerKey>,
}

/// Requests announced metas, verifies the replies and commits them. Enforces
/// the single global in-flight request per (path, revision).
pub struct MetaDownloader {
    config: TransferConfig,
    secret: Secret,
    meta_storage: Arc<MetaStorage>,
    peers: HashMap<PeerKey, RemoteFolder>,
    inflight: HashMap<PathRevision, InflightMeta>,
}

impl MetaDownloader {
    pub fn new(config: TransferConfig, secret: Secret, meta_storage: Arc<MetaStorage>) -> Self {
        Self {
            config,
            secret,
            meta_storage,
            peers: HashMap::new(),
            inflight: HashMap::new(),
        }
    }

    pub fn track_remote(&mut self, remote: RemoteFolder) {
        self.peers.insert(remote.key(), remote);
    }

    /// Stop using a peer. Its in-flight requests are reissued to fallback
    /// announcers where possible.
    pub fn untrack_remote(&mut self, peer: PeerKey) {
        self.peers.remove(&peer);
        let now = Instant::now();
        let assigned = self
            .inflight
            .iter()
            .filter(|(_, fl)| fl.peer == peer)
            .map(|(rev, _)| *rev)
            .collect::<Vec<_>>();
        for revision in assigned {
            self.reissue(revision, now);
        }
        for inflight in self.inflight.values_mut() {
            inflight.fallbacks.retain(|k| *k != peer);
        }
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_inflight(&self, revision: PathRevision) -> bool {
        self.inflight.contains_key(&revision)
    }

    /// React to a `HaveMeta` announcement.
    pub fn handle_have_meta(
        &mut self,
        peer: PeerKey,
        revision: PathRevision,
        bitfield: Bitfield,
    ) -> Result<HaveMetaOutcome, TransferError> {
        if !self.peers.contains_key(&peer) {
            return Err(TransferError::PeerNotTracked(peer));
        }

        match self.meta_storage.stored_revision(revision.path_hash) {
            Some(stored) if stored > revision.revision => {
                trace!(
                    target: LOG_TARGET,
                    "Discarding stale announcement {} from {} (stored revision {})",
                    revision,
                    peer,
                    stored
                );
                Ok(HaveMetaOutcome::Stale)
            },
            Some(stored) if stored == revision.revision => {
                let smeta = self
                    .meta_storage
                    .get_by_revision(revision)
                    .expect("stored revision just matched");
                if bitfield.len() != smeta.meta().chunks().len() {
                    return Err(TransferError::violation(
                        peer,
                        format!(
                            "bitfield of {} bits for meta {} with {} chunks",
                            bitfield.len(),
                            revision,
                            smeta.meta().chunks().len()
                        ),
                    ));
                }
                Ok(HaveMetaOutcome::Known(RecordedBitfield {
                    peer,
                    smeta,
                    bitfield,
                }))
            },
            _ => self.request_meta(peer, revision),
        }
    }

    /// React to a `MetaReply`. On success the meta is committed (MetaStorage
    /// announces it) and the replier's bitfield is returned for the
    /// downloader.
    pub fn handle_meta_reply(
        &mut self,
        peer: PeerKey,
        smeta: SignedMeta,
        bitfield: Bitfield,
    ) -> Result<Option<RecordedBitfield>, TransferError> {
        if !self.peers.contains_key(&peer) {
            return Err(TransferError::PeerNotTracked(peer));
        }
        let revision = smeta.path_revision();

        let solicited = matches!(
            self.inflight.get(&revision),
            Some(inflight) if inflight.peer == peer
        );
        if !solicited {
            return Err(TransferError::violation(
                peer,
                format!("unsolicited meta reply for {}", revision),
            ));
        }
        self.inflight.remove(&revision);

        if !smeta.verify(&self.secret) {
            return Err(TransferError::violation(
                peer,
                format!("invalid signature on meta {}", revision),
            ));
        }
        if bitfield.len() != smeta.meta().chunks().len() {
            return Err(TransferError::violation(
                peer,
                format!("bitfield length mismatch on meta {}", revision),
            ));
        }

        match self.meta_storage.put(smeta.clone()) {
            MetaPutOutcome::Stored => Ok(Some(RecordedBitfield {
                peer,
                smeta,
                bitfield,
            })),
            MetaPutOutcome::Stale => {
                // Lost a race against a newer revision; the reply's bitfield
                // no longer applies to anything we want.
                trace!(
                    target: LOG_TARGET,
                    "Meta reply {} from {} was obsolete on arrival",
                    revision,
                    peer
                );
                Ok(None)
            },
        }
    }

    /// Reissue requests whose deadline passed.
    pub fn sweep(&mut self, now: Instant) {
        let expired = self
            .inflight
            .iter()
            .filter(|(_, fl)| fl.deadline <= now)
            .map(|(rev, _)| *rev)
            .collect::<Vec<_>>();
        for revision in expired {
            debug!(target: LOG_TARGET, "Meta request {} timed out", revision);
            self.reissue(revision, now);
        }
    }

    fn request_meta(&mut self, peer: PeerKey, revision: PathRevision) -> Result<HaveMetaOutcome, TransferError> {
        if let Some(inflight) = self.inflight.get_mut(&revision) {
            if inflight.peer != peer && !inflight.fallbacks.contains(&peer) {
                inflight.fallbacks.push_back(peer);
            }
            return Ok(HaveMetaOutcome::Pending);
        }

        let remote = self.peers.get(&peer).expect("caller checked peer is tracked");
        if let Err(err) = remote.send_meta_request(revision) {
            debug!(
                target: LOG_TARGET,
                "Failed to request meta {} from {}: {}", revision, peer, err
            );
            return Ok(HaveMetaOutcome::Pending);
        }
        debug!(target: LOG_TARGET, "Requested meta {} from {}", revision, peer);
        self.inflight.insert(revision, InflightMeta {
            peer,
            deadline: Instant::now() + self.config.meta_request_timeout,
            fallbacks: VecDeque::new(),
        });
        Ok(HaveMetaOutcome::Requested)
    }

    /// Hand an in-flight request over to the next usable fallback announcer,
    /// or drop it so a future announcement can retry.
    fn reissue(&mut self, revision: PathRevision, now: Instant) {
        let Some(mut inflight) = self.inflight.remove(&revision) else {
            return;
        };
        while let Some(next) = inflight.fallbacks.pop_front() {
            let Some(remote) = self.peers.get(&next) else {
                continue;
            };
            if remote.send_meta_request(revision).is_ok() {
                debug!(
                    target: LOG_TARGET,
                    "Reissued meta request {} to {}", revision, next
                );
                inflight.peer = next;
                inflight.deadline = now + self.config.meta_request_timeout;
                self.inflight.insert(revision, inflight);
                return;
            }
        }
        debug!(
            target: LOG_TARGET,
            "Dropped meta request {} (no fallback announcer)", revision
        );
    }
}
