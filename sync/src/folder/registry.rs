// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
};

use tokio::task::JoinHandle;

use crate::peer::{PeerDigest, PeerKey, RemoteFolder};

/// Owner of everything subscribed on behalf of one attached peer. Dropping
/// the bundle (on detach) aborts the forwarder task, so no further event from
/// that session can reach the folder loop.
#[derive(Debug)]
pub(crate) struct SubscriptionBundle {
    forwarder: JoinHandle<()>,
}

impl SubscriptionBundle {
    pub fn new(forwarder: JoinHandle<()>) -> Self {
        Self { forwarder }
    }
}

impl Drop for SubscriptionBundle {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

#[derive(Debug)]
pub(crate) struct AttachedPeer {
    pub remote: RemoteFolder,
    #[allow(dead_code)] // held for its Drop
    bundle: SubscriptionBundle,
}

/// Snapshot of the registry index sizes, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryCounts {
    pub remotes: usize,
    pub digests: usize,
    pub endpoints: usize,
    pub ready: usize,
}

/// The three peer indices plus the ready set, mutated together so the
/// bijection between handles, digests and endpoints always holds.
#[derive(Debug, Default)]
pub(crate) struct PeerRegistry {
    peers: HashMap<PeerKey, AttachedPeer>,
    digests: HashSet<PeerDigest>,
    endpoints: HashSet<SocketAddr>,
    ready: HashSet<PeerKey>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Whether this remote can be admitted: its handle, digest and endpoint
    /// must all be unknown.
    pub fn can_attach(&self, remote: &RemoteFolder) -> bool {
        !self.peers.contains_key(&remote.key())
            && !self.digests.contains(&remote.digest())
            && !self.endpoints.contains(&remote.endpoint())
    }

    /// Insert an admissible remote. Returns `false` (and changes nothing) if
    /// any index already knows it.
    pub fn insert(&mut self, remote: RemoteFolder, bundle: SubscriptionBundle) -> bool {
        if !self.can_attach(&remote) {
            return false;
        }
        self.digests.insert(remote.digest());
        self.endpoints.insert(remote.endpoint());
        self.peers.insert(remote.key(), AttachedPeer { remote, bundle });
        true
    }

    /// Remove a peer from every index. The returned entry keeps the
    /// subscription bundle alive until the caller drops it.
    pub fn remove(&mut self, key: PeerKey) -> Option<AttachedPeer> {
        let attached = self.peers.remove(&key)?;
        self.digests.remove(&attached.remote.digest());
        self.endpoints.remove(&attached.remote.endpoint());
        self.ready.remove(&key);
        Some(attached)
    }

    pub fn is_attached(&self, key: PeerKey) -> bool {
        self.peers.contains_key(&key)
    }

    pub fn get(&self, key: PeerKey) -> Option<&RemoteFolder> {
        self.peers.get(&key).map(|p| &p.remote)
    }

    /// Mark a peer as handshaken. Returns `false` if it already was, or is
    /// not attached.
    pub fn mark_ready(&mut self, key: PeerKey) -> bool {
        if !self.peers.contains_key(&key) {
            return false;
        }
        self.ready.insert(key)
    }

    pub fn is_ready(&self, key: PeerKey) -> bool {
        self.ready.contains(&key)
    }

    pub fn remotes(&self) -> Vec<RemoteFolder> {
        self.peers.values().map(|p| p.remote.clone()).collect()
    }

    pub fn ready_remotes(&self) -> Vec<RemoteFolder> {
        self.ready
            .iter()
            .filter_map(|key| self.peers.get(key))
            .map(|p| p.remote.clone())
            .collect()
    }

    pub fn counts(&self) -> RegistryCounts {
        RegistryCounts {
            remotes: self.peers.len(),
            digests: self.digests.len(),
            endpoints: self.endpoints.len(),
            ready: self.ready.len(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{peer_pair, peer_pair_at};

    fn bundle() -> SubscriptionBundle {
        SubscriptionBundle::new(tokio::spawn(std::future::pending()))
    }

    #[tokio::test]
    async fn indices_stay_bijective() {
        let mut registry = PeerRegistry::new();
        let (a, _da) = peer_pair(1);
        let (b, _db) = peer_pair(2);

        assert!(registry.insert(a.clone(), bundle()));
        assert!(registry.insert(b.clone(), bundle()));
        let counts = registry.counts();
        assert_eq!((counts.remotes, counts.digests, counts.endpoints), (2, 2, 2));

        registry.remove(a.key()).unwrap();
        let counts = registry.counts();
        assert_eq!((counts.remotes, counts.digests, counts.endpoints), (1, 1, 1));
        assert!(!registry.is_attached(a.key()));
        assert!(registry.is_attached(b.key()));
    }

    #[tokio::test]
    async fn duplicate_handle_digest_or_endpoint_rejected() {
        let mut registry = PeerRegistry::new();
        let (a, _da) = peer_pair(1);
        assert!(registry.insert(a.clone(), bundle()));

        // Same handle again.
        assert!(!registry.insert(a.clone(), bundle()));
        // Same digest, different endpoint.
        let (same_digest, _d1) = peer_pair(1);
        assert!(!registry.insert(same_digest, bundle()));
        // Same endpoint, different digest.
        let (same_endpoint, _d2) = peer_pair_at(3, a.endpoint());
        assert!(!registry.insert(same_endpoint, bundle()));

        assert_eq!(registry.counts().remotes, 1);
    }

    #[tokio::test]
    async fn ready_is_subset_of_remotes() {
        let mut registry = PeerRegistry::new();
        let (a, _da) = peer_pair(1);
        let (b, _db) = peer_pair(2);
        registry.insert(a.clone(), bundle());
        registry.insert(b.clone(), bundle());

        assert!(registry.mark_ready(a.key()));
        assert!(!registry.mark_ready(a.key()), "second mark is a no-op");
        let (unattached, _dc) = peer_pair(9);
        assert!(!registry.mark_ready(unattached.key()));

        assert_eq!(registry.counts().ready, 1);
        assert_eq!(registry.ready_remotes().len(), 1);

        registry.remove(a.key());
        assert_eq!(registry.counts().ready, 0);
    }
}
