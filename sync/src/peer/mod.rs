// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

//! Peer session handles.
//!
//! The transport owns each socket and its lifecycle; the sync core holds a
//! non-owning, cloneable [`RemoteFolder`] handle between `attach` and
//! `detach`. Outbound messages flow through a bounded mpsc drained by the
//! transport; inbound events are published on a broadcast stream the folder
//! group subscribes to at attach.

mod messages;

use std::{
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

pub use messages::{PeerEvent, PeerMessage};

use bytes::Bytes;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

use crate::{
    bitfield::Bitfield,
    meta::{CtHash, PathRevision, SignedMeta},
};

/// Outbound queue length per peer session. A transport that stops draining
/// causes sends to fail rather than block the folder loop.
pub const OUTBOUND_BUFFER_SIZE: usize = 256;

/// Inbound event stream capacity per peer session.
pub const EVENT_STREAM_SIZE: usize = 1024;

static NEXT_PEER_KEY: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one peer session. Two sessions to the same
/// peer get distinct keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey(u64);

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Stable cryptographic identity of a peer within one folder, derived by the
/// transport from the handshake.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerDigest([u8; 32]);

impl PeerDigest {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn short_str(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_str())
    }
}

impl fmt::Debug for PeerDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerDigest({})", hex::encode(self.0))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PeerSendError {
    #[error("Peer session outbound queue is full")]
    QueueFull,
    #[error("Peer session is closed")]
    SessionClosed,
}

/// Transport-facing half of a peer session: the transport drains
/// `outbound_rx` onto the socket and publishes inbound events through
/// `event_tx`.
pub struct PeerSessionDriver {
    pub outbound_rx: mpsc::Receiver<PeerMessage>,
    pub event_tx: broadcast::Sender<PeerEvent>,
}

impl PeerSessionDriver {
    /// Publish one inbound event toward the core. Events published while
    /// nobody is attached are dropped, matching the contract that nothing is
    /// delivered outside the attach..detach interval.
    pub fn publish(&self, event: PeerEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Non-owning handle to one peer session, scoped to one folder.
#[derive(Clone)]
pub struct RemoteFolder {
    key: PeerKey,
    digest: PeerDigest,
    endpoint: SocketAddr,
    display_name: String,
    outbound_tx: mpsc::Sender<PeerMessage>,
    event_tx: broadcast::Sender<PeerEvent>,
}

impl RemoteFolder {
    /// Create the handle/driver pair for a freshly handshaking session.
    /// Called by the transport (and by tests standing in for it).
    pub fn create(
        digest: PeerDigest,
        endpoint: SocketAddr,
        display_name: impl Into<String>,
    ) -> (Self, PeerSessionDriver) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER_SIZE);
        let (event_tx, _) = broadcast::channel(EVENT_STREAM_SIZE);
        let handle = Self {
            key: PeerKey(NEXT_PEER_KEY.fetch_add(1, Ordering::Relaxed)),
            digest,
            endpoint,
            display_name: display_name.into(),
            outbound_tx,
            event_tx: event_tx.clone(),
        };
        let driver = PeerSessionDriver {
            outbound_rx,
            event_tx,
        };
        (handle, driver)
    }

    pub fn key(&self) -> PeerKey {
        self.key
    }

    pub fn digest(&self) -> PeerDigest {
        self.digest
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Subscribe to the session's inbound events. Only events published
    /// after this call are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.event_tx.subscribe()
    }

    /// Self-reported state blob for the UI.
    pub fn collect_state(&self) -> serde_json::Value {
        json!({
            "name": self.display_name,
            "digest": hex::encode(self.digest.0),
            "endpoint": self.endpoint.to_string(),
        })
    }

    /// Queue a message toward the peer without blocking the folder loop.
    pub fn send(&self, message: PeerMessage) -> Result<(), PeerSendError> {
        self.outbound_tx.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => PeerSendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => PeerSendError::SessionClosed,
        })
    }

    pub fn send_choke(&self) -> Result<(), PeerSendError> {
        self.send(PeerMessage::Choke)
    }

    pub fn send_unchoke(&self) -> Result<(), PeerSendError> {
        self.send(PeerMessage::Unchoke)
    }

    pub fn send_interested(&self) -> Result<(), PeerSendError> {
        self.send(PeerMessage::Interested)
    }

    pub fn send_not_interested(&self) -> Result<(), PeerSendError> {
        self.send(PeerMessage::NotInterested)
    }

    pub fn send_have_meta(&self, revision: PathRevision, bitfield: Bitfield) -> Result<(), PeerSendError> {
        self.send(PeerMessage::HaveMeta { revision, bitfield })
    }

    pub fn send_have_chunk(&self, ct_hash: CtHash) -> Result<(), PeerSendError> {
        self.send(PeerMessage::HaveChunk { ct_hash })
    }

    pub fn send_meta_request(&self, revision: PathRevision) -> Result<(), PeerSendError> {
        self.send(PeerMessage::MetaRequest { revision })
    }

    pub fn send_meta_reply(&self, smeta: SignedMeta, bitfield: Bitfield) -> Result<(), PeerSendError> {
        self.send(PeerMessage::MetaReply { smeta, bitfield })
    }

    pub fn send_block_request(&self, ct_hash: CtHash, offset: u32, size: u32) -> Result<(), PeerSendError> {
        self.send(PeerMessage::BlockRequest { ct_hash, offset, size })
    }

    pub fn send_block_reply(&self, ct_hash: CtHash, offset: u32, data: Bytes) -> Result<(), PeerSendError> {
        self.send(PeerMessage::BlockReply { ct_hash, offset, data })
    }
}

impl fmt::Debug for RemoteFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFolder")
            .field("key", &self.key)
            .field("digest", &self.digest)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn endpoint(port: u16) -> SocketAddr {
        format!("10.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn keys_are_unique() {
        let digest = PeerDigest::from_bytes([1; 32]);
        let (a, _da) = RemoteFolder::create(digest, endpoint(1000), "a");
        let (b, _db) = RemoteFolder::create(digest, endpoint(1001), "b");
        assert_ne!(a.key(), b.key());
    }

    #[tokio::test]
    async fn send_reaches_driver() {
        let (remote, mut driver) =
            RemoteFolder::create(PeerDigest::from_bytes([1; 32]), endpoint(1002), "a");
        remote.send_interested().unwrap();
        assert_eq!(driver.outbound_rx.recv().await.unwrap(), PeerMessage::Interested);
    }

    #[test]
    fn send_fails_when_driver_dropped() {
        let (remote, driver) =
            RemoteFolder::create(PeerDigest::from_bytes([1; 32]), endpoint(1003), "a");
        drop(driver);
        assert_eq!(remote.send_choke().unwrap_err(), PeerSendError::SessionClosed);
    }

    #[tokio::test]
    async fn events_published_before_subscribe_are_dropped() {
        let (remote, driver) =
            RemoteFolder::create(PeerDigest::from_bytes([1; 32]), endpoint(1004), "a");
        driver.publish(PeerEvent::HandshakeSuccess);

        let mut events = remote.subscribe();
        driver.publish(PeerEvent::Message(PeerMessage::Choke));
        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::Message(PeerMessage::Choke)
        );
        assert!(events.try_recv().is_err());
    }
}
