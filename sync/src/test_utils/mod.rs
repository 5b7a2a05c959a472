// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

//! Helpers for tests standing in for the transport layer.

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU16, Ordering},
};

use tokio::task::JoinHandle;

use crate::peer::{PeerDigest, PeerEvent, PeerSessionDriver, RemoteFolder};

static NEXT_PORT: AtomicU16 = AtomicU16::new(20_000);

/// An endpoint no other call has handed out in this process.
pub fn test_endpoint() -> SocketAddr {
    let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
    format!("127.0.0.1:{}", port).parse().expect("valid address")
}

/// A peer session pair with a digest derived from `seed` and a fresh
/// endpoint.
pub fn peer_pair(seed: u8) -> (RemoteFolder, PeerSessionDriver) {
    peer_pair_at(seed, test_endpoint())
}

/// Like [`peer_pair`], with an explicit endpoint (e.g. to provoke endpoint
/// collisions).
pub fn peer_pair_at(seed: u8, endpoint: SocketAddr) -> (RemoteFolder, PeerSessionDriver) {
    RemoteFolder::create(
        PeerDigest::from_bytes([seed; 32]),
        endpoint,
        format!("test-peer-{}", seed),
    )
}

/// A bidirectional in-memory link between two folder groups.
///
/// `a_remote` is the session the first group attaches (it represents the
/// second group's node), and vice versa. Pump tasks cross every message a
/// group sends over to the other group's inbound stream, preserving order.
pub struct SessionLink {
    pub a_remote: RemoteFolder,
    pub b_remote: RemoteFolder,
    a_events: tokio::sync::broadcast::Sender<PeerEvent>,
    b_events: tokio::sync::broadcast::Sender<PeerEvent>,
    pumps: Vec<JoinHandle<()>>,
}

impl SessionLink {
    /// Build the two session halves and start the pumps. Call within a tokio
    /// runtime.
    pub fn new(seed_a: u8, seed_b: u8) -> Self {
        let (a_remote, a_driver) = peer_pair(seed_a);
        let (b_remote, b_driver) = peer_pair(seed_b);

        let a_events = a_driver.event_tx.clone();
        let b_events = b_driver.event_tx.clone();

        let mut a_outbound = a_driver.outbound_rx;
        let b_events_for_pump = b_events.clone();
        let pump_a_to_b = tokio::spawn(async move {
            while let Some(message) = a_outbound.recv().await {
                let _ = b_events_for_pump.send(PeerEvent::Message(message));
            }
        });

        let mut b_outbound = b_driver.outbound_rx;
        let a_events_for_pump = a_events.clone();
        let pump_b_to_a = tokio::spawn(async move {
            while let Some(message) = b_outbound.recv().await {
                let _ = a_events_for_pump.send(PeerEvent::Message(message));
            }
        });

        Self {
            a_remote,
            b_remote,
            a_events,
            b_events,
            pumps: vec![pump_a_to_b, pump_b_to_a],
        }
    }

    /// Deliver `handshakeSuccess` on both halves. Call after both groups
    /// attached their session.
    pub fn handshake_both(&self) {
        let _ = self.a_events.send(PeerEvent::HandshakeSuccess);
        let _ = self.b_events.send(PeerEvent::HandshakeSuccess);
    }

    /// Deliver an inbound event on the session attached by the first group.
    pub fn publish_to_a(&self, event: PeerEvent) {
        let _ = self.a_events.send(event);
    }

    pub fn publish_to_b(&self, event: PeerEvent) {
        let _ = self.b_events.send(event);
    }
}

impl Drop for SessionLink {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}
