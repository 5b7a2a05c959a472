// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

use crate::{peer::PeerKey, storage::StorageError};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Malformed or out-of-contract message. The coordinator turns these
    /// into strikes against the peer.
    #[error("Protocol violation from {peer}: {details}")]
    ProtocolViolation { peer: PeerKey, details: String },
    /// Message routed for a peer the engine does not track (e.g. raced with
    /// a detach). Dropped without consequence.
    #[error("Peer {0} is not tracked")]
    PeerNotTracked(PeerKey),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl TransferError {
    pub fn violation(peer: PeerKey, details: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            peer,
            details: details.into(),
        }
    }

    pub fn is_violation(&self) -> bool {
        matches!(self, Self::ProtocolViolation { .. })
    }
}
