// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

use bytes::Bytes;

use crate::{
    bitfield::Bitfield,
    meta::{CtHash, PathRevision, SignedMeta},
};

/// Protocol messages exchanged with one peer, in both directions. The
/// transport owns the wire encoding; the core depends only on these
/// message-level semantics.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// The sender has (some chunks of) this meta revision.
    HaveMeta {
        revision: PathRevision,
        bitfield: Bitfield,
    },
    /// The sender acquired a verified chunk.
    HaveChunk { ct_hash: CtHash },
    /// Ask for the signed meta of an exact revision.
    MetaRequest { revision: PathRevision },
    /// Answer to `MetaRequest`, with the sender's availability bitfield.
    MetaReply {
        smeta: SignedMeta,
        bitfield: Bitfield,
    },
    /// Ask for a byte range of a chunk.
    BlockRequest {
        ct_hash: CtHash,
        offset: u32,
        size: u32,
    },
    /// Answer to `BlockRequest`.
    BlockReply {
        ct_hash: CtHash,
        offset: u32,
        data: Bytes,
    },
}

impl PeerMessage {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        use PeerMessage::*;
        match self {
            Choke => "Choke",
            Unchoke => "Unchoke",
            Interested => "Interested",
            NotInterested => "NotInterested",
            HaveMeta { .. } => "HaveMeta",
            HaveChunk { .. } => "HaveChunk",
            MetaRequest { .. } => "MetaRequest",
            MetaReply { .. } => "MetaReply",
            BlockRequest { .. } => "BlockRequest",
            BlockReply { .. } => "BlockReply",
        }
    }
}

/// Everything a peer session can deliver into the folder loop.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// The transport finished the protocol handshake for this session.
    HandshakeSuccess,
    /// A protocol message arrived. Per-session order is preserved.
    Message(PeerMessage),
}
