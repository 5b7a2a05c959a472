// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

use std::time::Duration;

/// Tunables of the chunk and meta exchange.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Transfer unit within a chunk. Also the upper bound accepted for a
    /// single `BlockRequest`.
    pub block_size: u32,
    /// Outstanding block requests allowed per peer.
    pub requests_per_peer: usize,
    /// A block request unanswered for this long is requeued to another peer
    /// and the slow peer is deprioritized.
    pub block_request_timeout: Duration,
    /// A meta request unanswered for this long is reissued to a fallback
    /// announcer.
    pub meta_request_timeout: Duration,
    /// Soft cap of simultaneously unchoked peers for the default choke
    /// policy.
    pub unchoke_cap: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: 32 * 1024,
            requests_per_peer: 8,
            block_request_timeout: Duration::from_secs(30),
            meta_request_timeout: Duration::from_secs(10),
            unchoke_cap: 4,
        }
    }
}
