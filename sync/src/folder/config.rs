// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

use std::time::Duration;

use crate::transfer::TransferConfig;

/// Behavior knobs of one folder group.
#[derive(Debug, Clone)]
pub struct FolderConfig {
    /// Protocol violations tolerated from a peer before it is detached.
    pub strike_threshold: u32,
    /// Cadence of the state push toward the state collector.
    pub state_push_interval: Duration,
    /// Cadence of the request-timeout sweep in the transfer engines.
    pub sweep_interval: Duration,
    /// Buffer of the channel funneling per-peer events into the folder loop.
    pub peer_event_buffer: usize,
    pub transfer: TransferConfig,
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            strike_threshold: 5,
            state_push_interval: Duration::from_millis(1000),
            sweep_interval: Duration::from_millis(500),
            peer_event_buffer: 1024,
            transfer: TransferConfig::default(),
        }
    }
}
