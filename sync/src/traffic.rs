// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

//! Per-folder transfer accounting.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Instant,
};

use serde::{Deserialize, Serialize};

/// Monotonic transfer counters for one folder. The engines bump these from
/// the folder loop; the state tick turns them into [`TrafficStats`].
#[derive(Debug)]
pub struct TrafficCounters {
    up_bytes: AtomicU64,
    down_bytes: AtomicU64,
    up_blocks: AtomicU64,
    down_blocks: AtomicU64,
    last_heartbeat: Mutex<HeartbeatMark>,
}

#[derive(Debug, Clone, Copy)]
struct HeartbeatMark {
    at: Instant,
    up_bytes: u64,
    down_bytes: u64,
}

/// Snapshot produced once per state tick: lifetime totals plus the bandwidth
/// observed since the previous tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficStats {
    pub up_bytes: u64,
    pub down_bytes: u64,
    pub up_blocks: u64,
    pub down_blocks: u64,
    /// Bytes per second since the previous heartbeat.
    pub up_bandwidth: f64,
    pub down_bandwidth: f64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self {
            up_bytes: AtomicU64::new(0),
            down_bytes: AtomicU64::new(0),
            up_blocks: AtomicU64::new(0),
            down_blocks: AtomicU64::new(0),
            last_heartbeat: Mutex::new(HeartbeatMark {
                at: Instant::now(),
                up_bytes: 0,
                down_bytes: 0,
            }),
        }
    }

    /// Record one block served to a peer.
    pub fn record_up(&self, bytes: u64) {
        self.up_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.up_blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one block received from a peer.
    pub fn record_down(&self, bytes: u64) {
        self.down_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.down_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn up_bytes(&self) -> u64 {
        self.up_bytes.load(Ordering::Relaxed)
    }

    pub fn down_bytes(&self) -> u64 {
        self.down_bytes.load(Ordering::Relaxed)
    }

    /// Totals plus bandwidth since the previous heartbeat, and mark now as
    /// the new reference point.
    pub fn heartbeat(&self) -> TrafficStats {
        let up_bytes = self.up_bytes.load(Ordering::Relaxed);
        let down_bytes = self.down_bytes.load(Ordering::Relaxed);

        let mut mark = self.last_heartbeat.lock().expect("traffic lock poisoned");
        let elapsed = mark.at.elapsed().as_secs_f64();
        let (up_bandwidth, down_bandwidth) = if elapsed > 0.0 {
            (
                (up_bytes - mark.up_bytes) as f64 / elapsed,
                (down_bytes - mark.down_bytes) as f64 / elapsed,
            )
        } else {
            (0.0, 0.0)
        };
        *mark = HeartbeatMark {
            at: Instant::now(),
            up_bytes,
            down_bytes,
        };

        TrafficStats {
            up_bytes,
            down_bytes,
            up_blocks: self.up_blocks.load(Ordering::Relaxed),
            down_blocks: self.down_blocks.load(Ordering::Relaxed),
            up_bandwidth,
            down_bandwidth,
        }
    }
}

impl Default for TrafficCounters {
    fn default() -> Self {
        Self::new()
    }
}
