// Copyright 2024 The Rivulet Project
// SPDX-License-Identifier: BSD-3-Clause

use crate::peer::PeerKey;

/// Strategy deciding which interested peers get unchoked.
///
/// Only the choke/unchoke *message* semantics are fixed by the protocol; the
/// selection policy is pluggable so smarter schemes (tit-for-tat,
/// rarest-first coupling) can replace the default without touching the
/// uploader.
pub trait ChokePolicy: Send {
    /// Pick the peers to unchoke from `interested`, which is ordered by how
    /// long each peer has been tracked (oldest first). Peers not returned
    /// stay (or become) choked.
    fn select_unchoked(&mut self, interested: &[PeerKey]) -> Vec<PeerKey>;
}

/// Default policy: unchoke interested peers first-come-first-served up to a
/// soft cap.
#[derive(Debug, Clone)]
pub struct CapUnchokePolicy {
    cap: usize,
}

impl CapUnchokePolicy {
    pub fn new(cap: usize) -> Self {
        Self { cap }
    }
}

impl ChokePolicy for CapUnchokePolicy {
    fn select_unchoked(&mut self, interested: &[PeerKey]) -> Vec<PeerKey> {
        interested.iter().take(self.cap).copied().collect()
    }
}
