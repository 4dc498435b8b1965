//! Node-wide bandwidth allocator (choke/unchoke).
//!
//! Every interval the decision is re-derived from scratch: peers that sent us the most
//! recently (decayed average) get the regular upload slots, and one extra peer drawn at
//! random from the rest gets the optimistic slot. A peer that never contributes can only
//! ever be served through that optimistic slot. A peer connecting while the slot is empty
//! takes it at once instead of waiting for the next cycle.

use std::collections::{BTreeMap, BTreeSet};

use rand::seq::SliceRandom;
use rand::Rng;

use crate::identity::PeerId;

/// Default number of regular unchoke slots.
pub const DEFAULT_UNCHOKE_SLOTS: usize = 5;

/// Default weight of the previous average in each decay step.
pub const DEFAULT_RATE_DECAY: f64 = 0.8;

#[derive(Debug, Clone, PartialEq)]
pub struct PeerTransferStats {
    pub peer_id: PeerId,
    /// Decayed bytes per interval we sent to the peer.
    pub recent_upload_rate: f64,
    /// Decayed bytes per interval the peer sent us. This is its contribution.
    pub recent_download_rate: f64,
    pub unchoked_by_us: bool,
    uploaded_this_round: u64,
    downloaded_this_round: u64,
}

impl PeerTransferStats {
    fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            recent_upload_rate: 0.0,
            recent_download_rate: 0.0,
            unchoked_by_us: false,
            uploaded_this_round: 0,
            downloaded_this_round: 0,
        }
    }
}

/// Result of one allocator cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChokeDecision {
    /// Peers holding regular slots, best contributor first.
    pub regular: Vec<PeerId>,
    pub optimistic: Option<PeerId>,
    /// Peers that were choked before this cycle and are unchoked now.
    pub newly_unchoked: Vec<PeerId>,
}

pub struct BandwidthAllocator {
    stats: BTreeMap<PeerId, PeerTransferStats>,
    optimistic: Option<PeerId>,
    unchoke_slots: usize,
    decay: f64,
}

impl BandwidthAllocator {
    pub fn new(unchoke_slots: usize, decay: f64) -> Self {
        Self {
            stats: BTreeMap::new(),
            optimistic: None,
            unchoke_slots,
            decay: decay.clamp(0.0, 1.0),
        }
    }

    /// Returns true if the peer was unchoked into the vacant optimistic slot.
    pub fn on_peer_connected(&mut self, peer: PeerId) -> bool {
        let vacant = self.optimistic.is_none();
        let stats = self
            .stats
            .entry(peer)
            .or_insert_with(|| PeerTransferStats::new(peer));
        if vacant && !stats.unchoked_by_us {
            stats.unchoked_by_us = true;
            self.optimistic = Some(peer);
            return true;
        }
        false
    }

    pub fn on_peer_disconnected(&mut self, peer: &PeerId) {
        self.stats.remove(peer);
        if self.optimistic.as_ref() == Some(peer) {
            self.optimistic = None;
        }
    }

    /// Bytes of verified piece data received from `peer`.
    pub fn record_downloaded(&mut self, peer: &PeerId, bytes: u64) {
        if let Some(s) = self.stats.get_mut(peer) {
            s.downloaded_this_round = s.downloaded_this_round.saturating_add(bytes);
        }
    }

    /// Bytes of piece data served to `peer`.
    pub fn record_uploaded(&mut self, peer: &PeerId, bytes: u64) {
        if let Some(s) = self.stats.get_mut(peer) {
            s.uploaded_this_round = s.uploaded_this_round.saturating_add(bytes);
        }
    }

    pub fn is_unchoked(&self, peer: &PeerId) -> bool {
        self.stats.get(peer).is_some_and(|s| s.unchoked_by_us)
    }

    pub fn stats(&self, peer: &PeerId) -> Option<&PeerTransferStats> {
        self.stats.get(peer)
    }

    pub fn unchoked(&self) -> BTreeSet<PeerId> {
        self.stats
            .values()
            .filter(|s| s.unchoked_by_us)
            .map(|s| s.peer_id)
            .collect()
    }

    /// Fold this round's byte counts into the rolling averages and re-derive the unchoke set.
    pub fn recompute<R: Rng + ?Sized>(&mut self, rng: &mut R) -> ChokeDecision {
        let decay = self.decay;
        for s in self.stats.values_mut() {
            s.recent_download_rate =
                decay * s.recent_download_rate + (1.0 - decay) * s.downloaded_this_round as f64;
            s.recent_upload_rate =
                decay * s.recent_upload_rate + (1.0 - decay) * s.uploaded_this_round as f64;
            s.downloaded_this_round = 0;
            s.uploaded_this_round = 0;
        }

        let mut contributors: Vec<(f64, PeerId)> = self
            .stats
            .values()
            .filter(|s| s.recent_download_rate > 0.0)
            .map(|s| (s.recent_download_rate, s.peer_id))
            .collect();
        contributors.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        let regular: Vec<PeerId> = contributors
            .into_iter()
            .take(self.unchoke_slots)
            .map(|(_, p)| p)
            .collect();

        let remainder: Vec<PeerId> = self
            .stats
            .keys()
            .filter(|p| !regular.contains(p))
            .copied()
            .collect();
        let optimistic = remainder.choose(rng).copied();

        let mut newly_unchoked = Vec::new();
        for s in self.stats.values_mut() {
            let unchoke = regular.contains(&s.peer_id) || optimistic == Some(s.peer_id);
            if unchoke && !s.unchoked_by_us {
                newly_unchoked.push(s.peer_id);
            }
            s.unchoked_by_us = unchoke;
        }
        self.optimistic = optimistic;

        ChokeDecision {
            regular,
            optimistic,
            newly_unchoked,
        }
    }
}

impl Default for BandwidthAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_UNCHOKE_SLOTS, DEFAULT_RATE_DECAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn peers(n: usize) -> Vec<PeerId> {
        (0..n).map(|_| Keypair::generate().peer_id()).collect()
    }

    #[test]
    fn top_contributors_get_regular_slots() {
        let p = peers(7);
        let mut alloc = BandwidthAllocator::new(5, 0.5);
        for (i, peer) in p.iter().enumerate() {
            alloc.on_peer_connected(*peer);
            // p[0] and p[1] contribute nothing
            if i >= 2 {
                alloc.record_downloaded(peer, (i as u64) * 1000);
            }
        }
        let d = alloc.recompute(&mut StdRng::seed_from_u64(1));
        assert_eq!(d.regular, vec![p[6], p[5], p[4], p[3], p[2]]);
        let opt = d.optimistic.unwrap();
        assert!(opt == p[0] || opt == p[1]);
        assert_eq!(alloc.unchoked().len(), 6);
    }

    #[test]
    fn zero_contributors_only_via_optimistic_slot() {
        let p = peers(6);
        let mut alloc = BandwidthAllocator::new(5, 0.8);
        for peer in &p {
            alloc.on_peer_connected(*peer);
        }
        alloc.record_downloaded(&p[0], 500);
        alloc.record_downloaded(&p[1], 800);
        for seed in 0..16 {
            let d = alloc.recompute(&mut StdRng::seed_from_u64(seed));
            assert_eq!(d.regular, vec![p[1], p[0]]);
            let zero_unchoked: Vec<PeerId> = alloc
                .unchoked()
                .into_iter()
                .filter(|peer| !d.regular.contains(peer))
                .collect();
            assert_eq!(zero_unchoked.len(), 1);
            assert_eq!(d.optimistic, Some(zero_unchoked[0]));
        }
    }

    #[test]
    fn rates_decay_without_new_traffic() {
        let p = peers(1);
        let mut alloc = BandwidthAllocator::new(5, 0.5);
        alloc.on_peer_connected(p[0]);
        alloc.record_downloaded(&p[0], 1000);
        alloc.recompute(&mut StdRng::seed_from_u64(0));
        assert_eq!(alloc.stats(&p[0]).unwrap().recent_download_rate, 500.0);
        alloc.recompute(&mut StdRng::seed_from_u64(0));
        assert_eq!(alloc.stats(&p[0]).unwrap().recent_download_rate, 250.0);
    }

    #[test]
    fn lone_new_peer_is_optimistically_unchoked() {
        let p = peers(1);
        let mut alloc = BandwidthAllocator::default();
        assert!(alloc.on_peer_connected(p[0]));
        assert!(alloc.is_unchoked(&p[0]));
        let d = alloc.recompute(&mut StdRng::seed_from_u64(3));
        assert!(d.regular.is_empty());
        assert_eq!(d.optimistic, Some(p[0]));
        assert!(d.newly_unchoked.is_empty());
        assert!(alloc.is_unchoked(&p[0]));
    }

    #[test]
    fn newcomer_waits_while_optimistic_slot_is_taken() {
        let p = peers(3);
        let mut alloc = BandwidthAllocator::default();
        alloc.recompute(&mut StdRng::seed_from_u64(3));
        assert!(alloc.on_peer_connected(p[0]));
        assert!(!alloc.on_peer_connected(p[1]));
        assert!(!alloc.is_unchoked(&p[1]));
        assert_eq!(alloc.unchoked().len(), 1);

        alloc.on_peer_disconnected(&p[0]);
        assert!(alloc.on_peer_connected(p[2]));
        assert_eq!(alloc.unchoked(), BTreeSet::from([p[2]]));
    }

    #[test]
    fn disconnected_peer_is_forgotten() {
        let p = peers(1);
        let mut alloc = BandwidthAllocator::default();
        alloc.on_peer_connected(p[0]);
        alloc.recompute(&mut StdRng::seed_from_u64(3));
        alloc.on_peer_disconnected(&p[0]);
        assert!(!alloc.is_unchoked(&p[0]));
        assert!(alloc.stats(&p[0]).is_none());
    }
}
