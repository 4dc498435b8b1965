//! Swarm state for one content hash: what each connected peer holds, which pieces are in
//! flight to whom, and how reliable each peer has been.
//!
//! Owned by a single download and mutated only through `&mut self`, so the host's lock
//! around the engine is the only synchronization needed.

use std::collections::{BTreeMap, HashMap};

use crate::bitfield::Bitfield;
use crate::identity::PeerId;

/// Outstanding request for one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub peer: PeerId,
    pub requested_at: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AnnounceError {
    #[error("bitfield length {got} does not match piece count {expected}")]
    LengthMismatch { expected: u32, got: u32 },
}

pub struct SwarmState {
    piece_count: u32,
    /// Connected peers and their piece views. BTreeMap keeps iteration deterministic.
    views: BTreeMap<PeerId, Bitfield>,
    in_flight: BTreeMap<u32, InFlight>,
    unreliability: HashMap<PeerId, u32>,
    cooldown_until: HashMap<PeerId, u64>,
}

impl SwarmState {
    pub fn new(piece_count: u32) -> Self {
        Self {
            piece_count,
            views: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            unreliability: HashMap::new(),
            cooldown_until: HashMap::new(),
        }
    }

    pub fn on_peer_connected(&mut self, peer: PeerId) {
        self.views
            .entry(peer)
            .or_insert_with(|| Bitfield::new(self.piece_count));
    }

    /// Drop the peer's view and free every request attributed to it. Returns freed indices.
    pub fn on_peer_disconnected(&mut self, peer: &PeerId) -> Vec<u32> {
        self.views.remove(peer);
        let freed: Vec<u32> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.peer == *peer)
            .map(|(&i, _)| i)
            .collect();
        for i in &freed {
            self.in_flight.remove(i);
        }
        freed
    }

    /// OR-merge an announced bitfield into the peer's view. An announce implies a connection.
    pub fn on_peer_announced(&mut self, peer: PeerId, bitfield: &Bitfield) -> Result<(), AnnounceError> {
        if bitfield.len() != self.piece_count {
            return Err(AnnounceError::LengthMismatch {
                expected: self.piece_count,
                got: bitfield.len(),
            });
        }
        let piece_count = self.piece_count;
        let view = self
            .views
            .entry(peer)
            .or_insert_with(|| Bitfield::new(piece_count));
        if view.union_with(bitfield) {
            Ok(())
        } else {
            Err(AnnounceError::LengthMismatch {
                expected: piece_count,
                got: bitfield.len(),
            })
        }
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.views.contains_key(peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.views.keys()
    }

    pub fn view(&self, peer: &PeerId) -> Option<&Bitfield> {
        self.views.get(peer)
    }

    /// Record a request. Returns false if the piece already has one outstanding.
    pub fn mark_requested(&mut self, index: u32, peer: PeerId, now: u64) -> bool {
        if self.in_flight.contains_key(&index) {
            return false;
        }
        self.in_flight.insert(
            index,
            InFlight {
                peer,
                requested_at: now,
            },
        );
        true
    }

    /// Clear the request for `index`. The serving peer demonstrably holds the piece, so its
    /// view is updated too. Returns the peer the request was attributed to.
    pub fn mark_received(&mut self, index: u32) -> Option<PeerId> {
        let entry = self.in_flight.remove(&index)?;
        if let Some(view) = self.views.get_mut(&entry.peer) {
            view.set(index);
        }
        Some(entry.peer)
    }

    /// Clear the request for `index` and count a failure against the peer.
    pub fn mark_timed_out(&mut self, index: u32) -> Option<PeerId> {
        let entry = self.in_flight.remove(&index)?;
        *self.unreliability.entry(entry.peer).or_insert(0) += 1;
        Some(entry.peer)
    }

    /// Drop the request for `index` without blaming anyone (piece arrived another way).
    pub fn clear_request(&mut self, index: u32) -> Option<PeerId> {
        self.in_flight.remove(&index).map(|f| f.peer)
    }

    /// Time out every request older than `timeout` ticks. Returns (index, peer) per expiry.
    pub fn expire(&mut self, now: u64, timeout: u64) -> Vec<(u32, PeerId)> {
        let overdue: Vec<u32> = self
            .in_flight
            .iter()
            .filter(|(_, f)| now.saturating_sub(f.requested_at) >= timeout)
            .map(|(&i, _)| i)
            .collect();
        overdue
            .into_iter()
            .filter_map(|i| self.mark_timed_out(i).map(|p| (i, p)))
            .collect()
    }

    /// Peer sent bytes that failed verification: count it, clear its request for `index`,
    /// and exclude it from requests until `now + cooldown`.
    pub fn penalize(&mut self, peer: PeerId, index: u32, now: u64, cooldown: u64) {
        if self.in_flight.get(&index).is_some_and(|f| f.peer == peer) {
            self.in_flight.remove(&index);
        }
        *self.unreliability.entry(peer).or_insert(0) += 1;
        self.cooldown_until.insert(peer, now.saturating_add(cooldown));
    }

    pub fn unreliability(&self, peer: &PeerId) -> u32 {
        self.unreliability.get(peer).copied().unwrap_or(0)
    }

    pub fn is_cooling(&self, peer: &PeerId, now: u64) -> bool {
        self.cooldown_until.get(peer).is_some_and(|&until| now < until)
    }

    /// Peers eligible to serve `index`: connected, holding it, not in cooldown.
    pub fn holders(&self, index: u32, now: u64) -> impl Iterator<Item = &PeerId> + '_ {
        self.views
            .iter()
            .filter(move |(peer, view)| view.get(index) && !self.is_cooling(peer, now))
            .map(|(peer, _)| peer)
    }

    /// Number of eligible holders of `index`.
    pub fn availability(&self, index: u32, now: u64) -> usize {
        self.holders(index, now).count()
    }

    pub fn is_in_flight(&self, index: u32) -> bool {
        self.in_flight.contains_key(&index)
    }

    pub fn in_flight(&self, index: u32) -> Option<&InFlight> {
        self.in_flight.get(&index)
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn clear_in_flight(&mut self) {
        self.in_flight.clear();
    }
}
