//! Rarest-first piece selection. Pure: reads swarm state, returns the requests to issue.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::bitfield::Bitfield;
use crate::identity::PeerId;
use crate::swarm::SwarmState;

/// Default ceiling on simultaneous requests per download.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 10;

/// Missing, not-in-flight pieces with at least one eligible holder, ordered rarest first
/// and then by index. Each entry is (availability, index).
pub fn rarity_order(swarm: &SwarmState, have: &Bitfield, now: u64) -> Vec<(usize, u32)> {
    let mut candidates: Vec<(usize, u32)> = have
        .iter_zeros()
        .filter(|&i| !swarm.is_in_flight(i))
        .map(|i| (swarm.availability(i, now), i))
        .filter(|&(avail, _)| avail > 0)
        .collect();
    candidates.sort_unstable();
    candidates
}

/// Choose the holder to ask for `index`: peers we unchoke first (fall back to any holder),
/// then lowest unreliability, then a random pick among the remaining ties.
pub fn pick_holder<R: Rng + ?Sized>(
    swarm: &SwarmState,
    index: u32,
    now: u64,
    is_unchoked: &dyn Fn(&PeerId) -> bool,
    rng: &mut R,
) -> Option<PeerId> {
    let holders: Vec<PeerId> = swarm.holders(index, now).copied().collect();
    let unchoked: Vec<PeerId> = holders.iter().copied().filter(|p| is_unchoked(p)).collect();
    let pool = if unchoked.is_empty() { holders } else { unchoked };
    let best = pool.iter().map(|p| swarm.unreliability(p)).min()?;
    let ties: Vec<PeerId> = pool
        .into_iter()
        .filter(|p| swarm.unreliability(p) == best)
        .collect();
    ties.choose(rng).copied()
}

/// Select up to `slots` (index, peer) requests for this tick.
pub fn select_requests<R: Rng + ?Sized>(
    swarm: &SwarmState,
    have: &Bitfield,
    slots: usize,
    now: u64,
    is_unchoked: &dyn Fn(&PeerId) -> bool,
    rng: &mut R,
) -> Vec<(u32, PeerId)> {
    if slots == 0 || have.is_full() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(slots);
    for (_, index) in rarity_order(swarm, have, now) {
        if out.len() == slots {
            break;
        }
        if let Some(peer) = pick_holder(swarm, index, now, is_unchoked, rng) {
            out.push((index, peer));
        }
    }
    out
}
