//! Engine tuning. Durations are in ticks; hosts tick once per second.

use serde::Deserialize;

use crate::choke::{DEFAULT_RATE_DECAY, DEFAULT_UNCHOKE_SLOTS};
use crate::content::DEFAULT_PIECE_SIZE;
use crate::fountain::DEFAULT_MAX_DEGREE;
use crate::scheduler::DEFAULT_MAX_IN_FLIGHT;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub piece_size: usize,
    /// Largest blob `publish` accepts.
    pub max_content_size: u64,
    pub max_in_flight: usize,
    pub request_timeout_ticks: u64,
    /// Fail a download that makes no progress for this long.
    pub download_timeout_ticks: u64,
    /// Give up resolving a torrent after this long.
    pub metadata_timeout_ticks: u64,
    pub metadata_retry_ticks: u64,
    /// How long a peer that sent bad bytes is skipped by the scheduler.
    pub unreliable_cooldown_ticks: u64,
    pub choke_interval_ticks: u64,
    pub unchoke_slots: usize,
    pub rate_decay: f64,
    pub max_concurrent_downloads: usize,
    /// Storage faults tolerated per download before it fails.
    pub max_storage_failures: u32,
    /// Choked requests kept per peer until the next allocator decision.
    pub max_queued_requests: usize,
    /// Ticks without any schedulable piece before asking for encoded units.
    pub stall_ticks_before_fountain: u64,
    pub fountain_max_degree: usize,
    /// Units sent per `UnitsRequest`.
    pub fountain_batch: usize,
    /// Fixed seed for tie-breaks and optimistic unchokes.
    pub rng_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            piece_size: DEFAULT_PIECE_SIZE,
            max_content_size: 1024 * 1024 * 1024,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            request_timeout_ticks: 30,
            download_timeout_ticks: 300,
            metadata_timeout_ticks: 30,
            metadata_retry_ticks: 5,
            unreliable_cooldown_ticks: 60,
            choke_interval_ticks: 10,
            unchoke_slots: DEFAULT_UNCHOKE_SLOTS,
            rate_decay: DEFAULT_RATE_DECAY,
            max_concurrent_downloads: 8,
            max_storage_failures: 3,
            max_queued_requests: 64,
            stall_ticks_before_fountain: 5,
            fountain_max_degree: DEFAULT_MAX_DEGREE,
            fountain_batch: 8,
            rng_seed: None,
        }
    }
}
