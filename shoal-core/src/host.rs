//! Collaborators the host injects into the engine: crypto identity, message transport,
//! and notification sink. The engine never owns sockets or keys itself.

use crate::content::ContentHash;
use crate::error::TransferError;
use crate::identity::{CryptoError, PeerId};
use crate::protocol::Message;

/// Per-peer crypto supplied by the identity layer (pairwise keys from its key exchange).
pub trait Signer: Send + Sync {
    fn sign(&self, bytes: &[u8], peer: &PeerId) -> Result<Vec<u8>, CryptoError>;
    /// Check a signature produced by `peer` over `bytes`.
    fn verify(&self, bytes: &[u8], signature: &[u8], peer: &PeerId) -> bool;
    fn encrypt(&self, bytes: &[u8], peer: &PeerId) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, bytes: &[u8], peer: &PeerId) -> Result<Vec<u8>, CryptoError>;
}

/// Ordered, fire-and-forget delivery to a connected peer.
/// Delivery failures surface to the engine as request timeouts or disconnects.
pub trait Transport: Send + Sync {
    fn send(&self, peer: &PeerId, message: Message);
}

/// Outbound notifications. All methods default to no-ops.
pub trait Notifier: Send + Sync {
    fn on_progress(&self, _content_hash: &ContentHash, _fraction: f64) {}
    /// Download finished; `bytes` are verified against the Merkle root and content hash.
    fn on_complete(&self, _content_hash: &ContentHash, _bytes: &[u8]) {}
    fn on_failed(&self, _content_hash: &ContentHash, _error: &TransferError) {}
}

/// Notifier that drops everything.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {}
