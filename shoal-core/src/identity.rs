//! Peer identity and crypto: keypairs, peer ID, session keys, payload encryption.
//! `Keyring` is the stock `Signer` built on X25519 session keys and ChaCha20-Poly1305.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::host::Signer;

/// Peer public key (32 bytes, X25519).
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Peer ID: first 16 bytes of SHA-256 over the public key.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 16]);

impl PeerId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(bytes)
    }

    pub fn from_public_key(public: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public);
        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        PeerId(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(&self.0[..6]))
    }
}

/// X25519 keypair. Keep secret key private; expose only public key and peer ID.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
    peer_id: PeerId,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        let peer_id = PeerId::from_public_key(public.as_bytes());
        Self {
            secret,
            public,
            peer_id,
        }
    }

    /// Rebuild a keypair from a stored secret.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        let peer_id = PeerId::from_public_key(public.as_bytes());
        Self {
            secret,
            public,
            peer_id,
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Shared secret with another peer's public key. Input to `derive_session_key`.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Derive a 32-byte pairwise session key from a shared secret.
pub fn derive_session_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"shoal-session-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Length of the nonce prefixed to every sealed payload and signature.
pub const NONCE_LEN: usize = 12;

/// Session keys are static per peer pair and survive restarts; every message takes a fresh
/// nonce from the OS.
fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn split_nonce(bytes: &[u8]) -> Option<(&[u8; NONCE_LEN], &[u8])> {
    if bytes.len() < NONCE_LEN {
        return None;
    }
    let (head, rest) = bytes.split_at(NONCE_LEN);
    Some((head.try_into().ok()?, rest))
}

/// ChaCha20-Poly1305 encryption under a 96-bit nonce. Never reuse a nonce with the same key.
pub fn encrypt_wire(
    key: &[u8; 32],
    nonce: &[u8; 12],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Key)?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)
}

pub fn decrypt_wire(
    key: &[u8; 32],
    nonce: &[u8; 12],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Key)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    Key,
    #[error("no session key for peer {0}")]
    UnknownPeer(PeerId),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("keyring unavailable")]
    Unavailable,
}

/// Local keypair plus the session keys of every peer that completed a handshake.
///
/// Encrypted payloads and signatures carry their random nonce as a prefix. A signature is
/// the Poly1305 tag over the signed bytes as associated data with an empty message.
pub struct Keyring {
    keypair: Keypair,
    sessions: RwLock<HashMap<PeerId, [u8; 32]>>,
}

impl Keyring {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    /// Register a peer's public key; returns its peer ID.
    pub fn add_peer(&self, public_key: &PublicKey) -> Result<PeerId, CryptoError> {
        let peer_id = PeerId::from_public_key(public_key.as_bytes());
        let key = derive_session_key(&self.keypair.shared_secret(public_key));
        self.sessions
            .write()
            .map_err(|_| CryptoError::Unavailable)?
            .insert(peer_id, key);
        Ok(peer_id)
    }

    pub fn remove_peer(&self, peer: &PeerId) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.remove(peer);
        }
    }

    fn session_key(&self, peer: &PeerId) -> Result<[u8; 32], CryptoError> {
        self.sessions
            .read()
            .map_err(|_| CryptoError::Unavailable)?
            .get(peer)
            .copied()
            .ok_or(CryptoError::UnknownPeer(*peer))
    }

    fn mac(key: &[u8; 32], nonce: &[u8; 12], bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Key)?;
        cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: &[],
                    aad: bytes,
                },
            )
            .map_err(|_| CryptoError::Encrypt)
    }
}

impl Signer for Keyring {
    fn sign(&self, bytes: &[u8], peer: &PeerId) -> Result<Vec<u8>, CryptoError> {
        let key = self.session_key(peer)?;
        let nonce = random_nonce();
        let tag = Self::mac(&key, &nonce, bytes)?;
        let mut out = nonce.to_vec();
        out.extend_from_slice(&tag);
        Ok(out)
    }

    fn verify(&self, bytes: &[u8], signature: &[u8], peer: &PeerId) -> bool {
        let Ok(key) = self.session_key(peer) else {
            return false;
        };
        let Some((nonce, tag)) = split_nonce(signature) else {
            return false;
        };
        let Ok(cipher) = ChaCha20Poly1305::new_from_slice(&key) else {
            return false;
        };
        // Opening the empty message checks the tag in constant time.
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: tag,
                    aad: bytes,
                },
            )
            .is_ok()
    }

    fn encrypt(&self, bytes: &[u8], peer: &PeerId) -> Result<Vec<u8>, CryptoError> {
        let key = self.session_key(peer)?;
        let nonce = random_nonce();
        let sealed = encrypt_wire(&key, &nonce, bytes)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, bytes: &[u8], peer: &PeerId) -> Result<Vec<u8>, CryptoError> {
        let key = self.session_key(peer)?;
        let (nonce, sealed) = split_nonce(bytes).ok_or(CryptoError::Decrypt)?;
        decrypt_wire(&key, nonce, sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Keyring, Keyring) {
        let a = Keyring::new(Keypair::generate());
        let b = Keyring::new(Keypair::generate());
        a.add_peer(b.public_key()).unwrap();
        b.add_peer(a.public_key()).unwrap();
        (a, b)
    }

    #[test]
    fn keypair_peer_id_derivation() {
        let kp = Keypair::generate();
        assert_eq!(PeerId::from_public_key(kp.public_key().as_bytes()), kp.peer_id());
    }

    #[test]
    fn keypair_restores_from_secret() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_bytes(kp.secret_bytes());
        assert_eq!(restored.peer_id(), kp.peer_id());
        assert_eq!(restored.public_key(), kp.public_key());
    }

    #[test]
    fn key_exchange_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_eq!(
            a.shared_secret(b.public_key()),
            b.shared_secret(a.public_key())
        );
    }

    #[test]
    fn keyring_encrypt_decrypt_between_peers() {
        let (a, b) = pair();
        let sealed = a.encrypt(b"piece bytes", &b.peer_id()).unwrap();
        assert_eq!(b.decrypt(&sealed, &a.peer_id()).unwrap(), b"piece bytes");
    }

    #[test]
    fn repeated_messages_use_fresh_nonces() {
        let (a, b) = pair();
        let first = a.encrypt(b"x", &b.peer_id()).unwrap();
        let second = a.encrypt(b"x", &b.peer_id()).unwrap();
        assert_ne!(first[..NONCE_LEN], second[..NONCE_LEN]);
        let from_b = b.encrypt(b"x", &a.peer_id()).unwrap();
        assert_ne!(first[..NONCE_LEN], from_b[..NONCE_LEN]);
    }

    #[test]
    fn restarted_keyring_does_not_repeat_nonces() {
        let secret = Keypair::generate().secret_bytes();
        let peer = Keyring::new(Keypair::generate());
        let before_restart = Keyring::new(Keypair::from_secret_bytes(secret));
        before_restart.add_peer(peer.public_key()).unwrap();
        let first = before_restart.encrypt(b"same bytes", &peer.peer_id()).unwrap();

        let after_restart = Keyring::new(Keypair::from_secret_bytes(secret));
        after_restart.add_peer(peer.public_key()).unwrap();
        let second = after_restart.encrypt(b"same bytes", &peer.peer_id()).unwrap();
        assert_ne!(first[..NONCE_LEN], second[..NONCE_LEN]);
        assert_ne!(first[NONCE_LEN..], second[NONCE_LEN..]);

        peer.add_peer(after_restart.public_key()).unwrap();
        assert_eq!(peer.decrypt(&first, &after_restart.peer_id()).unwrap(), b"same bytes");
        assert_eq!(peer.decrypt(&second, &after_restart.peer_id()).unwrap(), b"same bytes");
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (a, b) = pair();
        let mut sealed = a.encrypt(b"payload", &b.peer_id()).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(
            b.decrypt(&sealed, &a.peer_id()),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn signatures_verify_only_for_signed_bytes() {
        let (a, b) = pair();
        let sig = a.sign(b"announce", &b.peer_id()).unwrap();
        assert!(b.verify(b"announce", &sig, &a.peer_id()));
        assert!(!b.verify(b"announce!", &sig, &a.peer_id()));
        assert!(!b.verify(b"announce", &sig[..4], &a.peer_id()));
        let mut forged = sig.clone();
        let last = forged.len() - 1;
        forged[last] ^= 1;
        assert!(!b.verify(b"announce", &forged, &a.peer_id()));
        assert_ne!(sig, a.sign(b"announce", &b.peer_id()).unwrap());
    }

    #[test]
    fn unknown_peer_is_rejected() {
        let a = Keyring::new(Keypair::generate());
        let stranger = Keypair::generate().peer_id();
        assert!(matches!(
            a.encrypt(b"x", &stranger),
            Err(CryptoError::UnknownPeer(_))
        ));
        assert!(!a.verify(b"x", &[0u8; 24], &stranger));
    }
}
