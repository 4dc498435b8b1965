//! Content addressing: hash, split into pieces, Merkle tree, torrent metadata.
//! Everything here is pure and safe to call from any thread.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::TransferError;

/// Default piece size in bytes.
pub const DEFAULT_PIECE_SIZE: usize = 256 * 1024; // 256 KiB

/// 256-bit SHA-256 digest. Identifies blobs (whole content) and pieces.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ContentHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, TransferError> {
        let raw = hex::decode(s)
            .map_err(|e| TransferError::validation(format!("bad content hash: {e}")))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| TransferError::validation("content hash must be 32 bytes"))?;
        Ok(ContentHash(bytes))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

/// Hash arbitrary bytes.
pub fn hash(bytes: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ContentHash(hasher.finalize().into())
}

fn hash_pair(left: &ContentHash, right: &ContentHash) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(left.0);
    hasher.update(right.0);
    ContentHash(hasher.finalize().into())
}

/// Verify piece bytes against the expected leaf hash.
pub fn verify_piece(bytes: &[u8], expected: &ContentHash) -> bool {
    hash(bytes) == *expected
}

/// Split bytes into pieces of `piece_size`; the last one may be shorter.
/// A zero `piece_size` falls back to [`DEFAULT_PIECE_SIZE`].
pub fn split(bytes: &[u8], piece_size: usize) -> Vec<&[u8]> {
    let size = if piece_size == 0 {
        DEFAULT_PIECE_SIZE
    } else {
        piece_size
    };
    bytes.chunks(size).collect()
}

/// Number of pieces for a blob of `total_size` bytes.
pub fn piece_count(total_size: u64, piece_size: usize) -> u32 {
    if piece_size == 0 {
        return 0;
    }
    total_size.div_ceil(piece_size as u64) as u32
}

/// Merkle tree over piece hashes. `levels[0]` are the leaves, the last level holds the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    levels: Vec<Vec<ContentHash>>,
}

impl MerkleTree {
    pub fn root(&self) -> ContentHash {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or_else(|| hash(&[]))
    }

    pub fn levels(&self) -> &[Vec<ContentHash>] {
        &self.levels
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }
}

/// Build the tree bottom-up with pairwise hashing. An odd level pairs its last hash with itself.
/// The empty tree's root is the hash of no bytes.
pub fn build_merkle(piece_hashes: &[ContentHash]) -> MerkleTree {
    if piece_hashes.is_empty() {
        return MerkleTree { levels: Vec::new() };
    }
    let mut levels = vec![piece_hashes.to_vec()];
    while levels.last().map_or(0, Vec::len) > 1 {
        let below = &levels[levels.len() - 1];
        let next: Vec<ContentHash> = below
            .chunks(2)
            .filter_map(|pair| {
                let [left, rest @ ..] = pair else {
                    return None;
                };
                Some(hash_pair(left, rest.first().unwrap_or(left)))
            })
            .collect();
        levels.push(next);
    }
    MerkleTree { levels }
}

/// Immutable descriptor of one published blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Torrent {
    pub content_hash: ContentHash,
    pub total_size: u64,
    pub piece_size: u32,
    pub piece_count: u32,
    pub merkle_root: ContentHash,
    pub piece_hashes: Vec<ContentHash>,
    pub metadata: BTreeMap<String, String>,
    /// Unix seconds.
    pub created_at: u64,
}

impl Torrent {
    /// Expected length of piece `index`.
    pub fn piece_len(&self, index: u32) -> usize {
        if index >= self.piece_count {
            return 0;
        }
        let start = index as u64 * self.piece_size as u64;
        (self.total_size - start).min(self.piece_size as u64) as usize
    }

    /// Check self-consistency: sizes agree and the Merkle root recomputes from the piece hashes.
    /// A torrent is not trusted before this passes.
    pub fn verify(&self) -> Result<(), TransferError> {
        let bad = |reason: &str| TransferError::Integrity {
            content_hash: self.content_hash,
            piece: None,
            reason: reason.to_string(),
        };
        if self.piece_size == 0 || self.total_size == 0 {
            return Err(bad("empty torrent"));
        }
        if piece_count(self.total_size, self.piece_size as usize) != self.piece_count {
            return Err(bad("piece count does not match size"));
        }
        if self.piece_hashes.len() != self.piece_count as usize {
            return Err(bad("piece hash list length mismatch"));
        }
        if build_merkle(&self.piece_hashes).root() != self.merkle_root {
            return Err(bad("merkle root mismatch"));
        }
        Ok(())
    }
}

/// A verified piece as persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    pub content_hash: ContentHash,
    pub index: u32,
    pub hash: ContentHash,
    pub bytes: Vec<u8>,
    /// Unix seconds.
    pub stored_at: u64,
}

impl Piece {
    pub fn new(content_hash: ContentHash, index: u32, bytes: Vec<u8>) -> Self {
        Self {
            content_hash,
            index,
            hash: hash(&bytes),
            bytes,
            stored_at: unix_now(),
        }
    }
}

/// Torrent plus its pieces, produced off the engine (CPU-bound) and handed to `publish_prepared`.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub torrent: Torrent,
    pub pieces: Vec<Piece>,
}

/// Split, hash and build the tree for `bytes`. Does not validate size limits.
pub fn prepare(bytes: &[u8], piece_size: usize, metadata: BTreeMap<String, String>) -> Prepared {
    let content_hash = hash(bytes);
    let chunks = split(bytes, piece_size);
    let piece_size = if piece_size == 0 {
        DEFAULT_PIECE_SIZE
    } else {
        piece_size
    };
    let pieces: Vec<Piece> = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| Piece::new(content_hash, i as u32, chunk.to_vec()))
        .collect();
    let piece_hashes: Vec<ContentHash> = pieces.iter().map(|p| p.hash).collect();
    let merkle_root = build_merkle(&piece_hashes).root();
    let torrent = Torrent {
        content_hash,
        total_size: bytes.len() as u64,
        piece_size: piece_size as u32,
        piece_count: pieces.len() as u32,
        merkle_root,
        piece_hashes,
        metadata,
        created_at: unix_now(),
    };
    Prepared { torrent, pieces }
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn split_pieces() {
        let data = blob(100);
        let pieces = split(&data, 30);
        assert_eq!(pieces.len(), 4);
        assert_eq!(pieces[0].len(), 30);
        assert_eq!(pieces[3].len(), 10);
    }

    #[test]
    fn split_exact_multiple() {
        let data = blob(90);
        let pieces = split(&data, 30);
        assert_eq!(pieces.len(), 3);
        assert!(pieces.iter().all(|p| p.len() == 30));
    }

    #[test]
    fn split_zero_piece_size_uses_default() {
        let data = blob(DEFAULT_PIECE_SIZE * 2);
        assert_eq!(split(&data, 0).len(), 2);
    }

    #[test]
    fn split_empty() {
        assert!(split(&[], 30).is_empty());
    }

    #[test]
    fn verify_rejects_single_flipped_byte() {
        let data = blob(64);
        let h = hash(&data);
        assert!(verify_piece(&data, &h));
        let mut tampered = data.clone();
        tampered[17] ^= 0x01;
        assert!(!verify_piece(&tampered, &h));
    }

    #[test]
    fn merkle_is_deterministic_and_order_sensitive() {
        let leaves: Vec<ContentHash> = (0..5u8).map(|i| hash(&[i])).collect();
        let a = build_merkle(&leaves);
        let b = build_merkle(&leaves);
        assert_eq!(a.root(), b.root());

        let mut swapped = leaves.clone();
        swapped.swap(1, 3);
        assert_ne!(build_merkle(&swapped).root(), a.root());
    }

    #[test]
    fn merkle_duplicates_last_hash_on_odd_levels() {
        let leaves: Vec<ContentHash> = (0..3u8).map(|i| hash(&[i])).collect();
        let tree = build_merkle(&leaves);
        assert_eq!(tree.levels().len(), 3);
        let left = hash_pair(&leaves[0], &leaves[1]);
        let right = hash_pair(&leaves[2], &leaves[2]);
        assert_eq!(tree.root(), hash_pair(&left, &right));
    }

    #[test]
    fn merkle_single_leaf_is_root() {
        let leaf = hash(b"only");
        let tree = build_merkle(&[leaf]);
        assert_eq!(tree.root(), leaf);
        assert_eq!(tree.leaf_count(), 1);
    }

    #[test]
    fn prepare_600k_blob() {
        let data = blob(600_000);
        let prepared = prepare(&data, 262_144, BTreeMap::new());
        let t = &prepared.torrent;
        assert_eq!(t.piece_count, 3);
        assert_eq!(t.piece_len(2), 75_712);
        assert_eq!(prepared.pieces[2].bytes.len(), 75_712);
        assert_eq!(t.content_hash, hash(&data));
        assert!(t.verify().is_ok());
    }

    #[test]
    fn torrent_verify_catches_tampered_hash_list() {
        let data = blob(1000);
        let mut t = prepare(&data, 100, BTreeMap::new()).torrent;
        t.piece_hashes[4] = hash(b"forged");
        assert!(matches!(
            t.verify(),
            Err(TransferError::Integrity { .. })
        ));
    }

    #[test]
    fn torrent_verify_catches_bad_count() {
        let data = blob(1000);
        let mut t = prepare(&data, 100, BTreeMap::new()).torrent;
        t.piece_count = 11;
        assert!(t.verify().is_err());
    }

    #[test]
    fn hex_roundtrip() {
        let h = hash(b"abc");
        assert_eq!(ContentHash::from_hex(&h.to_hex()).unwrap(), h);
        assert!(ContentHash::from_hex("zz").is_err());
        assert!(ContentHash::from_hex("abcd").is_err());
    }
}
