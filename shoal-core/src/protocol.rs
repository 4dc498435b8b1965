//! Shoal wire protocol: message types and version.

use serde::{Deserialize, Serialize};

use crate::bitfield::Bitfield;
use crate::content::{ContentHash, Torrent};

/// Current protocol version. Used in the transport handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// All peer messages. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Pieces the sender holds. `signature` is the sender's `Signer::sign` over `announce_bytes`.
    Announce {
        content_hash: ContentHash,
        bitfield: Bitfield,
        signature: Vec<u8>,
    },
    PieceRequest {
        content_hash: ContentHash,
        piece_index: u32,
    },
    /// Piece payload, encrypted for the receiver.
    PieceData {
        content_hash: ContentHash,
        piece_index: u32,
        payload: Vec<u8>,
        piece_hash: ContentHash,
    },
    /// Fountain fallback: XOR of `indices`, zero-padded to the piece size.
    EncodedUnit {
        content_hash: ContentHash,
        degree: u8,
        indices: Vec<u32>,
        xor_bytes: Vec<u8>,
    },
    /// Ask for the torrent of a content hash.
    MetadataRequest { content_hash: ContentHash },
    Metadata { torrent: Torrent },
    /// Download stalled: ask for encoded units.
    UnitsRequest { content_hash: ContentHash },
    /// Sender lost interest; drop its queued requests.
    Cancel { content_hash: ContentHash },
}

impl Message {
    pub fn content_hash(&self) -> &ContentHash {
        match self {
            Message::Announce { content_hash, .. }
            | Message::PieceRequest { content_hash, .. }
            | Message::PieceData { content_hash, .. }
            | Message::EncodedUnit { content_hash, .. }
            | Message::MetadataRequest { content_hash }
            | Message::UnitsRequest { content_hash }
            | Message::Cancel { content_hash } => content_hash,
            Message::Metadata { torrent } => &torrent.content_hash,
        }
    }
}

/// Bytes covered by an announce signature.
pub fn announce_bytes(content_hash: &ContentHash, bitfield: &Bitfield) -> Vec<u8> {
    let mut out = b"shoal-announce".to_vec();
    out.extend_from_slice(content_hash.as_bytes());
    out.extend_from_slice(&bitfield.to_bytes());
    out
}
