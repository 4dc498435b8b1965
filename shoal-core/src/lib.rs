//! Shoal transfer engine: content-addressed bulk data exchange between peers.
//! Host-driven: no I/O; the host feeds events and ticks and supplies the collaborators.

pub mod bitfield;
pub mod choke;
pub mod config;
pub mod content;
pub mod engine;
pub mod error;
pub mod fountain;
pub mod host;
pub mod identity;
pub mod protocol;
pub mod scheduler;
pub mod store;
pub mod swarm;
pub mod wire;

pub use bitfield::Bitfield;
pub use config::EngineConfig;
pub use content::{ContentHash, Piece, Prepared, Torrent};
pub use engine::{Collaborators, DownloadPhase, Engine, FetchStatus, UploadState};
pub use error::TransferError;
pub use host::{NoopNotifier, Notifier, Signer, Transport};
pub use identity::{CryptoError, Keypair, Keyring, PeerId, PublicKey};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use store::{MemoryStore, PieceStore, StoreError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
