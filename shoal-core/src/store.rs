//! Piece store adapter: the engine's view of the durable object store.
//! Keys are (content hash, piece index) and are written once, so writers never race on a key.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::content::{ContentHash, Piece, Torrent};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("store unavailable")]
    Unavailable,
}

/// Durable store collaborator. Implementations use interior mutability so a single
/// handle can be shared between the engine and its host.
pub trait PieceStore: Send + Sync {
    /// Persist a verified piece, replacing any previous record for the key.
    fn put(&self, piece: &Piece) -> Result<(), StoreError>;
    fn get(&self, content_hash: &ContentHash, index: u32) -> Result<Option<Piece>, StoreError>;
    /// Indices present for `content_hash`, ascending.
    fn list_indices(&self, content_hash: &ContentHash) -> Result<Vec<u32>, StoreError>;
    fn delete(&self, content_hash: &ContentHash, index: u32) -> Result<(), StoreError>;
    fn put_torrent(&self, torrent: &Torrent) -> Result<(), StoreError>;
    fn get_torrent(&self, content_hash: &ContentHash) -> Result<Option<Torrent>, StoreError>;
    /// Remove a torrent record. Missing records are not an error.
    fn delete_torrent(&self, content_hash: &ContentHash) -> Result<(), StoreError>;
    /// Every content hash with a stored torrent.
    fn list_torrents(&self) -> Result<Vec<ContentHash>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    pieces: HashMap<ContentHash, BTreeMap<u32, Piece>>,
    torrents: BTreeMap<ContentHash, Torrent>,
}

/// In-memory store for tests and loop-back use.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Unavailable)
    }
}

impl PieceStore for MemoryStore {
    fn put(&self, piece: &Piece) -> Result<(), StoreError> {
        self.lock()?
            .pieces
            .entry(piece.content_hash)
            .or_default()
            .insert(piece.index, piece.clone());
        Ok(())
    }

    fn get(&self, content_hash: &ContentHash, index: u32) -> Result<Option<Piece>, StoreError> {
        Ok(self
            .lock()?
            .pieces
            .get(content_hash)
            .and_then(|m| m.get(&index))
            .cloned())
    }

    fn list_indices(&self, content_hash: &ContentHash) -> Result<Vec<u32>, StoreError> {
        Ok(self
            .lock()?
            .pieces
            .get(content_hash)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default())
    }

    fn delete(&self, content_hash: &ContentHash, index: u32) -> Result<(), StoreError> {
        if let Some(m) = self.lock()?.pieces.get_mut(content_hash) {
            m.remove(&index);
        }
        Ok(())
    }

    fn put_torrent(&self, torrent: &Torrent) -> Result<(), StoreError> {
        self.lock()?
            .torrents
            .insert(torrent.content_hash, torrent.clone());
        Ok(())
    }

    fn get_torrent(&self, content_hash: &ContentHash) -> Result<Option<Torrent>, StoreError> {
        Ok(self.lock()?.torrents.get(content_hash).cloned())
    }

    fn delete_torrent(&self, content_hash: &ContentHash) -> Result<(), StoreError> {
        self.lock()?.torrents.remove(content_hash);
        Ok(())
    }

    fn list_torrents(&self) -> Result<Vec<ContentHash>, StoreError> {
        Ok(self.lock()?.torrents.keys().copied().collect())
    }
}
