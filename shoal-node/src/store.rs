//! On-disk piece store.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use shoal_core::{ContentHash, Piece, PieceStore, StoreError, Torrent};
use tracing::debug;

/// Filesystem `PieceStore`. Records are bincode and written atomically.
///
/// Directory layout:
/// ```text
/// {data_dir}/
///   pieces/
///     {content_hash}/
///       {index}        piece record
///       {index}.tmp    temp file during atomic write
///   torrents/
///     {content_hash}.torrent
/// ```
#[derive(Debug)]
pub struct FsStore {
    base_dir: PathBuf,
}

impl FsStore {
    /// Open a store at `base_dir`, creating the directory structure if needed.
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        for dir in [base_dir.join("pieces"), base_dir.join("torrents")] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create store dir: {}", dir.display()))?;
        }
        Ok(Self { base_dir })
    }

    fn content_dir(&self, content_hash: &ContentHash) -> PathBuf {
        self.base_dir.join("pieces").join(content_hash.to_hex())
    }

    fn torrent_path(&self, content_hash: &ContentHash) -> PathBuf {
        self.base_dir
            .join("torrents")
            .join(format!("{}.torrent", content_hash.to_hex()))
    }
}

fn io_err(context: &str, path: &Path, e: std::io::Error) -> StoreError {
    StoreError::Io(format!("{context} {}: {e}", path.display()))
}

/// Write to `{path}.tmp`, fsync, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = fs::File::create(&tmp).map_err(|e| io_err("create", &tmp, e))?;
        file.write_all(bytes).map_err(|e| io_err("write", &tmp, e))?;
        file.sync_all().map_err(|e| io_err("fsync", &tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| io_err("rename", path, e))
}

/// Read a file, mapping "not found" to `None`.
fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err("read", path, e)),
    }
}

fn read_dir_names(dir: &Path) -> Result<Vec<String>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err("list", dir, e)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| io_err("list", dir, e))?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

impl PieceStore for FsStore {
    fn put(&self, piece: &Piece) -> Result<(), StoreError> {
        let dir = self.content_dir(&piece.content_hash);
        fs::create_dir_all(&dir).map_err(|e| io_err("create", &dir, e))?;
        let bytes = bincode::serialize(piece).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        write_atomic(&dir.join(piece.index.to_string()), &bytes)?;
        debug!(
            content = %piece.content_hash,
            piece = piece.index,
            bytes = piece.bytes.len(),
            "Stored piece"
        );
        Ok(())
    }

    fn get(&self, content_hash: &ContentHash, index: u32) -> Result<Option<Piece>, StoreError> {
        let path = self.content_dir(content_hash).join(index.to_string());
        let Some(bytes) = read_optional(&path)? else {
            return Ok(None);
        };
        let piece: Piece = bincode::deserialize(&bytes)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
        if piece.content_hash != *content_hash || piece.index != index {
            return Err(StoreError::Corrupt(format!(
                "{} holds a different piece",
                path.display()
            )));
        }
        Ok(Some(piece))
    }

    fn list_indices(&self, content_hash: &ContentHash) -> Result<Vec<u32>, StoreError> {
        let mut indices: Vec<u32> = read_dir_names(&self.content_dir(content_hash))?
            .iter()
            .filter_map(|name| name.parse::<u32>().ok())
            .collect();
        indices.sort_unstable();
        Ok(indices)
    }

    fn delete(&self, content_hash: &ContentHash, index: u32) -> Result<(), StoreError> {
        let path = self.content_dir(content_hash).join(index.to_string());
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("remove", &path, e)),
        }
    }

    fn put_torrent(&self, torrent: &Torrent) -> Result<(), StoreError> {
        let bytes = bincode::serialize(torrent).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        write_atomic(&self.torrent_path(&torrent.content_hash), &bytes)
    }

    fn get_torrent(&self, content_hash: &ContentHash) -> Result<Option<Torrent>, StoreError> {
        let path = self.torrent_path(content_hash);
        let Some(bytes) = read_optional(&path)? else {
            return Ok(None);
        };
        bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))
    }

    fn delete_torrent(&self, content_hash: &ContentHash) -> Result<(), StoreError> {
        let path = self.torrent_path(content_hash);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("remove", &path, e)),
        }
    }

    fn list_torrents(&self) -> Result<Vec<ContentHash>, StoreError> {
        let mut hashes: Vec<ContentHash> = read_dir_names(&self.base_dir.join("torrents"))?
            .iter()
            .filter_map(|name| name.strip_suffix(".torrent"))
            .filter_map(|hex| ContentHash::from_hex(hex).ok())
            .collect();
        hashes.sort();
        Ok(hashes)
    }
}
