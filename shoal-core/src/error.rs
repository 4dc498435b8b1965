//! Transfer error taxonomy. Every variant names the content it concerns.

use crate::content::ContentHash;
use crate::store::StoreError;

/// Failure of a publish, fetch or cancel, or of a single piece inside one.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransferError {
    #[error("invalid input: {reason}")]
    Validation { reason: String },
    #[error("integrity check failed for {content_hash} (piece {piece:?}): {reason}")]
    Integrity {
        content_hash: ContentHash,
        piece: Option<u32>,
        reason: String,
    },
    #[error("no metadata or peers for {content_hash}")]
    NotFound { content_hash: ContentHash },
    #[error("timed out on {content_hash} (piece {piece:?})")]
    Timeout {
        content_hash: ContentHash,
        piece: Option<u32>,
    },
    #[error("storage failure for {content_hash} (piece {piece:?}): {source}")]
    Storage {
        content_hash: ContentHash,
        piece: Option<u32>,
        #[source]
        source: StoreError,
    },
    #[error("concurrent download limit of {limit} reached")]
    Resource { limit: usize },
    #[error("transfer of {content_hash} cancelled")]
    Cancelled { content_hash: ContentHash },
}

impl TransferError {
    /// Content hash the error is about, if it concerns a single transfer.
    pub fn content_hash(&self) -> Option<ContentHash> {
        match self {
            TransferError::Integrity { content_hash, .. }
            | TransferError::NotFound { content_hash }
            | TransferError::Timeout { content_hash, .. }
            | TransferError::Storage { content_hash, .. }
            | TransferError::Cancelled { content_hash } => Some(*content_hash),
            TransferError::Validation { .. } | TransferError::Resource { .. } => None,
        }
    }

    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        TransferError::Validation {
            reason: reason.into(),
        }
    }

    pub(crate) fn storage(content_hash: ContentHash, piece: Option<u32>, source: StoreError) -> Self {
        TransferError::Storage {
            content_hash,
            piece,
            source,
        }
    }
}
