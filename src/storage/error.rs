//! Storage layer error types.

use crate::storage::page::FileId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the storage layer.
///
/// Not-found and conflict variants are expected outcomes surfaced to the
/// caller unchanged; `PoolExhausted` means every frame is pinned and the
/// caller must release pins before retrying; `Io` is fatal at this layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("file already exists: {}", .0.display())]
    FileExists(PathBuf),

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("file is not open: {0:?}")]
    FileNotOpen(FileId),

    #[error("file has not been closed: {}", .0.display())]
    FileNotClosed(PathBuf),

    #[error("page {page_no} does not exist")]
    PageNotExist { page_no: u32 },

    #[error("record not found at page {page_no}, slot {slot_no}")]
    RecordNotFound { page_no: u32, slot_no: u32 },

    #[error("index entry not found")]
    IndexEntryNotFound,

    #[error("buffer pool exhausted: all frames are pinned")]
    PoolExhausted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
