use thiserror::Error;

/// Programmatic errors from a cache operation, distinct from the I/O errors that get wrapped in
/// `anyhow::Error` elsewhere: callers branch on these (the file-cache PUT handler retries once on
/// `Exists`; the HTTP layer maps `NotFound` to 404).
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("id already committed")]
    Exists,
    #[error("id is write-locked by another writer")]
    WriteLocked,
    #[error("id is read-locked by an outstanding reader")]
    ReadLocked,
    #[error("no committed entry for this id")]
    NotFound,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;
