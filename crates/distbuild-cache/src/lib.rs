//! Content-addressed, disk-backed stores with reader/writer locking. The file cache holds single
//! files (source files); the artifact cache holds whole directories (job outputs). Both guarantee
//! that a committed entry is immutable and that `Remove` + re-`Create` is the only update path.

mod artifact_cache;
pub mod error;
mod file_cache;
mod lock;
pub mod tar;

pub use artifact_cache::{ArtifactCache, CreateHandle as ArtifactCreateHandle, ReadHandle as ArtifactReadHandle};
pub use error::CacheError;
pub use file_cache::{
    CreateHandle as FileCreateHandle, FileCache, ReadHandle as FileReadHandle, WriteHandle as FileWriteHandle,
};
