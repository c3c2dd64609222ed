//! Content-addressed store for single files, keyed by a 16-byte ID. Used by the coordinator to
//! hold client-uploaded source files, and by the worker to hold source files it has downloaded.

use crate::error::{CacheError, Result};
use crate::lock::LockTable;
use distbuild_base::Id;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt as _;

struct Inner {
    staging_dir: PathBuf,
    committed_dir: PathBuf,
    locks: LockTable,
}

#[derive(Clone)]
pub struct FileCache(Arc<Inner>);

impl FileCache {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let staging_dir = root.join("staging");
        let committed_dir = root.join("committed");
        tokio::fs::create_dir_all(&staging_dir).await?;
        tokio::fs::create_dir_all(&committed_dir).await?;

        let locks = LockTable::new();
        let mut entries = tokio::fs::read_dir(&committed_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = name.parse::<Id>() {
                    locks.mark_committed(id);
                }
            }
        }

        Ok(Self(Arc::new(Inner {
            staging_dir,
            committed_dir,
            locks,
        })))
    }

    fn staging_path(&self, id: &Id) -> PathBuf {
        self.0.staging_dir.join(id.to_string())
    }

    fn committed_path(&self, id: &Id) -> PathBuf {
        self.0.committed_dir.join(id.to_string())
    }

    /// Reserve a write lock on `id` and return the staging path the caller should populate (e.g.
    /// via a hard-link). Call `commit` or `abort` on the returned handle exactly once.
    pub async fn create(&self, id: Id) -> Result<CreateHandle> {
        self.0.locks.begin_write(id)?;
        let path = self.staging_path(&id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let _ = tokio::fs::remove_file(&path).await;
        }
        Ok(CreateHandle {
            cache: self.clone(),
            id,
            path,
            done: false,
        })
    }

    /// Streaming write variant of `create`: returns a writer to stream bytes into directly,
    /// rather than a path for the caller to populate out of band.
    pub async fn write(&self, id: Id) -> Result<WriteHandle> {
        self.0.locks.begin_write(id)?;
        let path = self.staging_path(&id);
        let file = File::create(&path).await?;
        Ok(WriteHandle {
            cache: self.clone(),
            id,
            path,
            file,
            done: false,
        })
    }

    pub async fn get(&self, id: Id) -> Result<ReadHandle> {
        self.0.locks.begin_read(id)?;
        Ok(ReadHandle {
            cache: self.clone(),
            id,
            path: self.committed_path(&id),
            released: false,
        })
    }

    pub async fn remove(&self, id: Id) -> Result<()> {
        self.0.locks.begin_remove(&id)?;
        tokio::fs::remove_file(self.committed_path(&id)).await?;
        self.0.locks.unmark_committed(&id);
        Ok(())
    }

    pub fn range(&self) -> Vec<Id> {
        self.0.locks.committed_ids()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.0.locks.is_committed(id)
    }
}

pub struct CreateHandle {
    cache: FileCache,
    id: Id,
    path: PathBuf,
    done: bool,
}

impl CreateHandle {
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub async fn commit(mut self) -> Result<()> {
        self.done = true;
        let committed = self.cache.committed_path(&self.id);
        tokio::fs::rename(&self.path, &committed).await?;
        self.cache.0.locks.mark_committed(self.id);
        self.cache.0.locks.release_write(&self.id);
        Ok(())
    }

    pub async fn abort(mut self) -> Result<()> {
        self.done = true;
        let _ = tokio::fs::remove_file(&self.path).await;
        self.cache.0.locks.release_write(&self.id);
        Ok(())
    }
}

impl Drop for CreateHandle {
    fn drop(&mut self) {
        if !self.done {
            self.cache.0.locks.release_write(&self.id);
        }
    }
}

pub struct WriteHandle {
    cache: FileCache,
    id: Id,
    path: PathBuf,
    file: File,
    done: bool,
}

impl WriteHandle {
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf).await?;
        Ok(())
    }

    pub fn as_async_write(&mut self) -> &mut (impl tokio::io::AsyncWrite + Unpin) {
        &mut self.file
    }

    pub async fn commit(mut self) -> Result<()> {
        self.done = true;
        self.file.flush().await?;
        self.file.sync_all().await?;
        let committed = self.cache.committed_path(&self.id);
        tokio::fs::rename(&self.path, &committed).await?;
        self.cache.0.locks.mark_committed(self.id);
        self.cache.0.locks.release_write(&self.id);
        Ok(())
    }

    pub async fn abort(mut self) -> Result<()> {
        self.done = true;
        let _ = tokio::fs::remove_file(&self.path).await;
        self.cache.0.locks.release_write(&self.id);
        Ok(())
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if !self.done {
            self.cache.0.locks.release_write(&self.id);
        }
    }
}

pub struct ReadHandle {
    cache: FileCache,
    id: Id,
    path: PathBuf,
    released: bool,
}

impl ReadHandle {
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn release(mut self) {
        self.released = true;
        self.cache.0.locks.release_read(&self.id);
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        if !self.released {
            self.cache.0.locks.release_read(&self.id);
        }
    }
}

impl From<CacheError> for std::io::Error {
    fn from(e: CacheError) -> Self {
        std::io::Error::new(std::io::ErrorKind::Other, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_round_trips_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).await.unwrap();
        let id = Id([9; 16]);

        let handle = cache.create(id).await.unwrap();
        tokio::fs::write(handle.path(), b"hello").await.unwrap();
        handle.commit().await.unwrap();

        let read = cache.get(id).await.unwrap();
        assert_eq!(tokio::fs::read(read.path()).await.unwrap(), b"hello");
        assert!(cache.contains(&id));
    }

    #[tokio::test]
    async fn abort_leaves_no_committed_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).await.unwrap();
        let id = Id([2; 16]);

        let handle = cache.create(id).await.unwrap();
        tokio::fs::write(handle.path(), b"discard me").await.unwrap();
        handle.abort().await.unwrap();

        assert!(!cache.contains(&id));
        assert_matches::assert_matches!(cache.get(id).await, Err(CacheError::NotFound));
        // the write lock was released, so a fresh create is allowed.
        cache.create(id).await.unwrap();
    }

    #[tokio::test]
    async fn double_create_after_commit_is_exists() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).await.unwrap();
        let id = Id([1; 16]);
        cache.create(id).await.unwrap().commit().await.unwrap();
        let err = cache.create(id).await.unwrap_err();
        assert_matches::assert_matches!(err, CacheError::Exists);
    }

    #[tokio::test]
    async fn concurrent_create_is_write_locked() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).await.unwrap();
        let id = Id([3; 16]);
        let _first = cache.create(id).await.unwrap();
        assert_matches::assert_matches!(cache.create(id).await, Err(CacheError::WriteLocked));
    }

    #[tokio::test]
    async fn write_handle_streams_bytes_to_a_committed_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).await.unwrap();
        let id = Id([4; 16]);

        let mut handle = cache.write(id).await.unwrap();
        handle.write_all(b"streamed ").await.unwrap();
        handle.write_all(b"bytes").await.unwrap();
        handle.commit().await.unwrap();

        let read = cache.get(id).await.unwrap();
        assert_eq!(tokio::fs::read(read.path()).await.unwrap(), b"streamed bytes");
    }

    #[tokio::test]
    async fn remove_while_read_locked_fails_then_succeeds_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).await.unwrap();
        let id = Id([5; 16]);
        cache.create(id).await.unwrap().commit().await.unwrap();

        let read = cache.get(id).await.unwrap();
        assert_matches::assert_matches!(cache.remove(id).await, Err(CacheError::ReadLocked));
        read.release();

        cache.remove(id).await.unwrap();
        assert!(!cache.contains(&id));
    }

    #[tokio::test]
    async fn range_lists_only_committed_ids() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).await.unwrap();
        let committed = Id([6; 16]);
        cache.create(committed).await.unwrap().commit().await.unwrap();
        let _uncommitted_handle = cache.create(Id([8; 16])).await.unwrap();

        assert_eq!(cache.range(), vec![committed]);
    }

    #[tokio::test]
    async fn new_discovers_previously_committed_entries_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let id = Id([10; 16]);
        {
            let cache = FileCache::new(dir.path()).await.unwrap();
            let handle = cache.create(id).await.unwrap();
            tokio::fs::write(handle.path(), b"persisted").await.unwrap();
            handle.commit().await.unwrap();
        }

        let reopened = FileCache::new(dir.path()).await.unwrap();
        assert!(reopened.contains(&id));
        let read = reopened.get(id).await.unwrap();
        assert_eq!(tokio::fs::read(read.path()).await.unwrap(), b"persisted");
    }
}
