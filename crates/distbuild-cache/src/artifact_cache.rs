//! Content-addressed store for whole directories, keyed by job ID (a job and its output artifact
//! share an ID). Used on workers to hold job outputs that other workers, or the worker's own job
//! executor, read as dependency inputs.

use crate::error::Result;
use crate::lock::LockTable;
use distbuild_base::Id;
use std::path::PathBuf;
use std::sync::Arc;

struct Inner {
    staging_dir: PathBuf,
    committed_dir: PathBuf,
    locks: LockTable,
}

#[derive(Clone)]
pub struct ArtifactCache(Arc<Inner>);

impl ArtifactCache {
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

    /// Reserve a write lock on `id` and return a fresh, empty staging directory to populate
    /// (e.g. the job executor writes command output here). Call `commit` or `abort` exactly once.
    pub async fn create(&self, id: Id) -> Result<CreateHandle> {
        self.0.locks.begin_write(id)?;
        let path = self.staging_path(&id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let _ = tokio::fs::remove_dir_all(&path).await;
        }
        tokio::fs::create_dir_all(&path).await?;
        Ok(CreateHandle {
            cache: self.clone(),
            id,
            path,
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
        tokio::fs::remove_dir_all(self.committed_path(&id)).await?;
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
    cache: ArtifactCache,
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
        let _ = tokio::fs::remove_dir_all(&self.path).await;
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

pub struct ReadHandle {
    cache: ArtifactCache,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_round_trips_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path()).await.unwrap();
        let id = Id([7; 16]);

        let handle = cache.create(id).await.unwrap();
        tokio::fs::write(handle.path().join("out.txt"), b"hi").await.unwrap();
        handle.commit().await.unwrap();

        let read = cache.get(id).await.unwrap();
        let contents = tokio::fs::read(read.path().join("out.txt")).await.unwrap();
        assert_eq!(contents, b"hi");
    }

    #[tokio::test]
    async fn double_create_after_commit_is_exists() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path()).await.unwrap();
        let id = Id([1; 16]);
        cache.create(id).await.unwrap().commit().await.unwrap();
        let err = cache.create(id).await.unwrap_err();
        assert_matches::assert_matches!(err, crate::error::CacheError::Exists);
    }
}
