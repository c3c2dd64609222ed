//! Per-ID lock bookkeeping shared by the file cache and the artifact cache. Read-locks and
//! write-locks are mutually exclusive on the same ID; concurrent reads are allowed; `Create` is
//! never concurrent with any other state for the same ID.

use crate::error::{CacheError, Result};
use distbuild_base::Id;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug)]
enum State {
    Writing,
    Reading(usize),
}

#[derive(Default)]
pub struct LockTable {
    committed: Mutex<std::collections::HashSet<Id>>,
    locks: Mutex<HashMap<Id, State>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_committed(&self, id: &Id) -> bool {
        self.committed.lock().unwrap().contains(id)
    }

    pub fn mark_committed(&self, id: Id) {
        self.committed.lock().unwrap().insert(id);
    }

    pub fn unmark_committed(&self, id: &Id) {
        self.committed.lock().unwrap().remove(id);
    }

    pub fn committed_ids(&self) -> Vec<Id> {
        self.committed.lock().unwrap().iter().copied().collect()
    }

    /// Reserve a write lock on `id`. The caller must eventually call [`release_write`] (whether
    /// the write is committed or aborted).
    pub fn begin_write(&self, id: Id) -> Result<()> {
        if self.is_committed(&id) {
            return Err(CacheError::Exists);
        }
        let mut locks = self.locks.lock().unwrap();
        if locks.contains_key(&id) {
            return Err(CacheError::WriteLocked);
        }
        locks.insert(id, State::Writing);
        Ok(())
    }

    pub fn release_write(&self, id: &Id) {
        self.locks.lock().unwrap().remove(id);
    }

    /// Acquire a read lock on `id`. Fails if there's no committed entry. The caller must
    /// eventually call [`release_read`] exactly once.
    pub fn begin_read(&self, id: Id) -> Result<()> {
        if !self.is_committed(&id) {
            return Err(CacheError::NotFound);
        }
        let mut locks = self.locks.lock().unwrap();
        match locks.get_mut(&id) {
            Some(State::Writing) => Err(CacheError::WriteLocked),
            Some(State::Reading(count)) => {
                *count += 1;
                Ok(())
            }
            None => {
                locks.insert(id, State::Reading(1));
                Ok(())
            }
        }
    }

    pub fn release_read(&self, id: &Id) {
        let mut locks = self.locks.lock().unwrap();
        if let Some(State::Reading(count)) = locks.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                locks.remove(id);
            }
        }
    }

    /// Check whether `id` may be removed: fails if any reader is outstanding.
    pub fn begin_remove(&self, id: &Id) -> Result<()> {
        if !self.is_committed(id) {
            return Err(CacheError::NotFound);
        }
        let locks = self.locks.lock().unwrap();
        match locks.get(id) {
            Some(State::Reading(count)) if *count > 0 => Err(CacheError::ReadLocked),
            Some(State::Writing) => Err(CacheError::WriteLocked),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> Id {
        Id([b; 16])
    }

    #[test]
    fn concurrent_creates_of_same_id_conflict() {
        let table = LockTable::new();
        table.begin_write(id(1)).unwrap();
        assert_matches::assert_matches!(table.begin_write(id(1)), Err(CacheError::WriteLocked));
    }

    #[test]
    fn create_after_commit_is_exists() {
        let table = LockTable::new();
        table.begin_write(id(1)).unwrap();
        table.release_write(&id(1));
        table.mark_committed(id(1));
        assert_matches::assert_matches!(table.begin_write(id(1)), Err(CacheError::Exists));
    }

    #[test]
    fn remove_while_read_locked_fails() {
        let table = LockTable::new();
        table.mark_committed(id(1));
        table.begin_read(id(1)).unwrap();
        assert_matches::assert_matches!(table.begin_remove(&id(1)), Err(CacheError::ReadLocked));
        table.release_read(&id(1));
        table.begin_remove(&id(1)).unwrap();
    }

    #[test]
    fn concurrent_reads_are_allowed() {
        let table = LockTable::new();
        table.mark_committed(id(1));
        table.begin_read(id(1)).unwrap();
        table.begin_read(id(1)).unwrap();
        table.release_read(&id(1));
        assert_matches::assert_matches!(table.begin_remove(&id(1)), Err(CacheError::ReadLocked));
        table.release_read(&id(1));
        table.begin_remove(&id(1)).unwrap();
    }
}
