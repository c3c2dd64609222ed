//! The worker's in-memory job-result cache: keyed by job ID, unbounded. A hit lets the run loop
//! short-circuit a job without re-downloading inputs or re-executing anything. Acceptable for a
//! short-lived worker process; a long-running deployment would need eviction (see DESIGN.md).

use distbuild_base::{Id, JobResult};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct JobResultCache {
    results: Mutex<HashMap<Id, JobResult>>,
}

impl JobResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Id) -> Option<JobResult> {
        self.results.lock().unwrap().get(id).cloned()
    }

    pub fn insert(&self, result: JobResult) {
        self.results.lock().unwrap().insert(result.id, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_after_insert() {
        let cache = JobResultCache::new();
        let id = Id([1; 16]);
        assert!(cache.get(&id).is_none());
        cache.insert(JobResult {
            id,
            exit_code: 0,
            stdout: b"OK\n".to_vec(),
            stderr: vec![],
            error: None,
        });
        assert_eq!(cache.get(&id).unwrap().stdout, b"OK\n");
    }
}
