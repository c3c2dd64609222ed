use distbuild_base::Id;
use distbuild_util::config::WorkerId;
use rand::seq::SliceRandom as _;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

const MAX_REPLICAS: usize = 4;

/// Maps job ID to the (bounded) list of workers that claim to hold its output artifact. Bounded
/// at 4 entries; the oldest reporter is evicted on overflow.
#[derive(Default)]
pub struct LocationIndex {
    locations: RwLock<HashMap<Id, VecDeque<WorkerId>>>,
}

impl LocationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, id: Id, worker: WorkerId) {
        let mut locations = self.locations.write().unwrap();
        let entry = locations.entry(id).or_default();
        entry.retain(|w| w != &worker);
        entry.push_back(worker);
        while entry.len() > MAX_REPLICAS {
            entry.pop_front();
        }
    }

    /// Return a uniformly random replica, or `None` if the artifact isn't located anywhere.
    /// Tie-breaking is intentionally randomized to spread load across replicas.
    pub fn locate(&self, id: &Id) -> Option<WorkerId> {
        let locations = self.locations.read().unwrap();
        let entry = locations.get(id)?;
        entry.iter().collect::<Vec<_>>().choose(&mut rand::thread_rng()).map(|w| (*w).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_replica_list_at_four_fifo() {
        let idx = LocationIndex::new();
        let id = Id([1; 16]);
        for i in 0..6u8 {
            idx.report(id, WorkerId::new(format!("worker-{i}")));
        }
        let locations = idx.locations.read().unwrap();
        let entry = locations.get(&id).unwrap();
        assert_eq!(entry.len(), 4);
        assert_eq!(entry.front().unwrap().as_str(), "worker-2");
        assert_eq!(entry.back().unwrap().as_str(), "worker-5");
    }

    #[test]
    fn locate_on_unknown_id_is_none() {
        let idx = LocationIndex::new();
        assert!(idx.locate(&Id([9; 16])).is_none());
    }

    #[test]
    fn locate_returns_a_reported_worker() {
        let idx = LocationIndex::new();
        let id = Id([1; 16]);
        idx.report(id, WorkerId::new("w1"));
        assert_eq!(idx.locate(&id).unwrap().as_str(), "w1");
    }
}
