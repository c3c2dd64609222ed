use crate::Id;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// One command within a job. `Exec` runs a child process; `CatTemplate` writes a literal string
/// to a path without spawning anything (useful for generated config files, version stamps, etc).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Cmd {
    Exec {
        argv: Vec<String>,
        working_dir: PathBuf,
        environ: Vec<String>,
    },
    CatTemplate { cat_template: String, cat_output: PathBuf },
}

/// A single command-group with content-addressed inputs and one output directory.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Id,
    pub name: String,
    pub cmds: Vec<Cmd>,
    pub deps: Vec<Id>,
    pub inputs: Vec<PathBuf>,
}

/// A client-submitted DAG of jobs, plus the mapping from content-addressed source-file ID to the
/// client-relative path it should be materialized at.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Graph {
    pub jobs: Vec<Job>,
    pub source_files: HashMap<Id, PathBuf>,
}

impl Graph {
    /// Topologically sort `jobs` so that every job appears after all of its dependencies.
    ///
    /// Panics on a cycle; the scheduler's `SignalBuild` path assumes this has already been
    /// validated client-side and treats a cycle as an invariant violation (see the coordinator's
    /// `topo_sort`).
    pub fn topo_sort(&self) -> Vec<Job> {
        let mut by_id: HashMap<Id, &Job> = self.jobs.iter().map(|j| (j.id, j)).collect();
        let mut visited: HashMap<Id, bool> = HashMap::new();
        let mut order = Vec::with_capacity(self.jobs.len());

        fn visit<'a>(
            id: Id,
            by_id: &HashMap<Id, &'a Job>,
            visited: &mut HashMap<Id, bool>,
            order: &mut Vec<&'a Job>,
        ) {
            match visited.get(&id) {
                Some(true) => return,
                Some(false) => panic!("cycle detected in job graph at {id}"),
                None => {}
            }
            visited.insert(id, false);
            let job = by_id
                .get(&id)
                .unwrap_or_else(|| panic!("job {id} depends on unknown job"));
            for dep in &job.deps {
                visit(*dep, by_id, visited, order);
            }
            visited.insert(id, true);
            order.push(job);
        }

        for job in &self.jobs {
            visit(job.id, &by_id, &mut visited, &mut order);
        }
        by_id.clear();
        order.into_iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: u8, deps: Vec<u8>) -> Job {
        Job {
            id: Id([id; 16]),
            name: format!("job-{id}"),
            cmds: vec![],
            deps: deps.into_iter().map(|d| Id([d; 16])).collect(),
            inputs: vec![],
        }
    }

    #[test]
    fn topo_sort_orders_deps_before_dependents() {
        let graph = Graph {
            jobs: vec![job(3, vec![1, 2]), job(1, vec![]), job(2, vec![1])],
            source_files: HashMap::new(),
        };
        let sorted = graph.topo_sort();
        let pos = |id: u8| sorted.iter().position(|j| j.id == Id([id; 16])).unwrap();
        assert!(pos(1) < pos(2));
        assert!(pos(2) < pos(3));
        assert!(pos(1) < pos(3));
    }

    #[test]
    #[should_panic(expected = "cycle detected")]
    fn topo_sort_panics_on_cycle() {
        let graph = Graph {
            jobs: vec![job(1, vec![2]), job(2, vec![1])],
            source_files: HashMap::new(),
        };
        graph.topo_sort();
    }
}
