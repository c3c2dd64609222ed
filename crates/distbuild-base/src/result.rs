use crate::Id;
use serde::{Deserialize, Serialize};

/// The outcome of running a job. `error` is populated only for infrastructural failures (a
/// process that failed to spawn, an I/O error downloading an input); a nonzero `exit_code` alone
/// is not an error, it's data.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub id: Id,
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub error: Option<String>,
}

impl JobResult {
    pub fn is_infrastructural_failure(&self) -> bool {
        self.error.is_some()
    }
}
