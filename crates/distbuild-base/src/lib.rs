//! Core data types shared by the distbuild coordinator, worker, and client: IDs, the job graph,
//! job results, and the wire envelopes exchanged over HTTP. Nothing in this crate talks to a
//! socket or the filesystem; it's pure data plus the topological sort that the coordinator needs.

mod id;
mod job;
mod result;

pub mod proto;

pub use id::{Id, IdParseError};
pub use job::{Cmd, Graph, Job};
pub use result::JobResult;
