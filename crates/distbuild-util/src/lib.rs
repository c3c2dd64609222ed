//! Functionality that's convenient for the coordinator, the worker, or the client, but which
//! isn't specific to any one of them.

pub mod config;
pub mod fs;
pub mod net;
pub mod process;
pub mod sync;
