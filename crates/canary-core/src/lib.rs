//! Host databases, run logs and progress accounting for the scan harness.

pub mod cache;
pub mod certdb;
pub mod progress;
pub mod runlog;
pub mod sources;
pub mod sources_db;
pub mod tags;
pub mod workdir;

pub use sources::{Host, HostSet, Sources};
pub use workdir::Workdir;
