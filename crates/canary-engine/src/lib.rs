//! Scan engine: supervised probe-host workers, the line-JSON wire
//! protocol they speak, the socket-multiplexed worker pool, and the
//! converging regression pipeline on top of it.

pub mod app;
pub mod connection;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod stop;
pub mod supervisor;
pub mod wire;

pub use app::{App, WorkerMetadata};
pub use connection::WorkerConnection;
pub use error::EngineError;
pub use pipeline::{PipelineKnobs, ProbePipeline};
pub use pool::{PoolConfig, run_scans};
pub use stop::StopHandle;
pub use supervisor::WorkerSupervisor;
pub use wire::{Command, Response, ScanResult};
