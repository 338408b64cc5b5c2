use std::io;
use std::time::Duration;

/// Failure modes of the scan engine. `Transport` and `Timeout` are
/// recovered locally where possible; the rest surface to the caller
/// with enough context to correlate with log lines.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("worker {worker_id} failed to start: {reason}")]
    Startup { worker_id: String, reason: String },

    #[error("transport failure on worker port {port}: {source}")]
    Transport {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("worker {worker_id} sent a malformed response: {raw}")]
    Protocol { worker_id: String, raw: String },

    #[error("all workers were lost with {remaining} chunks left")]
    WorkersLost { remaining: usize },

    #[error("scan needs {needed} sockets but the open-file limit is {limit}")]
    SocketBudget { needed: u64, limit: u64 },

    #[error("run cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}
