use tlscanary_core::runlog::RunLogError;
use tlscanary_core::sources::SourcesError;
use tlscanary_engine::EngineError;

/// Top-level failure classes, mapped onto process exit codes in `main`.
#[derive(Debug, thiserror::Error)]
pub enum CanaryError {
    /// Environment or setup problem (exit code 5).
    #[error("{0}")]
    Setup(String),

    /// The user interrupted the run (exit code 10).
    #[error("user interrupt")]
    Interrupted,

    /// A required external tool is not installed (exit code 11).
    #[error("external tool missing: {0}")]
    ExternalTool(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<EngineError> for CanaryError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Cancelled => CanaryError::Interrupted,
            EngineError::Startup { .. } | EngineError::SocketBudget { .. } => {
                CanaryError::Setup(err.to_string())
            }
            other => CanaryError::Other(other.into()),
        }
    }
}

impl From<RunLogError> for CanaryError {
    fn from(err: RunLogError) -> Self {
        CanaryError::Other(anyhow::Error::new(err))
    }
}

impl From<SourcesError> for CanaryError {
    fn from(err: SourcesError) -> Self {
        CanaryError::Other(anyhow::Error::new(err))
    }
}

impl CanaryError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CanaryError::Setup(_) => 5,
            CanaryError::Interrupted => 10,
            CanaryError::ExternalTool(_) => 11,
            CanaryError::Other(_) => 5,
        }
    }
}
