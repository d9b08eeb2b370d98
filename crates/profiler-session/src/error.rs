//! Error types for profiler-session

use std::fmt;
use std::sync::Arc;

use runner_cache::AcquisitionError;
use serde::Serialize;
use thiserror::Error;

/// Result type alias for profiler operations
pub type Result<T> = std::result::Result<T, ProfilerError>;

/// Everything the runner printed before a failure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl fmt::Display for CapturedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stdout:\n{}\nstderr:\n{}", self.stdout, self.stderr)
    }
}

/// Errors that can occur while driving a profiling session
#[derive(Debug, Error)]
pub enum ProfilerError {
    /// Invalid or conflicting configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Operation called in the wrong lifecycle state
    #[error("Invalid state: {message}")]
    State { message: String },

    /// The runner could not be acquired
    #[error("Runner acquisition failed: {0}")]
    Acquisition(#[source] Arc<AcquisitionError>),

    /// Failed to spawn the runner process
    #[error("Failed to spawn runner process: {message}")]
    SpawnFailed {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The runner never reported a connection
    #[error("{message}\n{output}")]
    Protocol {
        message: String,
        output: CapturedOutput,
    },

    /// The runner exited abnormally or did not exit in time
    #[error("{message} (exit code {exit_code:?})\n{output}")]
    Process {
        message: String,
        exit_code: Option<i32>,
        output: CapturedOutput,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProfilerError {
    /// Create a Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a State error
    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Create a SpawnFailed error with source
    pub fn spawn_failed_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::SpawnFailed {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a SpawnFailed error
    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self::SpawnFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Runner output captured before the failure, if any
    pub fn output(&self) -> Option<&CapturedOutput> {
        match self {
            Self::Protocol { output, .. } | Self::Process { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Whether acquisition was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Acquisition(e) if e.is_cancelled())
    }
}

impl From<AcquisitionError> for ProfilerError {
    fn from(e: AcquisitionError) -> Self {
        Self::Acquisition(Arc::new(e))
    }
}

impl From<Arc<AcquisitionError>> for ProfilerError {
    fn from(e: Arc<AcquisitionError>) -> Self {
        Self::Acquisition(e)
    }
}
