use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Backend unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },

    #[error("Malformed response from backend: {0}")]
    MalformedResponse(String),

    #[error("Backend returned HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Authentication failed: {0}")]
    Auth(String),
}

impl TransportError {
    /// Errors that mean "try again next cycle" rather than "this call is wrong".
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable { .. } => true,
            Self::Status { status, .. } => status.is_server_error(),
            Self::MalformedResponse(_) | Self::Auth(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("Failed to spawn compute process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Exception in compute process")]
    Exception,

    #[error("Compute process exited unexpectedly: {0}")]
    Crashed(String),

    #[error("Compute process for {0} is terminated")]
    Terminated(String),

    #[error("Compute call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Compute protocol error: {0}")]
    Protocol(#[from] ab_core::error::Error),

    #[error("Compute pipe error: {0}")]
    Io(#[from] std::io::Error),
}

impl ComputeError {
    /// True when the supervisor that produced this error can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Spawn(_) | Self::Crashed(_) | Self::Terminated(_) | Self::Timeout(_) | Self::Io(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error("No usable compute backends remain")]
    NoComputeBackends,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
