use thiserror::Error;

use crate::diagnostics::DiagnosticBundle;

/// Failure taxonomy for startup and per-request work.
///
/// `Provision` and `Readiness` only occur during worker initialisation and are
/// fatal there. Every other variant is caught by an orchestrator and turned
/// into a failure envelope.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("{0}")]
    Input(String),

    #[error("{0}")]
    Fetch(String),

    #[error("{0}")]
    Decode(String),

    #[error("{0}")]
    Policy(String),

    #[error("{0}")]
    Provision(String),

    #[error("{0}")]
    Readiness(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchFailure),

    #[error("{0}")]
    Unexpected(String),
}

impl WorkerError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input(_) => "InputError",
            Self::Fetch(_) => "FetchError",
            Self::Decode(_) => "DecodeError",
            Self::Policy(_) => "PolicyError",
            Self::Provision(_) => "ProvisionError",
            Self::Readiness(_) => "ReadinessError",
            Self::Dispatch(_) => "DispatchError",
            Self::Unexpected(_) => "UnexpectedError",
        }
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self::Input(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

/// A backend call that did not produce an image.
#[derive(Debug, Error)]
pub enum DispatchFailure {
    /// The daemon answered with a non-2xx status.
    #[error("upscale request returned HTTP {status}: {body}")]
    DaemonStatus { status: u16, body: String },

    /// The daemon could not be reached or its response could not be read.
    #[error("upscale request failed: {0}")]
    DaemonTransport(String),

    /// The CLI tool exited non-zero or could not be started.
    #[error("{message}")]
    Cli {
        message: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
        diagnostics: Box<DiagnosticBundle>,
    },
}

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;
