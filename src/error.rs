//! Custom error types for the application.
//!
//! This module defines the primary error type, `OilerError`, shared by the settings store,
//! both device clients and the procedure sequencer. Using the `thiserror` crate, it keeps
//! the error taxonomy in one place so that a failure deep inside a device round-trip
//! reaches the operator with the same classification it started with.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: a link to the controller or the oiler could not be established, or
//!   was lost while a command was in flight.
//! - **`Protocol`**: the peer answered with something that could not be understood, or an
//!   expected service/characteristic is missing.
//! - **`Device`**: the peer understood the request and reported a failure code.
//! - **`Timeout`**: no answer arrived within the bound for the operation.
//! - **`Config`**: the persisted settings are malformed or out of range. Always names the
//!   offending field.
//! - **`Busy`**: a procedure run was requested while another one is in flight.
//! - **`Aborted`**: the operator cancelled a run.
//! - **`StepFailed`**: a procedure stopped at a failing step; carries that step's
//!   classification.
//! - **`Io`**: persistence failures while writing the settings file.
//!
//! [`ErrorKind`] is the copyable classification carried in run outcomes and status
//! messages, where the full error (which may own an `io::Error`) cannot be cloned.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, OilerError>;

#[derive(Error, Debug)]
pub enum OilerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Device reported error {code}: {message}")]
    Device { code: i32, message: String },

    #[error("Timed out after {after:?} waiting for {operation}")]
    Timeout { operation: String, after: Duration },

    #[error("Configuration error in '{field}': {reason}")]
    Config { field: String, reason: String },

    #[error("A procedure run is already in progress")]
    Busy,

    #[error("Procedure aborted by operator")]
    Aborted,

    #[error("Procedure failed at step {step} ({kind}): {reason}")]
    StepFailed {
        step: usize,
        kind: ErrorKind,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification of an [`OilerError`], safe to copy into run records and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Link could not be established or was lost
    Connection,
    /// Malformed or unexpected response
    Protocol,
    /// Peer reported a failure code
    Device,
    /// No response within the bound
    Timeout,
    /// Invalid persisted data
    Config,
    /// Concurrent run rejected
    Busy,
    /// Operator cancelled
    Aborted,
    /// Filesystem failure
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connection => "connection",
            Self::Protocol => "protocol",
            Self::Device => "device",
            Self::Timeout => "timeout",
            Self::Config => "config",
            Self::Busy => "busy",
            Self::Aborted => "aborted",
            Self::Io => "io",
        };
        f.write_str(name)
    }
}

impl OilerError {
    /// Build a configuration error for a named field.
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Build a timeout error for the named operation.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Connection,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Device { .. } => ErrorKind::Device,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Config { .. } => ErrorKind::Config,
            Self::Busy => ErrorKind::Busy,
            Self::Aborted => ErrorKind::Aborted,
            Self::StepFailed { kind, .. } => *kind,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the operator has to check the physical state of the microscope
    /// before retrying.
    pub fn requires_operator_check(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection | ErrorKind::Device | ErrorKind::Timeout
        )
    }
}

impl From<figment::Error> for OilerError {
    fn from(err: figment::Error) -> Self {
        let field = if err.path.is_empty() {
            "<document>".to_string()
        } else {
            err.path.join(".")
        };
        OilerError::Config {
            field,
            reason: err.kind.to_string(),
        }
    }
}
