// src/error.rs

//! Crate-wide error type
//!
//! One enum covers the state store, the task engine and the assertion
//! subsystem. HTTP handlers translate these into response envelopes; they
//! never bubble past the gateway.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the daemon's subsystems
#[derive(Debug, Error)]
pub enum Error {
    /// Typed read of an absent state path
    #[error("no state entry for {0:?}")]
    NoState(String),

    /// A state entry exists but does not decode into the requested type
    #[error("cannot decode state entry {path:?}: {reason}")]
    DecodeError { path: String, reason: String },

    /// Filesystem or socket failure
    #[error("{0}")]
    IoError(String),

    /// Invalid daemon configuration
    #[error("{0}")]
    ConfigError(String),

    /// A referenced object does not exist
    #[error("{0}")]
    NotFound(String),

    /// Attaching a task-set would create a dependency cycle
    #[error("dependency cycle involving task {0}")]
    TaskCycle(String),

    /// Conflicting request options (e.g. devmode together with jailmode)
    #[error("{0}")]
    Conflict(String),

    /// Assertion wire format could not be parsed
    #[error("cannot parse assertion: {0}")]
    AssertParse(String),

    /// Assertion signature did not verify
    #[error("signature verification failed: {0}")]
    AssertSignature(String),

    /// Assertion declares a type the registry does not know
    #[error("unknown assertion type {0:?}")]
    AssertUnknownType(String),

    /// An assertion with the same primary key and a newer revision exists
    #[error("revision {new} is older than current revision {current}")]
    AssertRevision { new: i64, current: i64 },

    /// Cross-assertion consistency check failed
    #[error("{0}")]
    AssertConsistency(String),

    /// No assertion matches the given type and headers
    #[error("assertion not found")]
    AssertNotFound,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::IoError(err.to_string())
    }
}
