//! Crate-wide error type.
//!
//! Every fallible path in the server reports one of six kinds; HTTP and
//! ingest code dispatch on the kind, never on message text.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Bus transport failure (sidecar unreachable, timeout, bad frame).
    #[error("bus transport: {0}")]
    Transport(String),
    /// Filesystem read/write failure on persisted state.
    #[error("storage: {0}")]
    Storage(String),
    /// Rejected input: bad PIN, malformed body, out-of-range value.
    #[error("validation: {0}")]
    Validation(String),
    /// A bounded table refused a new insertion.
    #[error("capacity exhausted: {0}")]
    Capacity(String),
    /// Wall clock has never been reconciled from the bus.
    #[error("wall clock unavailable")]
    TimeUnavailable,
    /// The bus accepted the call but refused the payload.
    #[error("upstream rejected: {0}")]
    UpstreamRejected(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(e: serde_json::Error) -> Self {
        ServerError::Validation(e.to_string())
    }
}
