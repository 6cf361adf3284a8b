//! Error types for the connection core.

use std::time::Duration;

use crate::message::ParseError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rejected by `connect` before any dial attempt.
    #[error("network {network:?} has no servers configured")]
    EmptyServerPool { network: String },

    #[error("invalid identity: {0}")]
    InvalidIdentity(&'static str),

    #[error("connect to {server} failed: {source}")]
    Dial {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {server} timed out")]
    DialTimeout { server: String },

    #[error("malformed message: {0}")]
    Malformed(#[from] ParseError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no data received for {0:?}")]
    ReadTimeout(Duration),

    #[error("connection closed by peer")]
    Eof,

    #[error("connection task has stopped")]
    Closed,
}
