//! The `error` module defines the error types used within `popchat`.
//!
//! Store errors distinguish the expected retry case (`DuplicateSubmission`)
//! from genuine persistence trouble (`StoreUnavailable`), since the relay
//! treats the two very differently: the first is acknowledged, the second is not.

use sled::transaction::TransactionError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A message with this client token is already in the log.
    #[error("duplicate submission for client token {0:?}")]
    DuplicateSubmission(String),

    /// Any persistence failure other than a token conflict.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::DuplicateSubmission(_))
    }
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::StoreUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::StoreUnavailable(format!("serialization: {e}"))
    }
}

impl From<TransactionError<StoreError>> for StoreError {
    fn from(e: TransactionError<StoreError>) -> Self {
        match e {
            TransactionError::Abort(inner) => inner,
            TransactionError::Storage(storage) => storage.into(),
        }
    }
}

/// Errors raised by the WebSocket server and the relay client.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("websocket error: {0}")]
    Handshake(#[from] tungstenite::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    Closed,
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Protocol(e.to_string())
    }
}

impl From<url::ParseError> for TransportError {
    fn from(e: url::ParseError) -> Self {
        TransportError::Protocol(format!("invalid url: {e}"))
    }
}
