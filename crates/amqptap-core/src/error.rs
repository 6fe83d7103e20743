//! Error types for broker access and tap workers.

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use thiserror::Error;

/// Errors reported by the broker seam.
///
/// Messages are kept as strings so errors can be cloned into control paths
/// and published to waiting `close` callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Dialing the broker failed.
    #[error("Dial failed: {0}")]
    Dial(String),

    /// The connection is gone.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The channel used for the operation is no longer usable.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// The object an operation refers to does not exist (404 NOT_FOUND).
    /// The broker closes the channel as well.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The broker refused an operation (declare, bind, delete, consume, ...).
    #[error("Operation failed: {0}")]
    Operation(String),
}

impl BrokerError {
    /// True if the error was caused by a dead channel, which can be
    /// recovered by opening a fresh one.
    pub fn is_stale_channel(&self) -> bool {
        matches!(self, BrokerError::ChannelClosed(_))
    }

    /// True if the broker reported the target object as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BrokerError::NotFound(_))
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(e: lapin::Error) -> Self {
        match &e {
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidChannel(_) => {
                BrokerError::ChannelClosed(e.to_string())
            }
            lapin::Error::InvalidConnectionState(_) | lapin::Error::IOError(_) => {
                BrokerError::ConnectionClosed(e.to_string())
            }
            lapin::Error::ProtocolError(amqp)
                if *amqp.kind() == AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) =>
            {
                BrokerError::NotFound(e.to_string())
            }
            _ => BrokerError::Operation(e.to_string()),
        }
    }
}

/// Errors crossing a component boundary.
#[derive(Debug, Error)]
pub enum TapError {
    /// `close` was called on a supervisor that never connected.
    #[error("Not connected")]
    NotConnected,

    /// Malformed exchange binding specification.
    #[error("Invalid exchange binding specification: {0}")]
    InvalidBinding(String),

    /// Tap topology could not be established.
    #[error("Tap setup failed for exchange '{exchange}': {source}")]
    Setup {
        exchange: String,
        #[source]
        source: BrokerError,
    },

    /// The broker refused to let us consume from a queue.
    #[error("Consuming queue '{queue}' failed: {source}")]
    Consume {
        queue: String,
        #[source]
        source: BrokerError,
    },

    /// Closing the connection on shutdown failed.
    #[error("Close failed: {0}")]
    Close(#[source] BrokerError),

    /// Management API request failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Management API returned an unexpected status.
    #[error("Management API returned {status} for {path}: {body}")]
    Api {
        status: u16,
        path: String,
        body: String,
    },

    /// Invalid URI.
    #[error("Invalid URI: {0}")]
    InvalidUri(String),
}

impl TapError {
    /// Transient errors are reported to the user but do not end a
    /// consumption loop, the owning worker recovers by reconnecting.
    pub fn is_transient(&self) -> bool {
        matches!(self, TapError::Setup { .. })
    }
}

impl From<reqwest::Error> for TapError {
    fn from(e: reqwest::Error) -> Self {
        TapError::Http(e.to_string())
    }
}

/// Result alias for tap operations.
pub type Result<T> = std::result::Result<T, TapError>;
