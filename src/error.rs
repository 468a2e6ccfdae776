//! Custom error types for tlmserver.
//!
//! Errors that reach a caller of the public API (server construction and
//! start, subscription management, channel accessors) are expressed as
//! [`ServerError`]. Failures inside the receive loop never surface here; they
//! are handled and logged where they happen.

use crate::codec::CodecError;
use crate::server::ServerState;
use crate::topic::RoutingKey;
use std::io;
use thiserror::Error;

/// Main error type for tlmserver operations.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration-related errors (parsing, validation, missing files)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network I/O errors (bind failures, socket errors)
    #[error("Network error on '{endpoint}': {source}")]
    Network {
        /// Address of the socket that failed
        endpoint: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Topic string does not follow `APP_NAME/Application/MSG_NAME`
    #[error("Invalid topic '{0}': expected APP_NAME/Application/MSG_NAME")]
    InvalidTopic(String),

    /// Topic is well formed but has no routing key in the topic mapping
    #[error("Unknown topic '{0}'")]
    UnknownTopic(String),

    /// No channel is registered for the routing key
    #[error("No telemetry channel for routing key {0}")]
    UnknownRoutingKey(RoutingKey),

    /// Detach of a subscriber that is not attached to the channel
    #[error("Subscriber is not attached to channel {0}")]
    SubscriberNotAttached(RoutingKey),

    /// Channel accessor called before the first update
    #[error("No telemetry received yet for {app_name}/{msg_name} ({key})")]
    NoData {
        /// Owning application of the channel
        app_name: String,
        /// Message name of the channel
        msg_name: String,
        /// Routing key of the channel
        key: RoutingKey,
    },

    /// Lifecycle operation requested in the wrong state
    #[error("Invalid server state: expected {expected:?}, found {actual:?}")]
    InvalidState {
        /// State the operation requires
        expected: ServerState,
        /// State the server is in
        actual: ServerState,
    },

    /// Decode errors raised outside the receive loop (e.g. by tooling)
    #[error("Decode error: {0}")]
    Codec(#[from] CodecError),

    /// Other unexpected errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Type alias for Results that use ServerError
pub type Result<T> = std::result::Result<T, ServerError>;

impl ServerError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new network error
    pub fn network(endpoint: impl Into<String>, source: io::Error) -> Self {
        Self::Network {
            endpoint: endpoint.into(),
            source,
        }
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Convert from anyhow::Error (config loading uses anyhow)
impl From<anyhow::Error> for ServerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Config(format!("{:#}", err))
    }
}
