//! Error types for the relay core.
//!
//! None of these terminate the process: each is logged and absorbed at the
//! boundary where it occurs (bus callback, connection task, sweep).

use thiserror::Error;

use crate::websocket::connection::ConnectionId;

/// Upstream bus failures.
#[derive(Debug, Error)]
pub enum BusError {
    /// The transport could not be reached or dropped mid-call.
    #[error("bus transport unavailable: {0}")]
    TransportUnavailable(String),
    /// The adapter was already shut down.
    #[error("bus adapter disconnected")]
    Disconnected,
}

impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        Self::TransportUnavailable(err.to_string())
    }
}

/// Connection registry failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A connection with this id is already registered.
    #[error("connection id already registered: {0}")]
    DuplicateKey(ConnectionId),
    /// The registry already holds its maximum number of connections.
    #[error("registry full ({0} connections)")]
    Full(usize),
}

/// Event routing failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    /// A targeted channel did not match `<namespace>:<identity>`.
    #[error("malformed targeted channel {channel:?}: {reason}")]
    MalformedChannel {
        /// The offending channel name.
        channel: String,
        /// What was wrong with it.
        reason: &'static str,
    },
}

/// Inbound client frame failures.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The frame is not valid JSON.
    #[error("malformed client frame: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A binary frame did not contain UTF-8 text.
    #[error("binary client frame is not valid UTF-8")]
    NotUtf8,
}

/// Per-connection delivery failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The connection's writer has stopped or close was requested.
    #[error("connection closed")]
    Closed,
    /// The outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,
}

/// Server startup failures.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or serving the listener failed.
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The supplied configuration cannot be used.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The metrics recorder could not be installed.
    #[error("metrics recorder: {0}")]
    Metrics(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_key_display_names_the_id() {
        let err = RegistryError::DuplicateKey(ConnectionId::from("conn_1"));
        assert_eq!(err.to_string(), "connection id already registered: conn_1");
    }

    #[test]
    fn malformed_channel_display() {
        let err = RouteError::MalformedChannel {
            channel: "bad-format".into(),
            reason: "missing ':' separator",
        };
        let msg = err.to_string();
        assert!(msg.contains("\"bad-format\""));
        assert!(msg.contains("separator"));
    }

    #[test]
    fn frame_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let err: FrameError = json_err.into();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[test]
    fn redis_error_maps_to_unavailable() {
        let err: BusError =
            redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")).into();
        assert!(matches!(err, BusError::TransportUnavailable(_)));
        assert!(err.to_string().contains("connection refused"));
    }
}
