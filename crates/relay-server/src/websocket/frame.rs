//! Inbound client frames.
//!
//! Clients may send JSON objects tagged by `type`. Only `subscribe` and
//! `unsubscribe` are recognised, and the relay merely logs them; anything
//! else that is valid JSON is kept as [`ClientFrame::Unrecognized`].

use serde::Deserialize;
use serde_json::Value;

use crate::errors::FrameError;

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Command {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
}

/// A decoded client frame.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientFrame {
    /// `{"type":"subscribe","channel":...}`
    Subscribe {
        /// Requested channel.
        channel: String,
    },
    /// `{"type":"unsubscribe","channel":...}`
    Unsubscribe {
        /// Channel to leave.
        channel: String,
    },
    /// Any other well-formed JSON value.
    Unrecognized(Value),
}

impl ClientFrame {
    /// Decode a text frame.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        Ok(match Command::deserialize(&value) {
            Ok(Command::Subscribe { channel }) => Self::Subscribe { channel },
            Ok(Command::Unsubscribe { channel }) => Self::Unsubscribe { channel },
            Err(_) => Self::Unrecognized(value),
        })
    }

    /// Decode a binary frame holding UTF-8 JSON.
    pub fn from_binary(bytes: &[u8]) -> Result<Self, FrameError> {
        let text = std::str::from_utf8(bytes).map_err(|_| FrameError::NotUtf8)?;
        Self::parse(text)
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Unrecognized(_) => "unrecognized",
        }
    }
}
