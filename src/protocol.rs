//! Wire protocol for the terminal bridge.
//!
//! Messages are JSON text frames tagged by a `type` field, camelCase field
//! names on the wire. Parsing is lenient about unrecognized message types
//! (they are dropped by the caller, not reported) but strict about field
//! shapes on the types it does know.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Start a new session, replacing any session already bound to the
    /// connection.
    Start {
        command: Option<String>,
        args: Option<Vec<String>>,
    },

    /// Raw keystrokes forwarded verbatim to the process.
    Input { data: String },

    /// Resize the terminal window. Missing dimensions fall back to the
    /// spawn defaults.
    Resize { cols: Option<u16>, rows: Option<u16> },

    /// Terminate the bound session.
    Kill,
}

/// Messages sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Acknowledges a successful `start`; the process is running.
    Started {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    /// One chunk of terminal output, in production order.
    Output { data: String },

    /// The process exited on its own.
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
        signal: Option<i32>,
    },

    /// Acknowledges an explicit `kill`.
    Killed,

    /// A recoverable per-connection failure; the connection stays open.
    Error { message: String },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message: {0}")]
    Invalid(String),
}

/// Parses one inbound text frame.
///
/// Returns `Ok(None)` for a structurally valid message whose `type` is not
/// recognized: those are logged and dropped rather than reported back, which
/// mirrors how the bridge has always behaved. Everything else that fails to
/// parse is a [`ProtocolError`] the caller reports to the client.
pub fn parse_client_message(text: &str) -> Result<Option<ClientMessage>, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ProtocolError::Invalid(format!("malformed JSON: {e}")))?;

    let known = matches!(
        value.get("type").and_then(|t| t.as_str()),
        Some("start" | "input" | "resize" | "kill")
    );
    if value.get("type").and_then(|t| t.as_str()).is_none() {
        return Err(ProtocolError::Invalid("missing message type".to_string()));
    }
    if !known {
        return Ok(None);
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| ProtocolError::Invalid(e.to_string()))
}
