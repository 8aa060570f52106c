//! Control-channel message definitions.
//!
//! Control messages travel as JSON text frames next to the raw terminal bytes
//! carried in binary frames. The set of message kinds is open: a client may
//! send a `type` this server does not know, and that message is reported as
//! [`ControlMessage::Unknown`] rather than as an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Maximum accepted length of a client-supplied session id.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Inbound control message (client to server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Change the terminal window size.
    ///
    /// Dimensions are carried as decoded from the wire. Range checking is the
    /// session's job, so a zero or oversized value still decodes here.
    Resize {
        /// Requested number of rows.
        rows: u64,
        /// Requested number of columns.
        cols: u64,
    },
    /// A well-formed message of a kind this server does not handle.
    Unknown(String),
}

impl ControlMessage {
    /// Wire tag of the resize message.
    pub const RESIZE: &'static str = "resize";

    /// Decodes a control message from the body of a text frame.
    ///
    /// Unknown fields are ignored. A missing or non-string `type` and a
    /// resize without numeric `rows`/`cols` are errors.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MissingField {
                kind: "control".to_string(),
                field: "type",
            })?;

        match kind {
            Self::RESIZE => Ok(ControlMessage::Resize {
                rows: read_dimension(&value, kind, "rows")?,
                cols: read_dimension(&value, kind, "cols")?,
            }),
            other => Ok(ControlMessage::Unknown(other.to_string())),
        }
    }

    /// Encodes the message as the JSON body of a text frame.
    ///
    /// Used by clients; the server only decodes control messages.
    pub fn encode(&self) -> Result<String> {
        let value = match self {
            ControlMessage::Resize { rows, cols } => serde_json::json!({
                "type": Self::RESIZE,
                "rows": rows,
                "cols": cols,
            }),
            ControlMessage::Unknown(kind) => serde_json::json!({ "type": kind }),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

fn read_dimension(value: &Value, kind: &str, field: &'static str) -> Result<u64> {
    let raw = value.get(field).ok_or_else(|| ProtocolError::MissingField {
        kind: kind.to_string(),
        field,
    })?;
    // Whole floats such as `24.0` are accepted; fractions are not.
    let integral_float = || {
        raw.as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= u64::MAX as f64)
            .map(|f| f as u64)
    };
    raw.as_u64().or_else(integral_float).ok_or_else(|| {
        ProtocolError::Deserialization(format!(
            "`{field}` must be a non-negative whole number, got {raw}"
        ))
    })
}

/// Outbound handshake message (server to client), sent as a text frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// The session this connection is bound to: `{"session": "<id>"}`.
    #[serde(rename = "session")]
    Session(String),
    /// Session setup failed: `{"error": "<message>"}`. The server closes the
    /// connection right after sending it.
    #[serde(rename = "error")]
    Error(String),
}

impl ServerMessage {
    /// Encodes the message as JSON.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a server message from a text frame body.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Checks that a client-supplied session id is usable.
///
/// Ids are 1 to [`MAX_SESSION_ID_LEN`] characters of ASCII letters, digits,
/// `-`, `_` or `.`, which keeps them safe to echo into URLs and logs.
pub fn validate_session_id(id: &str) -> Result<()> {
    let reject = |reason| {
        Err(ProtocolError::InvalidSessionId {
            id: id.to_string(),
            reason,
        })
    };

    if id.is_empty() {
        return reject("must not be empty");
    }
    if id.len() > MAX_SESSION_ID_LEN {
        return reject("longer than 128 characters");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return reject("contains a disallowed character");
    }
    Ok(())
}
