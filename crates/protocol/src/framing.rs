//! Transport frames and inbound demultiplexing.
//!
//! A terminal connection carries two logical channels over one message-framed
//! transport:
//!
//! - **data**: binary frames holding raw terminal bytes, never interpreted
//!   (not even newline translation; the pty owns line discipline).
//! - **control**: text frames holding a JSON [`ControlMessage`].
//!
//! [`Frame`] is transport-neutral so the same bridge logic can be driven by a
//! WebSocket or by in-memory channels.

use bytes::Bytes;

use crate::messages::{ControlMessage, ServerMessage};

/// One transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Structured control traffic.
    Text(String),
    /// Raw terminal bytes.
    Binary(Bytes),
    /// The peer is closing (or should close) the connection.
    Close,
}

impl Frame {
    /// Builds the text frame for a handshake reply.
    pub fn server(message: &ServerMessage) -> crate::Result<Self> {
        Ok(Frame::Text(message.encode()?))
    }

    /// Builds the text frame for a control message.
    pub fn control(message: &ControlMessage) -> crate::Result<Self> {
        Ok(Frame::Text(message.encode()?))
    }
}

/// What an inbound frame means to the session it arrived for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Bytes to append verbatim to pty input.
    Data(Bytes),
    /// A decoded control instruction.
    Control(ControlMessage),
    /// The client closed the connection.
    Close,
    /// A control frame that failed to decode. Dropped by the caller, carried
    /// here only so it can be logged.
    Ignored(String),
}

impl Inbound {
    /// Classifies an inbound frame. Never fails: malformed control traffic
    /// becomes [`Inbound::Ignored`].
    pub fn classify(frame: Frame) -> Self {
        match frame {
            Frame::Binary(data) => Inbound::Data(data),
            Frame::Text(text) => match ControlMessage::decode(&text) {
                Ok(message) => Inbound::Control(message),
                Err(e) => Inbound::Ignored(e.to_string()),
            },
            Frame::Close => Inbound::Close,
        }
    }
}
