//! # NetControl Terminal Protocol
//!
//! Wire definitions for the browser terminal connection of NetControl.
//!
//! ## Overview
//!
//! A terminal connection is a message-framed duplex transport (a WebSocket in
//! production) multiplexing two channels:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │ text frames    JSON control   {"type":"resize",...}    │  client → server
//! │                JSON replies   {"session":..}/{"error"} │  server → client
//! ├────────────────────────────────────────────────────────┤
//! │ binary frames  raw pty bytes, uninterpreted            │  both directions
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ControlMessage, Frame, Inbound};
//!
//! let frame = Frame::Text(r#"{"type":"resize","rows":40,"cols":120}"#.to_string());
//! match Inbound::classify(frame) {
//!     Inbound::Control(ControlMessage::Resize { rows, cols }) => {
//!         assert_eq!((rows, cols), (40, 120));
//!     }
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```
//!
//! ## Modules
//!
//! - [`framing`]: transport-neutral frames and inbound classification
//! - [`messages`]: control and handshake messages, session-id rules
//! - [`error`]: error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{Frame, Inbound};
pub use messages::{validate_session_id, ControlMessage, ServerMessage, MAX_SESSION_ID_LEN};
