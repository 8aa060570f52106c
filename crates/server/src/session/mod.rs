//! Shell sessions and the table that tracks them.

mod manager;
mod pty;

pub use manager::{SessionInfo, SessionTable};
pub use pty::{
    detect_shell, ExitWatch, Session, SessionError, SessionId, SessionState, SessionStatus,
    SpawnOptions, TermSize,
};
