//! # NetControl Terminal Server
//!
//! Browser-based shell access for the NetControl dashboard: each WebSocket
//! connection is bridged to a shell running on a pseudo-terminal of the
//! host.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  axum router (http)                                          │
//! │   /ws/terminal ──► Bridge ──► SessionTable ──► Session (pty) │
//! │   /api/terminal/* ─────────►  SessionTable                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! - [`session`]: pty-backed shells and the table that owns them
//! - [`bridge`]: pumps one connection's frames into one session
//! - [`http`]: WebSocket upgrade and REST routes
//! - [`server`]: listener lifecycle and graceful shutdown
//! - [`config`]: TOML configuration with environment overrides
//! - [`client`]: REST client used by the CLI
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use server::{Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!     config.validate()?;
//!
//!     Server::new(config).run().await
//! }
//! ```

pub mod bridge;
pub mod client;
pub mod config;
pub mod http;
pub mod logging;
pub mod server;
pub mod session;

pub use bridge::{AttachRequest, Bridge, BridgeError, DisconnectPolicy};
pub use config::{Config, ConfigError};
pub use server::Server;
pub use session::{Session, SessionError, SessionId, SessionInfo, SessionTable, TermSize};
