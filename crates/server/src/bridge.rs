//! Duplex bridge between one client connection and one session.
//!
//! The bridge is transport-neutral: it speaks [`Frame`]s over any
//! `Sink`/`Stream` pair. The WebSocket handler adapts axum's socket into
//! that shape; tests drive it over in-memory channels.
//!
//! Lifecycle of a connection:
//! 1. Handshake: resolve the session id, create or attach, claim the
//!    session's output and announce `{"session": id}`.
//! 2. Pump: one task forwards pty output as binary frames while the
//!    calling task routes client frames into the session.
//! 3. Teardown: whichever side ends first stops the other; the session is
//!    then closed or detached per [`DisconnectPolicy`].

use std::fmt::Display;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use protocol::{validate_session_id, ControlMessage, Frame, Inbound, ServerMessage};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::session::{Session, SessionError, SessionTable, TermSize};

/// Errors that end a bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The client transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The session could not be created, attached or driven.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The client asked for a malformed session id.
    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),
}

/// What happens to a session when its client goes away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectPolicy {
    /// Destroy the session.
    #[default]
    Close,
    /// Keep the session running so a later connection can attach by id.
    Detach,
}

/// Parameters of a connection, taken from the upgrade request.
#[derive(Debug, Clone, Default)]
pub struct AttachRequest {
    /// Session to attach to. A fresh id is generated when None.
    pub session_id: Option<String>,
    /// Size for a newly created session.
    pub size: TermSize,
}

/// Bridges client connections into sessions of one table.
#[derive(Debug, Clone)]
pub struct Bridge {
    table: Arc<SessionTable>,
    policy: DisconnectPolicy,
}

impl Bridge {
    /// Creates a bridge over `table`.
    pub fn new(table: Arc<SessionTable>, policy: DisconnectPolicy) -> Self {
        Self { table, policy }
    }

    /// Returns the table sessions are created in.
    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// Runs one connection to completion.
    ///
    /// Handshake failures are reported to the client as an error frame
    /// followed by a close frame, and returned. A client that simply goes
    /// away ends the bridge with `Ok(())`.
    pub async fn run<Tx, Rx, E>(
        &self,
        mut tx: Tx,
        mut rx: Rx,
        request: AttachRequest,
    ) -> Result<(), BridgeError>
    where
        Tx: Sink<Frame> + Unpin + Send + 'static,
        Tx::Error: Display + Send,
        Rx: Stream<Item = Result<Frame, E>> + Unpin + Send,
        E: Display,
    {
        let session = match self.handshake(&request) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "Rejected terminal connection");
                reject(&mut tx, &e).await;
                return Err(e);
            }
        };
        let session_id = session.id().clone();

        let announce = match Frame::server(&ServerMessage::Session(session_id.clone())) {
            Ok(frame) => frame,
            Err(e) => {
                self.teardown(&session).await;
                return Err(e.into());
            }
        };
        if let Err(e) = tx.send(announce).await {
            self.teardown(&session).await;
            return Err(BridgeError::Transport(e.to_string()));
        }

        tracing::info!(session_id = %session_id, "Client attached");

        let stop = CancellationToken::new();
        let pump = tokio::spawn(pump_output(Arc::clone(&session), tx, stop.clone()));

        let result = route_input(&session, &mut rx, &stop).await;

        // The pump has to be gone before the claim is released.
        stop.cancel();
        pump.abort();
        let _ = pump.await;
        self.teardown(&session).await;

        tracing::info!(
            session_id = %session_id,
            policy = ?self.policy,
            "Client detached"
        );
        result
    }

    fn handshake(&self, request: &AttachRequest) -> Result<Arc<Session>, BridgeError> {
        let id = match request.session_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => {
                validate_session_id(id)?;
                id.to_string()
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        let session = self.table.create_or_attach(&id, request.size)?;
        if !session.try_claim() {
            return Err(SessionError::AlreadyAttached(id).into());
        }
        Ok(session)
    }

    async fn teardown(&self, session: &Arc<Session>) {
        match self.policy {
            DisconnectPolicy::Close => self.table.release(session).await,
            DisconnectPolicy::Detach => session.release_claim(),
        }
    }
}

/// Sends an error frame and closes the connection.
async fn reject<Tx>(tx: &mut Tx, error: &BridgeError)
where
    Tx: Sink<Frame> + Unpin,
    Tx::Error: Display,
{
    match Frame::server(&ServerMessage::Error(error.to_string())) {
        Ok(frame) => {
            if let Err(e) = tx.send(frame).await {
                tracing::debug!(error = %e, "Failed to send error frame");
                return;
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to encode error frame"),
    }
    let _ = tx.send(Frame::Close).await;
    let _ = tx.close().await;
}

/// Forwards session output to the client until the output stream ends, a
/// send failure or `stop`.
///
/// The stream ends once the session is done, even if a leftover process
/// still holds the pty, so the client always sees a close frame when the
/// shell goes away.
async fn pump_output<Tx>(session: Arc<Session>, mut tx: Tx, stop: CancellationToken)
where
    Tx: Sink<Frame> + Unpin + Send,
    Tx::Error: Display + Send,
{
    loop {
        let chunk = tokio::select! {
            _ = stop.cancelled() => return,
            chunk = session.read() => chunk,
        };

        match chunk {
            Some(data) => {
                if let Err(e) = tx.send(Frame::Binary(data)).await {
                    tracing::debug!(session_id = %session.id(), error = %e, "Output send failed");
                    break;
                }
            }
            None => {
                tracing::debug!(session_id = %session.id(), "Session output ended");
                let _ = tx.send(Frame::Close).await;
                let _ = tx.close().await;
                break;
            }
        }
    }
    stop.cancel();
}

/// Routes client frames into the session until the client goes away or the
/// output pump stops.
async fn route_input<Rx, E>(
    session: &Session,
    rx: &mut Rx,
    stop: &CancellationToken,
) -> Result<(), BridgeError>
where
    Rx: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
{
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            next = rx.next() => next,
        };

        let frame = match next {
            None => return Ok(()),
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::debug!(session_id = %session.id(), error = %e, "Transport error");
                return Err(BridgeError::Transport(e.to_string()));
            }
        };

        match Inbound::classify(frame) {
            Inbound::Data(data) => {
                if let Err(e) = session.write(&data).await {
                    tracing::debug!(session_id = %session.id(), error = %e, "Input write failed");
                    return Ok(());
                }
            }
            Inbound::Control(ControlMessage::Resize { rows, cols }) => {
                let resized = match TermSize::from_wire(rows, cols) {
                    Ok(size) => session.resize(size.rows, size.cols).await,
                    Err(e) => Err(e),
                };
                match resized {
                    Ok(()) => {}
                    Err(SessionError::Closed(_)) => return Ok(()),
                    Err(e) => {
                        tracing::debug!(session_id = %session.id(), error = %e, "Resize rejected");
                    }
                }
            }
            Inbound::Control(ControlMessage::Unknown(kind)) => {
                tracing::trace!(session_id = %session.id(), kind = %kind, "Ignoring control message");
            }
            Inbound::Ignored(reason) => {
                tracing::debug!(session_id = %session.id(), reason = %reason, "Ignoring frame");
            }
            Inbound::Close => return Ok(()),
        }
    }
}
