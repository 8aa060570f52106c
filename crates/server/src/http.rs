//! HTTP and WebSocket surface.
//!
//! Routes:
//! - `GET /ws/terminal?session=&rows=&cols=`: upgrade into a [`Bridge`]
//! - `GET /api/terminal/sessions`: ids of all sessions
//! - `GET /api/terminal/{session}`: one session's info
//! - `POST /api/terminal/{session}/resize`: resize a session
//! - `DELETE /api/terminal/{session}`: close a session
//! - `GET /healthz`: liveness probe

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{future, SinkExt, StreamExt};
use protocol::Frame;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::bridge::{AttachRequest, Bridge};
use crate::config::SessionConfig;
use crate::session::{SessionError, SessionInfo, SessionTable, TermSize};

/// Errors returned by the REST API as `{"error": message}`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No session under the requested id.
    #[error("Session not found")]
    NotFound,

    #[error(transparent)]
    Session(SessionError),
}

impl From<SessionError> for ApiError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::NotFound(_) => ApiError::NotFound,
            other => ApiError::Session(other),
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Session(e) => match e {
                SessionError::Validation(_) => StatusCode::BAD_REQUEST,
                SessionError::NotFound(_) | SessionError::Closed(_) => StatusCode::NOT_FOUND,
                SessionError::AlreadyAttached(_) => StatusCode::CONFLICT,
                SessionError::LimitReached(_) => StatusCode::SERVICE_UNAVAILABLE,
                SessionError::Spawn(_) | SessionError::Pty(_) | SessionError::Io(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    table: Arc<SessionTable>,
    bridge: Bridge,
    default_size: TermSize,
}

impl AppState {
    /// Creates handler state over `table`.
    pub fn new(table: Arc<SessionTable>, config: &SessionConfig) -> Self {
        Self {
            bridge: Bridge::new(Arc::clone(&table), config.disconnect_policy),
            table,
            default_size: config.default_size(),
        }
    }
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/terminal", get(terminal_ws))
        .route("/api/terminal/sessions", get(list_sessions))
        .route(
            "/api/terminal/{session}",
            get(session_info).delete(close_session),
        )
        .route("/api/terminal/{session}/resize", post(resize_session))
        .route("/healthz", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Query parameters of the terminal upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct TerminalQuery {
    /// Session to attach to; a new id is generated when absent or empty.
    pub session: Option<String>,
    /// Rows of a newly created session; `session.default_rows` when absent.
    pub rows: Option<u16>,
    /// Columns of a newly created session; `session.default_cols` when absent.
    pub cols: Option<u16>,
}

impl TerminalQuery {
    fn attach_request(self, default_size: TermSize) -> Result<AttachRequest, SessionError> {
        let size = TermSize::new(
            self.rows.unwrap_or(default_size.rows),
            self.cols.unwrap_or(default_size.cols),
        )?;
        Ok(AttachRequest {
            session_id: self.session.filter(|id| !id.is_empty()),
            size,
        })
    }
}

async fn terminal_ws(
    State(state): State<AppState>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let request = query.attach_request(state.default_size)?;
    let bridge = state.bridge.clone();

    Ok(ws.on_upgrade(move |socket| async move {
        serve_socket(bridge, socket, request).await;
    }))
}

/// Adapts a WebSocket into frames and runs the bridge over it.
async fn serve_socket(bridge: Bridge, socket: WebSocket, request: AttachRequest) {
    let (sink, stream) = socket.split();

    let sink =
        sink.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(frame_to_message(frame))));
    let stream = stream.filter_map(|message| {
        future::ready(match message {
            Ok(message) => message_to_frame(message).map(Ok),
            Err(e) => Some(Err(e)),
        })
    });

    if let Err(e) = bridge.run(sink, stream, request).await {
        tracing::debug!(error = %e, "Terminal connection ended with error");
    }
}

fn frame_to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Close => Message::Close(None),
    }
}

/// Ping and pong are answered by the WebSocket layer and never reach the
/// bridge.
fn message_to_frame(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        Message::Binary(data) => Some(Frame::Binary(data)),
        Message::Close(_) => Some(Frame::Close),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let mut sessions = state.table.enumerate();
    sessions.sort();
    Json(json!({ "sessions": sessions }))
}

async fn session_info(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    let session = state.table.get(&session_id)?;
    Ok(Json(SessionInfo::from(session.as_ref())))
}

/// Body of a resize request.
#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    /// New number of rows.
    pub rows: u64,
    /// New number of columns.
    pub cols: u64,
}

async fn resize_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<ResizeRequest>,
) -> Result<Json<Value>, ApiError> {
    let session = state.table.get(&session_id)?;
    let size = TermSize::from_wire(body.rows, body.cols)?;
    session.resize(size.rows, size.cols).await?;

    Ok(Json(json!({ "message": "Terminal resized" })))
}

async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.table.destroy(&session_id).await?;
    Ok(Json(json!({ "message": "Session closed" })))
}
