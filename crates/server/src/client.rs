//! REST client for a running terminal server.
//!
//! Backs the `sessions` CLI subcommands.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Errors from talking to the server.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request could not be sent or the response not read.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with an error status.
    #[error("server returned {status}: {message}")]
    Api { status: u16, message: String },
}

/// Session details as reported by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSession {
    pub id: String,
    pub pid: Option<u32>,
    pub rows: u16,
    pub cols: u16,
    pub state: String,
    pub attached: bool,
}

#[derive(Deserialize)]
struct SessionList {
    sessions: Vec<String>,
}

/// A client for the terminal server's REST API.
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    /// Creates a client for the server at `base_url` (e.g. `http://127.0.0.1:7002`).
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Lists the ids of all sessions.
    pub async fn list(&self) -> Result<Vec<String>, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/terminal/sessions", self.base_url))
            .send()
            .await?;
        let list: SessionList = decode(response).await?;
        Ok(list.sessions)
    }

    /// Fetches one session's details.
    pub async fn info(&self, session_id: &str) -> Result<RemoteSession, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/terminal/{}", self.base_url, session_id))
            .send()
            .await?;
        decode(response).await
    }

    /// Resizes a session's terminal.
    pub async fn resize(&self, session_id: &str, rows: u16, cols: u16) -> Result<(), ClientError> {
        let response = self
            .http
            .post(format!("{}/api/terminal/{}/resize", self.base_url, session_id))
            .json(&json!({ "rows": rows, "cols": cols }))
            .send()
            .await?;
        decode::<Value>(response).await.map(|_| ())
    }

    /// Closes a session.
    pub async fn close(&self, session_id: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(format!("{}/api/terminal/{}", self.base_url, session_id))
            .send()
            .await?;
        decode::<Value>(response).await.map(|_| ())
    }
}

/// Turns a response into `T`, or into [`ClientError::Api`] carrying the
/// server's `{"error": ...}` message.
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(body);

    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}
