//! End-to-end integration tests for the terminal server.
//!
//! These tests run a real server on an ephemeral port and verify:
//! - The WebSocket handshake and terminal I/O
//! - Session lifecycle (close on disconnect, cleanup on shell exit)
//! - The REST session API
//! - Concurrent writes and resizes against one session

#![cfg(unix)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use server::config::Config;
use server::{DisconnectPolicy, Server, SessionError, SessionTable, TermSize};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(10);

struct TestServer {
    addr: SocketAddr,
    table: Arc<SessionTable>,
    stop: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn connect(&self, query: &str) -> Ws {
        let (ws, _) = connect_async(format!("ws://{}/ws/terminal{}", self.addr, query))
            .await
            .unwrap();
        ws
    }

    async fn shutdown(self) {
        self.stop.cancel();
        let _ = timeout(WAIT, self.handle).await;
    }
}

/// Starts a server on 127.0.0.1 with an ephemeral port.
async fn start_server(configure: impl FnOnce(&mut Config)) -> TestServer {
    let mut config = Config::default();
    config.server.bind = "127.0.0.1".to_string();
    config.server.shutdown_timeout_secs = 2;
    config.session.default_shell = "/bin/sh".to_string();
    config.session.kill_grace_ms = 500;
    configure(&mut config);

    let server = Server::new(config);
    let table = Arc::clone(server.table());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let stop = CancellationToken::new();
    let trigger = stop.clone();
    let handle = tokio::spawn(server.serve(listener, async move { trigger.cancelled().await }));

    TestServer {
        addr,
        table,
        stop,
        handle,
    }
}

/// Polls `check` until it holds or the wait budget runs out.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .is_ok()
}

async fn next_message(ws: &mut Ws) -> Option<Message> {
    timeout(WAIT, ws.next())
        .await
        .expect("timed out waiting for message")
        .and_then(Result::ok)
}

async fn expect_json(ws: &mut Ws) -> Value {
    match next_message(ws).await {
        Some(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text frame, got {:?}", other),
    }
}

async fn expect_session(ws: &mut Ws) -> String {
    let value = expect_json(ws).await;
    value["session"]
        .as_str()
        .unwrap_or_else(|| panic!("expected session frame, got {}", value))
        .to_string()
}

/// Reads binary output until it contains `needle`.
async fn read_until(ws: &mut Ws, needle: &str) -> bool {
    let mut seen = String::new();
    timeout(WAIT, async {
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Binary(data) = message {
                seen.push_str(&String::from_utf8_lossy(&data));
                if seen.contains(needle) {
                    return true;
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false)
}

async fn send_resize(ws: &mut Ws, rows: u64, cols: u64) {
    let message = json!({ "type": "resize", "rows": rows, "cols": cols }).to_string();
    ws.send(Message::Text(message)).await.unwrap();
}

// =============================================================================
// WebSocket Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminal_scenario() {
    let server = start_server(|_| {}).await;
    let mut ws = server.connect("?session=abc&rows=24&cols=80").await;

    assert_eq!(expect_session(&mut ws).await, "abc");
    let session = server.table.lookup("abc").unwrap();
    assert_eq!(session.size(), TermSize::new(24, 80).unwrap());

    ws.send(Message::Binary(b"echo hi\n".to_vec())).await.unwrap();
    assert!(read_until(&mut ws, "hi").await);

    send_resize(&mut ws, 30, 100).await;
    assert!(eventually(|| session.size() == TermSize::new(30, 100).unwrap()).await);

    ws.close(None).await.unwrap();
    assert!(eventually(|| server.table.lookup("abc").is_none()).await);
    assert!(eventually(|| !session.is_running()).await);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_generated_session_id() {
    let server = start_server(|_| {}).await;
    let mut ws = server.connect("").await;

    let id = expect_session(&mut ws).await;
    assert!(!id.is_empty());
    assert!(server.table.exists(&id));

    drop(ws);
    assert!(eventually(|| !server.table.exists(&id)).await);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_session_id_gets_error_frame() {
    let server = start_server(|_| {}).await;
    let mut ws = server.connect("?session=..%2Fetc%2Fpasswd").await;

    let value = expect_json(&mut ws).await;
    assert!(value["error"].is_string(), "unexpected frame: {}", value);
    assert!(matches!(
        next_message(&mut ws).await,
        None | Some(Message::Close(_))
    ));
    assert_eq!(server.table.count(), 0);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spawn_failure_gets_error_frame() {
    let server = start_server(|config| {
        config.session.default_shell = "/nonexistent/shell".to_string();
    })
    .await;
    let mut ws = server.connect("?session=broken").await;

    let value = expect_json(&mut ws).await;
    let message = value["error"].as_str().unwrap();
    assert!(message.contains("spawn"), "unexpected error: {}", message);
    assert!(!server.table.exists("broken"));

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_limit_gets_error_frame() {
    let server = start_server(|config| config.session.max_sessions = 1).await;

    let mut first = server.connect("?session=one").await;
    assert_eq!(expect_session(&mut first).await, "one");

    let mut second = server.connect("?session=two").await;
    let value = expect_json(&mut second).await;
    assert!(value["error"].as_str().unwrap().contains("limit"));

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_control_frames_are_ignored() {
    let server = start_server(|_| {}).await;
    let mut ws = server.connect("?session=noisy").await;
    expect_session(&mut ws).await;

    ws.send(Message::Text("{not json".to_string())).await.unwrap();
    ws.send(Message::Text(json!({ "type": "zoom", "level": 2 }).to_string()))
        .await
        .unwrap();
    ws.send(Message::Text(json!({ "type": "resize", "rows": 0, "cols": 40 }).to_string()))
        .await
        .unwrap();
    ws.send(Message::Text(json!({ "type": "resize", "rows": 70000, "cols": 40 }).to_string()))
        .await
        .unwrap();

    ws.send(Message::Binary(b"echo still_$((6 * 7))\n".to_vec()))
        .await
        .unwrap();
    assert!(read_until(&mut ws, "still_42").await);

    let session = server.table.lookup("noisy").unwrap();
    assert_eq!(session.size(), TermSize::default());

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shell_exit_closes_connection() {
    let server = start_server(|_| {}).await;
    let mut ws = server.connect("?session=leaving").await;
    expect_session(&mut ws).await;

    ws.send(Message::Binary(b"exit\n".to_vec())).await.unwrap();

    let ended = timeout(WAIT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(ended);
    assert!(eventually(|| !server.table.exists("leaving")).await);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shell_exit_with_background_job_closes_connection() {
    let server = start_server(|_| {}).await;
    let mut ws = server.connect("?session=jobs").await;
    expect_session(&mut ws).await;

    // The job inherits the pty and outlives the shell.
    ws.send(Message::Binary(b"sleep 30 &\n".to_vec()))
        .await
        .unwrap();
    ws.send(Message::Binary(b"exit\n".to_vec())).await.unwrap();

    let ended = timeout(WAIT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(ended, "connection stayed open after the shell exited");
    assert!(eventually(|| !server.table.exists("jobs")).await);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_detach_policy_allows_reattach() {
    let server = start_server(|config| {
        config.session.disconnect_policy = DisconnectPolicy::Detach;
    })
    .await;

    let mut ws = server.connect("?session=persist&rows=24&cols=80").await;
    expect_session(&mut ws).await;
    ws.send(Message::Binary(b"MARK=kept_value\n".to_vec()))
        .await
        .unwrap();
    ws.close(None).await.unwrap();

    let session = server.table.lookup("persist").unwrap();
    assert!(eventually(|| !session.is_attached()).await);
    assert!(session.is_running());

    // P3: the second request's size is ignored.
    let mut ws = server.connect("?session=persist&rows=40&cols=120").await;
    assert_eq!(expect_session(&mut ws).await, "persist");
    assert_eq!(session.size(), TermSize::new(24, 80).unwrap());

    ws.send(Message::Binary(b"echo ${MARK}_$((1 + 1))\n".to_vec()))
        .await
        .unwrap();
    assert!(read_until(&mut ws, "kept_value_2").await);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_client_is_rejected_while_attached() {
    let server = start_server(|_| {}).await;

    let mut first = server.connect("?session=busy").await;
    expect_session(&mut first).await;

    let mut second = server.connect("?session=busy").await;
    let value = expect_json(&mut second).await;
    assert!(value["error"].as_str().unwrap().contains("already attached"));

    first
        .send(Message::Binary(b"echo alive_$((2 + 3))\n".to_vec()))
        .await
        .unwrap();
    assert!(read_until(&mut first, "alive_5").await);

    server.shutdown().await;
}

// =============================================================================
// REST API Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rest_session_api() {
    let server = start_server(|_| {}).await;
    let http = reqwest::Client::new();

    server
        .table
        .create_or_attach("rest-b", TermSize::default())
        .unwrap();
    server
        .table
        .create_or_attach("rest-a", TermSize::default())
        .unwrap();

    let list: Value = http
        .get(server.url("/api/terminal/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list, json!({ "sessions": ["rest-a", "rest-b"] }));

    let info: Value = http
        .get(server.url("/api/terminal/rest-a"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["id"], "rest-a");
    assert_eq!(info["rows"], 24);
    assert_eq!(info["cols"], 80);
    assert_eq!(info["state"], "running");
    assert_eq!(info["attached"], false);

    let response = http
        .post(server.url("/api/terminal/rest-a/resize"))
        .json(&json!({ "rows": 40, "cols": 132 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "message": "Terminal resized" }));
    assert_eq!(
        server.table.lookup("rest-a").unwrap().size(),
        TermSize::new(40, 132).unwrap()
    );

    let response = http
        .post(server.url("/api/terminal/rest-a/resize"))
        .json(&json!({ "rows": 0, "cols": 132 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(
        server.table.lookup("rest-a").unwrap().size(),
        TermSize::new(40, 132).unwrap()
    );

    let response = http
        .delete(server.url("/api/terminal/rest-a"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "message": "Session closed" }));
    assert!(server.table.lookup("rest-a").is_none());

    // Closing again is not an error.
    let response = http
        .delete(server.url("/api/terminal/rest-a"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rest_unknown_session() {
    let server = start_server(|_| {}).await;
    let http = reqwest::Client::new();

    let response = http
        .get(server.url("/api/terminal/ghost"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "error": "Session not found" }));

    let response = http
        .post(server.url("/api/terminal/ghost/resize"))
        .json(&json!({ "rows": 40, "cols": 120 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_healthz() {
    let server = start_server(|_| {}).await;

    let body = reqwest::get(server.url("/healthz"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_api_client_against_server() {
    use server::client::{ApiClient, ClientError};

    let server = start_server(|_| {}).await;
    server
        .table
        .create_or_attach("cli", TermSize::default())
        .unwrap();

    let client = ApiClient::new(&server.url("")).unwrap();
    assert_eq!(client.list().await.unwrap(), vec!["cli".to_string()]);

    client.resize("cli", 33, 99).await.unwrap();
    let info = client.info("cli").await.unwrap();
    assert_eq!((info.rows, info.cols), (33, 99));
    assert_eq!(info.state, "running");

    client.close("cli").await.unwrap();
    assert!(client.list().await.unwrap().is_empty());

    match client.info("cli").await {
        Err(ClientError::Api { status, message }) => {
            assert_eq!(status, 404);
            assert_eq!(message, "Session not found");
        }
        other => panic!("expected 404, got {:?}", other.map(|s| s.id)),
    }

    server.shutdown().await;
}

// =============================================================================
// Session Lifecycle Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_killed_shell_is_removed() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let server = start_server(|_| {}).await;
    let session = server
        .table
        .create_or_attach("victim", TermSize::default())
        .unwrap();
    let pid = session.pid().unwrap() as i32;

    kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap();

    let http = reqwest::Client::new();
    let mut gone = false;
    for _ in 0..200 {
        let list: Value = http
            .get(server.url("/api/terminal/sessions"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if list["sessions"].as_array().unwrap().is_empty() {
            gone = true;
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(gone, "killed session still listed");
    assert!(session.exit_status().is_some());

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_and_destroy_are_idempotent() {
    let server = start_server(|_| {}).await;
    let session = server
        .table
        .create_or_attach("twice", TermSize::default())
        .unwrap();

    session.close().await.unwrap();
    session.close().await.unwrap();
    server.table.destroy("twice").await.unwrap();
    server.table.destroy("twice").await.unwrap();
    server.table.destroy("never-existed").await.unwrap();

    assert!(matches!(
        session.write(b"late\n").await,
        Err(SessionError::Closed(_))
    ));
    assert!(!server.table.exists("twice"));

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_and_resizes_keep_order() {
    const WRITES_PER_CALLER: usize = 40;
    const RESIZES: u16 = 25;

    let server = start_server(|_| {}).await;
    let dir = TempDir::new().unwrap();
    let capture = dir.path().join("capture.txt");

    let session = server
        .table
        .create_or_attach("ordered", TermSize::default())
        .unwrap();

    // Claim the output the way a bridge would, and drain it in the background.
    assert!(session.try_claim());
    let drain = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { while session.read().await.is_some() {} })
    };

    let command = format!("stty -echo; cat > {}\n", capture.display());
    session.write(command.as_bytes()).await.unwrap();
    sleep(Duration::from_millis(300)).await;

    let writer = |tag: &'static str| {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            for i in 0..WRITES_PER_CALLER {
                session
                    .write(format!("{tag}-{i:03}\n").as_bytes())
                    .await
                    .unwrap();
            }
        })
    };
    let resizer = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            for i in 0..RESIZES {
                session.resize(20 + i, 60 + i).await.unwrap();
            }
        })
    };

    let a = writer("A");
    let b = writer("B");
    a.await.unwrap();
    b.await.unwrap();
    resizer.await.unwrap();

    // End of input for cat.
    session.write(b"\x04").await.unwrap();

    let expected_lines = 2 * WRITES_PER_CALLER;
    let complete = eventually(|| {
        std::fs::read_to_string(&capture)
            .map(|text| text.lines().count() == expected_lines)
            .unwrap_or(false)
    })
    .await;
    assert!(complete, "capture file incomplete");

    let text = std::fs::read_to_string(&capture).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    for tag in ["A", "B"] {
        let seen: Vec<&str> = lines
            .iter()
            .copied()
            .filter(|line| line.starts_with(tag))
            .collect();
        let expected: Vec<String> = (0..WRITES_PER_CALLER)
            .map(|i| format!("{tag}-{i:03}"))
            .collect();
        assert_eq!(seen, expected, "writes of caller {tag} out of order or torn");
    }
    assert_eq!(
        session.size(),
        TermSize::new(20 + RESIZES - 1, 60 + RESIZES - 1).unwrap()
    );

    server.table.destroy("ordered").await.unwrap();
    let _ = timeout(WAIT, drain).await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_sessions_and_connections() {
    let server = start_server(|_| {}).await;
    let mut ws = server.connect("?session=draining").await;
    expect_session(&mut ws).await;
    let session = server.table.lookup("draining").unwrap();
    let table = Arc::clone(&server.table);

    server.shutdown().await;

    assert_eq!(table.count(), 0);
    assert!(!session.is_running());
    let ended = timeout(WAIT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok());
}
