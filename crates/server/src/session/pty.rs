//! PTY-backed shell sessions.
//!
//! A [`Session`] owns one pseudo-terminal and the shell process attached to
//! it. The pty master, the child's killer and the input writer are only ever
//! released together, so a caller observes a session as either fully live or
//! fully closed.
//!
//! Output is pumped off the pty by a dedicated reader thread into a bounded
//! channel. [`Session::read`] drains that channel, which makes it cancel-safe
//! and gives the child natural backpressure when nobody is reading.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The OS could not allocate a pty or start the shell.
    #[error("failed to spawn PTY: {0}")]
    Spawn(String),

    /// The session has already been torn down.
    #[error("session closed: {0}")]
    Closed(SessionId),

    /// Rejected input, such as a zero terminal dimension.
    #[error("invalid request: {0}")]
    Validation(String),

    /// No session is registered under the id.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The table is at its configured capacity.
    #[error("session limit reached ({0} active)")]
    LimitReached(usize),

    /// Another connection is already bridged to the session.
    #[error("session already attached: {0}")]
    AlreadyAttached(SessionId),

    /// A pty control operation (resize) failed.
    #[error("PTY operation failed: {0}")]
    Pty(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exit status of a session's shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "code")]
pub enum SessionStatus {
    /// The shell exited with a code.
    Exited(u32),
    /// Waiting on the shell failed, so the outcome is unknown.
    Terminated,
}

/// Lifecycle state of a session.
///
/// `Running -> Closing -> Closed`; there is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Shell is live and the pty accepts I/O.
    Running,
    /// Teardown has started; I/O is refused.
    Closing,
    /// The pty and the process handle are both released.
    Closed,
}

const STATE_RUNNING: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            STATE_RUNNING => SessionState::Running,
            STATE_CLOSING => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TermSize {
    /// Number of rows.
    pub rows: u16,
    /// Number of columns.
    pub cols: u16,
}

impl TermSize {
    /// Validates a terminal size. Both dimensions must be non-zero.
    pub fn new(rows: u16, cols: u16) -> Result<Self, SessionError> {
        if rows == 0 || cols == 0 {
            return Err(SessionError::Validation(format!(
                "terminal size must be non-zero, got {rows}x{cols}"
            )));
        }
        Ok(Self { rows, cols })
    }

    /// Validates dimensions as decoded from the wire, which may exceed u16.
    pub fn from_wire(rows: u64, cols: u64) -> Result<Self, SessionError> {
        let narrow = |value: u64, name: &str| {
            u16::try_from(value).map_err(|_| {
                SessionError::Validation(format!("{name} {value} is out of range (max 65535)"))
            })
        };
        Self::new(narrow(rows, "rows")?, narrow(cols, "cols")?)
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// How to start the shell of a new session.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Shell command. If None, detected from the environment.
    pub shell: Option<String>,
    /// Additional environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory. If None, the user's home directory.
    pub cwd: Option<PathBuf>,
    /// How long a closed session's shell may ignore the hangup before it is
    /// killed outright.
    pub kill_grace: Duration,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            shell: None,
            env: Vec::new(),
            cwd: None,
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Chunks buffered between the reader thread and [`Session::read`].
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// How long output is still delivered once the session is done.
///
/// A process the shell left behind can keep the pty open indefinitely, so
/// end-of-stream cannot wait for the reader thread to hit EOF.
const OUTPUT_DRAIN_WINDOW: Duration = Duration::from_millis(500);

/// Handles that live and die together.
struct PtyHandles {
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

/// The process handle used to wait for the shell to exit.
///
/// Returned by [`Session::spawn`]; whoever holds it is the session's exit
/// watcher.
pub struct ExitWatch {
    child: Box<dyn Child + Send + Sync>,
}

impl ExitWatch {
    /// Waits, off the async runtime, for the shell to terminate.
    pub async fn wait(self) -> SessionStatus {
        let mut child = self.child;
        let result = tokio::task::spawn_blocking(move || child.wait()).await;
        match result {
            Ok(Ok(status)) => SessionStatus::Exited(status.exit_code()),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to wait for shell");
                SessionStatus::Terminated
            }
            Err(e) => {
                tracing::error!(error = %e, "Exit watcher task failed");
                SessionStatus::Terminated
            }
        }
    }
}

/// A PTY session with a shell process.
pub struct Session {
    /// Unique session identifier.
    id: SessionId,

    /// Process ID of the shell.
    pid: Option<u32>,

    /// Pty master and child killer. None once the session is closed.
    handles: Mutex<Option<PtyHandles>>,

    /// Pty input. Held under a blocking lock so every write lands whole.
    writer: Arc<StdMutex<Option<Box<dyn Write + Send>>>>,

    /// Output chunks from the reader thread.
    output: Mutex<mpsc::Receiver<Bytes>>,

    /// Current terminal size.
    size: StdMutex<TermSize>,

    state: AtomicU8,

    /// Whether a bridge currently owns the output stream.
    attached: AtomicBool,

    /// Fires once the session is closed or its shell exits.
    done: CancellationToken,

    /// Fires once the exit watcher reaped the shell.
    exited: CancellationToken,

    /// Fires once teardown has finished.
    closed: CancellationToken,

    /// When [`Session::read`] stops waiting for output. Set on the first
    /// read after the session is done.
    drain_deadline: OnceLock<Instant>,

    exit_status: OnceLock<SessionStatus>,

    kill_grace: Duration,
}

impl Session {
    /// Spawns a shell on a fresh pty sized to `size`.
    ///
    /// Returns the session and the [`ExitWatch`] for its shell. The caller
    /// must drive the watch and report the result through
    /// [`Session::mark_exited`].
    pub fn spawn(
        id: SessionId,
        size: TermSize,
        options: &SpawnOptions,
    ) -> Result<(Self, ExitWatch), SessionError> {
        let shell = detect_shell(options.shell.clone());

        let pair = native_pty_system()
            .openpty(size.into())
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&shell);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        for (key, value) in &options.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &options.cwd {
            cmd.cwd(dir);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::Spawn(format!("{shell}: {e}")))?;

        // Only the child may hold the slave side, or reads never see EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let io = pair
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                let _ = child.kill();
                return Err(SessionError::Spawn(e.to_string()));
            }
        };

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if let Err(e) = spawn_reader_thread(id.clone(), reader, output_tx) {
            let _ = child.kill();
            return Err(SessionError::Spawn(format!("failed to start reader thread: {e}")));
        }

        tracing::debug!(
            session_id = %id,
            shell = %shell,
            pid = ?pid,
            rows = size.rows,
            cols = size.cols,
            "Spawned shell"
        );

        let session = Session {
            id,
            pid,
            handles: Mutex::new(Some(PtyHandles {
                master: pair.master,
                killer,
            })),
            writer: Arc::new(StdMutex::new(Some(writer))),
            output: Mutex::new(output_rx),
            size: StdMutex::new(size),
            state: AtomicU8::new(STATE_RUNNING),
            attached: AtomicBool::new(false),
            done: CancellationToken::new(),
            exited: CancellationToken::new(),
            closed: CancellationToken::new(),
            drain_deadline: OnceLock::new(),
            exit_status: OnceLock::new(),
            kill_grace: options.kill_grace,
        };

        Ok((session, ExitWatch { child }))
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> TermSize {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Returns whether the session still accepts I/O.
    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Returns whether the session has been closed or its shell has exited.
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Waits until the session is closed or its shell exits.
    pub async fn wait_done(&self) {
        self.done.cancelled().await;
    }

    /// Returns the shell's exit status once it has been reaped.
    pub fn exit_status(&self) -> Option<SessionStatus> {
        self.exit_status.get().copied()
    }

    /// Returns whether a bridge currently owns this session's output.
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Claims the output stream for one bridge. Returns false if another
    /// bridge already holds it.
    pub fn try_claim(&self) -> bool {
        self.attached
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Gives up the claim taken with [`Session::try_claim`].
    pub fn release_claim(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }

    /// Reads the next chunk of pty output.
    ///
    /// Returns `None` at end of stream: either the pty reported EOF, or the
    /// session is done (closed, or its shell exited) and no more output
    /// arrived within a short drain window. The second case covers
    /// background jobs that keep the pty open after the shell is gone.
    ///
    /// Only one task is expected to read a session at a time.
    pub async fn read(&self) -> Option<Bytes> {
        let mut output = self.output.lock().await;

        if !self.done.is_cancelled() {
            tokio::select! {
                chunk = output.recv() => return chunk,
                _ = self.done.cancelled() => {}
            }
        }

        let deadline = *self
            .drain_deadline
            .get_or_init(|| Instant::now() + OUTPUT_DRAIN_WINDOW);
        tokio::time::timeout_at(deadline, output.recv())
            .await
            .ok()
            .flatten()
    }

    /// Writes raw input to the pty.
    ///
    /// Writes are serialized: each call lands in the pty as one contiguous
    /// run of bytes. Blocks (off the runtime) while the pty input buffer is
    /// full.
    pub async fn write(&self, data: &[u8]) -> Result<usize, SessionError> {
        if !self.is_running() {
            return Err(SessionError::Closed(self.id.clone()));
        }

        let writer = Arc::clone(&self.writer);
        let data = data.to_vec();
        let id = self.id.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = writer.lock().unwrap_or_else(PoisonError::into_inner);
            let writer = guard.as_mut().ok_or(SessionError::Closed(id))?;
            writer.write_all(&data)?;
            writer.flush()?;
            Ok(data.len())
        })
        .await
        .map_err(|e| SessionError::Io(std::io::Error::other(e)))?
    }

    /// Resizes the terminal.
    ///
    /// Zero dimensions are rejected and leave the current size untouched.
    /// The stored size only changes if the pty accepted the new one.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        let size = TermSize::new(rows, cols)?;

        let handles = self.handles.lock().await;
        let handles = handles
            .as_ref()
            .ok_or_else(|| SessionError::Closed(self.id.clone()))?;

        handles
            .master
            .resize(size.into())
            .map_err(|e| SessionError::Pty(e.to_string()))?;

        *self.size.lock().unwrap_or_else(PoisonError::into_inner) = size;

        tracing::debug!(
            session_id = %self.id,
            rows = rows,
            cols = cols,
            "Resized PTY"
        );

        Ok(())
    }

    /// Closes the session: hangs up the shell and releases the pty.
    ///
    /// Idempotent; later calls wait for the first teardown to finish and
    /// then return `Ok(())`. If the shell survives the hangup for longer than the
    /// configured grace period it is killed.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_CLOSING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            self.closed.cancelled().await;
            return Ok(());
        }

        let handles = self.handles.lock().await.take();
        if let Some(mut handles) = handles {
            if !self.exited.is_cancelled() {
                if let Err(e) = handles.killer.kill() {
                    tracing::debug!(session_id = %self.id, error = %e, "Hangup failed");
                }
                self.hang_up_process_group();
                self.schedule_force_kill();
            }
            drop(handles);
        }

        // A write may be blocked on a full pty; it fails once the shell is gone.
        let writer = Arc::clone(&self.writer);
        let released = tokio::task::spawn_blocking(move || {
            writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
        })
        .await;
        if let Err(e) = released {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to release PTY writer");
        }

        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        self.done.cancel();
        self.closed.cancel();

        tracing::info!(session_id = %self.id, "Session closed");
        Ok(())
    }

    /// Records that the shell has terminated.
    ///
    /// Called by the exit watcher. Only the first status is kept.
    pub fn mark_exited(&self, status: SessionStatus) {
        let _ = self.exit_status.set(status);
        self.exited.cancel();
        self.done.cancel();
    }

    /// Sends SIGHUP to every process in the shell's process group.
    ///
    /// The shell leads its own session, so its pid is also its group id.
    /// Jobs a job-control shell moved into their own groups are not reached.
    #[cfg(unix)]
    fn hang_up_process_group(&self) {
        if let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) {
            send_to_group(&self.id, pid, nix::sys::signal::Signal::SIGHUP);
        }
    }

    #[cfg(not(unix))]
    fn hang_up_process_group(&self) {}

    #[cfg(unix)]
    fn schedule_force_kill(&self) {
        let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        let exited = self.exited.clone();
        let grace = self.kill_grace;
        let session_id = self.id.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = exited.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    tracing::warn!(
                        session_id = %session_id,
                        pid = pid,
                        "Shell ignored hangup, sending SIGKILL"
                    );
                    send_to_group(&session_id, pid, nix::sys::signal::Signal::SIGKILL);
                }
            }
        });
    }

    #[cfg(not(unix))]
    fn schedule_force_kill(&self) {}
}

/// Sends `signal` to the process group led by `pid`, falling back to the
/// process alone if the group is already gone.
#[cfg(unix)]
fn send_to_group(session_id: &str, pid: i32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(pid);
    if killpg(pid, signal).is_err() {
        if let Err(e) = kill(pid, signal) {
            tracing::debug!(session_id = %session_id, signal = ?signal, error = %e, "Signal failed");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(handles) = self.handles.get_mut().as_mut() {
            if !self.exited.is_cancelled() {
                let _ = handles.killer.kill();
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("size", &self.size())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Moves pty output into the session's channel until EOF.
fn spawn_reader_thread(
    session_id: SessionId,
    mut reader: Box<dyn Read + Send>,
    output_tx: mpsc::Sender<Bytes>,
) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name(format!("pty-reader-{session_id}"))
        .spawn(move || {
            let mut buffer = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        tracing::debug!(session_id = %session_id, "PTY EOF");
                        break;
                    }
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&buffer[..n]);
                        if output_tx.blocking_send(chunk).is_err() {
                            tracing::trace!(session_id = %session_id, "Output receiver dropped");
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // Linux reports EIO on the master once the slave side is gone.
                        tracing::debug!(session_id = %session_id, error = %e, "PTY read ended");
                        break;
                    }
                }
            }
        })
        .map(|_| ())
}

/// Detects the shell to use.
///
/// Returns the shell in this order of preference:
/// 1. The provided shell if Some and non-empty
/// 2. The $SHELL environment variable
/// 3. The first of /bin/bash, /bin/zsh, /bin/sh that exists
///
/// On Windows: PowerShell if it is on PATH, otherwise cmd.exe.
pub fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell.filter(|s| !s.is_empty()) {
        return s;
    }

    if cfg!(windows) {
        return if which::which("powershell.exe").is_ok() {
            "powershell.exe".to_string()
        } else {
            "cmd.exe".to_string()
        };
    }

    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }

    ["/bin/bash", "/bin/zsh", "/bin/sh"]
        .into_iter()
        .find(|candidate| std::path::Path::new(candidate).exists())
        .unwrap_or("/bin/sh")
        .to_string()
}
