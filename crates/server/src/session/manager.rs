//! Session table for managing concurrent PTY sessions.
//!
//! The table is the single source of truth for which sessions exist. An id
//! maps to at most one live [`Session`]; a session leaves the table when it
//! is destroyed, released by its bridge, or when its shell exits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use super::pty::{
    ExitWatch, Session, SessionError, SessionId, SessionState, SessionStatus, SpawnOptions,
    TermSize,
};

/// Information about a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Process ID of the shell.
    pub pid: Option<u32>,
    /// Current terminal rows.
    pub rows: u16,
    /// Current terminal columns.
    pub cols: u16,
    /// Lifecycle state.
    pub state: SessionState,
    /// Whether a client is bridged to the session.
    pub attached: bool,
    /// Exit status, once the shell has been reaped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<SessionStatus>,
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        let size = session.size();
        Self {
            id: session.id().clone(),
            pid: session.pid(),
            rows: size.rows,
            cols: size.cols,
            state: session.state(),
            attached: session.is_attached(),
            exit_status: session.exit_status(),
        }
    }
}

/// Thread-safe session table backed by DashMap.
///
/// Must be used from within a Tokio runtime: creating a session starts a
/// task that watches for the shell's exit.
pub struct SessionTable {
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Slots taken, including sessions still being spawned.
    reserved: AtomicUsize,
    options: SpawnOptions,
    max_sessions: usize,
}

impl SessionTable {
    /// Creates an empty table. New shells are started with `options`.
    pub fn new(options: SpawnOptions, max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            reserved: AtomicUsize::new(0),
            options,
            max_sessions,
        }
    }

    /// Returns the session registered under `id`, spawning a new one sized
    /// `size` if there is none.
    ///
    /// An existing session keeps its current size. Creation is atomic per
    /// id: concurrent callers with the same id all receive the same session.
    pub fn create_or_attach(
        self: &Arc<Self>,
        id: &str,
        size: TermSize,
    ) -> Result<Arc<Session>, SessionError> {
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(entry) => {
                let session = entry.get();
                if session.is_done() {
                    // Shell exited; the exit watcher is about to remove it.
                    return Err(SessionError::Closed(id.to_string()));
                }
                tracing::debug!(session_id = %id, "Attaching to existing session");
                Ok(Arc::clone(session))
            }
            Entry::Vacant(entry) => {
                self.reserve_slot()?;

                let (session, exit) = match Session::spawn(id.to_string(), size, &self.options)
                {
                    Ok(spawned) => spawned,
                    Err(e) => {
                        self.reserved.fetch_sub(1, Ordering::SeqCst);
                        return Err(e);
                    }
                };

                let session = Arc::new(session);
                entry.insert(Arc::clone(&session));
                self.watch_exit(Arc::clone(&session), exit);

                tracing::info!(
                    session_id = %id,
                    pid = ?session.pid(),
                    rows = size.rows,
                    cols = size.cols,
                    "Created session"
                );
                Ok(session)
            }
        }
    }

    /// Looks up a live session.
    pub fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Like [`SessionTable::lookup`], failing with
    /// [`SessionError::NotFound`] for an unknown id.
    pub fn get(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        self.lookup(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Returns the ids of all sessions in the table.
    pub fn enumerate(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Gets information about a specific session.
    pub fn info(&self, id: &str) -> Option<SessionInfo> {
        self.sessions
            .get(id)
            .map(|entry| SessionInfo::from(entry.value().as_ref()))
    }

    /// Lists all sessions.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| SessionInfo::from(entry.value().as_ref()))
            .collect()
    }

    /// Returns the number of sessions in the table.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Returns whether a session is registered under `id`.
    pub fn exists(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Removes and closes the session under `id`.
    ///
    /// Returns `Ok(())` if there is no such session.
    pub async fn destroy(&self, id: &str) -> Result<(), SessionError> {
        let Some((_, session)) = self.sessions.remove(id) else {
            return Ok(());
        };
        self.reserved.fetch_sub(1, Ordering::SeqCst);

        session.close().await?;
        tracing::info!(session_id = %id, "Destroyed session");
        Ok(())
    }

    /// Removes `session` from the table, if it is still the one registered
    /// under its id, and closes it.
    ///
    /// A stale handle never evicts a newer session that reuses the same id.
    pub async fn release(&self, session: &Arc<Session>) {
        let removed = self
            .sessions
            .remove_if(session.id(), |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if removed {
            self.reserved.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(session_id = %session.id(), "Released session");
        }

        if let Err(e) = session.close().await {
            tracing::warn!(session_id = %session.id(), error = %e, "Failed to close session");
        }
    }

    /// Closes every session. Used on server shutdown.
    pub async fn shutdown(&self) {
        let ids = self.enumerate();
        tracing::info!(count = ids.len(), "Closing all sessions");

        for id in ids {
            if let Err(e) = self.destroy(&id).await {
                tracing::warn!(session_id = %id, error = %e, "Failed to close session");
            }
        }
    }

    fn reserve_slot(&self) -> Result<(), SessionError> {
        let max = self.max_sessions;
        self.reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(SessionError::LimitReached)
    }

    fn watch_exit(self: &Arc<Self>, session: Arc<Session>, exit: ExitWatch) {
        let table: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let status = exit.wait().await;
            session.mark_exited(status);
            tracing::info!(session_id = %session.id(), status = ?status, "Shell exited");

            match table.upgrade() {
                Some(table) => table.release(&session).await,
                None => {
                    let _ = session.close().await;
                }
            }
        });
    }
}

impl std::fmt::Debug for SessionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTable")
            .field("sessions", &self.sessions.len())
            .field("max_sessions", &self.max_sessions)
            .finish()
    }
}
