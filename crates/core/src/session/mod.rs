//! Relay session management.
//!
//! One session exists per downstream consumer. It owns exactly one camera
//! connection at a time and walks this state machine:
//!
//! ```text
//! Connecting  -> Streaming            (camera answered)
//! Connecting  -> Reconnecting         (transient failure, budget left)
//! Streaming   -> Reconnecting         (stall, reset, end of stream)
//! Reconnecting -> Reconnecting        (another attempt failed, budget left)
//! Reconnecting -> Streaming           (camera answered again)
//! any         -> Failed -> Closed     (fatal error or budget exhausted)
//! any         -> Closed               (consumer disconnected)
//! ```
//!
//! The [`supervisor`] drives the machine; [`SessionRegistry`] only exposes
//! a read-only view of live sessions to the server.

pub mod supervisor;
pub mod target;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub use supervisor::{SessionReport, Supervisor};
pub use target::StreamTarget;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Lifecycle phase of a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Validating the target and opening the first camera connection.
    Connecting,
    /// Frames are flowing downstream.
    Streaming,
    /// Waiting out the backoff or retrying the camera.
    Reconnecting,
    /// A terminal error is being reported.
    Failed,
    /// Terminal; all resources released.
    Closed,
}

/// Mutable session bookkeeping, owned by the supervisor.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub reconnect_count: u32,
    pub started_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Connecting,
            reconnect_count: 0,
            started_at: Utc::now(),
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// A live relay session as seen by the server.
#[derive(Debug)]
pub struct Session {
    /// Unique session identifier (16-char hex string).
    pub id: String,
    pub peer_addr: SocketAddr,
    /// Camera URL as received, before validation.
    pub url: String,
    state: RwLock<SessionState>,
}

impl Session {
    pub fn new(peer_addr: SocketAddr, url: &str) -> Self {
        let id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
        Session {
            id: format!("{:016X}", id),
            peer_addr,
            url: url.to_string(),
            state: RwLock::new(SessionState::new()),
        }
    }

    /// Publish the supervisor's latest state.
    pub fn publish(&self, state: &SessionState) {
        *self.state.write() = state.clone();
    }

    pub fn state(&self) -> SessionState {
        self.state.read().clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.read().phase
    }
}

/// Snapshot of one live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub peer_addr: SocketAddr,
    pub url: String,
    pub phase: SessionPhase,
    pub reconnect_count: u32,
    pub started_at: DateTime<Utc>,
}

/// Thread-safe registry of live sessions.
///
/// Sessions never share state with each other; the registry exists so the
/// server can report who is connected.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new session and register it.
    pub fn create_session(&self, peer_addr: SocketAddr, url: &str) -> Arc<Session> {
        let session = Arc::new(Session::new(peer_addr, url));
        let id = session.id.clone();
        let total = {
            let mut sessions = self.sessions.write();
            sessions.insert(id.clone(), session.clone());
            sessions.len()
        };
        tracing::debug!(session_id = %id, %peer_addr, url, total_sessions = total, "session created");
        session
    }

    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .values()
            .map(|session| {
                let state = session.state();
                SessionInfo {
                    session_id: session.id.clone(),
                    peer_addr: session.peer_addr,
                    url: session.url.clone(),
                    phase: state.phase,
                    reconnect_count: state.reconnect_count,
                    started_at: state.started_at,
                }
            })
            .collect()
    }
}
