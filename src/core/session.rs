//! Active session tracking
//!
//! Every accepted client connection is registered here for its whole
//! lifetime. Shutdown waits on `wait_idle` until the set drains.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use super::protocol::{Address, Command, Request};

/// Unique session identifier
pub type SessionId = u64;

/// Information about an active session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Client address
    pub peer_addr: SocketAddr,
    /// When the connection was accepted
    pub accepted_at: Instant,
    /// Requested command, once the request is decoded
    pub command: Option<Command>,
    /// Requested target, once the request is decoded
    pub target: Option<Address>,
}

impl SessionInfo {
    /// Time since the connection was accepted
    pub fn lifetime(&self) -> Duration {
        self.accepted_at.elapsed()
    }
}

/// Concurrency-safe set of in-flight sessions
#[derive(Debug, Clone)]
pub struct SessionManager {
    /// Counter for generating unique session IDs
    next_session_id: Arc<AtomicU64>,
    /// Map from session_id to session info
    sessions: Arc<DashMap<SessionId, SessionInfo>>,
    /// Signalled whenever the last session unregisters
    idle: Arc<Notify>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    /// Create a new SessionManager
    pub fn new() -> Self {
        Self {
            next_session_id: Arc::new(AtomicU64::new(1)),
            sessions: Arc::new(DashMap::new()),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Register a new session and return its ID
    pub fn register(&self, peer_addr: SocketAddr) -> SessionId {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(
            session_id,
            SessionInfo {
                peer_addr,
                accepted_at: Instant::now(),
                command: None,
                target: None,
            },
        );
        session_id
    }

    /// Attach the decoded request to a session; unknown ids are ignored
    pub fn record_request(&self, session_id: SessionId, request: &Request) {
        if let Some(mut info) = self.sessions.get_mut(&session_id) {
            info.command = Some(request.command);
            info.target = Some(request.addr.clone());
        }
    }

    /// Unregister a session, returning its final entry
    pub fn unregister(&self, session_id: SessionId) -> Option<SessionInfo> {
        let removed = self.sessions.remove(&session_id);
        if self.sessions.is_empty() {
            self.idle.notify_waiters();
        }
        removed.map(|(_, info)| info)
    }

    /// Get the number of active sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Wait until no session is registered
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register interest before checking, so an unregister racing with
            // the check still wakes us.
            notified.as_mut().enable();
            if self.sessions.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
