//! Session manager for tracking all connected subscribers

use super::connection::{SessionHandle, SessionId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Outcome of one broadcast
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Sessions whose send failed; already pruned
    pub failed: Vec<SessionId>,
}

/// Manages all active subscriber sessions
pub struct SessionManager {
    /// Map of session id -> session handle
    sessions: Arc<RwLock<HashMap<SessionId, SessionHandle>>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate the id for the next session
    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Track a session; returns the new connection count
    pub async fn register(&self, handle: SessionHandle) -> usize {
        let mut sessions = self.sessions.write().await;
        sessions.insert(handle.id, handle);
        sessions.len()
    }

    /// Stop tracking a session; returns the new connection count
    pub async fn unregister(&self, id: SessionId) -> usize {
        let mut sessions = self.sessions.write().await;
        sessions.remove(&id);
        sessions.len()
    }

    /// Send a text frame to every session
    ///
    /// A failed send is logged and the session pruned; the others still
    /// receive the frame. A full queue counts as a failure, so a stalled
    /// subscriber is dropped instead of buffering without bound.
    pub async fn broadcast(&self, text: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        {
            let sessions = self.sessions.read().await;
            for (id, handle) in sessions.iter() {
                match handle.send_text(text) {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        warn!("[HUB] Failed to send to session {} ({}): {}", id, handle.addr, e);
                        report.failed.push(*id);
                    }
                }
            }
        }

        if !report.failed.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in &report.failed {
                sessions.remove(id);
            }
        }

        report
    }

    /// Number of connected sessions
    pub async fn connection_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
