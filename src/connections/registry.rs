//! Connection registry for routing frames to connected devices

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use uuid::Uuid;

use super::session::SessionHandle;
use crate::protocol::Outbound;

/// How long a targeted send waits for room in a full session queue
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Registry of live sessions keyed by device identity
///
/// All access goes through one map-wide lock. The lock is only held for map
/// operations; handles are cloned out before any frame is pushed.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
    send_timeout: Duration,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::with_send_timeout(DEFAULT_SEND_TIMEOUT)
    }
}

impl ConnectionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry whose targeted sends wait at most `send_timeout`
    #[must_use]
    pub fn with_send_timeout(send_timeout: Duration) -> Self {
        Self {
            sessions: Arc::default(),
            send_timeout,
        }
    }

    /// Install `session` for `identity`, returning the session it replaced
    pub async fn connect(&self, identity: &str, session: SessionHandle) -> Option<SessionHandle> {
        let previous = self
            .sessions
            .write()
            .await
            .insert(identity.to_string(), session);
        if let Some(prev) = &previous {
            tracing::debug!(sensor_id = %identity, session = %prev.id(), "replaced existing session");
        }
        previous
    }

    /// Remove the mapping for `identity` if present
    pub async fn disconnect(&self, identity: &str) -> Option<SessionHandle> {
        self.sessions.write().await.remove(identity)
    }

    /// Remove the mapping for `identity` only if it still points at `session_id`
    ///
    /// Returns false when the identity is unmapped or has been taken over by
    /// a newer session.
    pub async fn release(&self, identity: &str, session_id: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(identity) {
            Some(current) if current.id() == session_id => {
                sessions.remove(identity);
                true
            }
            _ => false,
        }
    }

    /// Get the session currently serving `identity`
    pub async fn lookup(&self, identity: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(identity).cloned()
    }

    /// Whether `identity` has a live session
    pub async fn is_connected(&self, identity: &str) -> bool {
        self.sessions.read().await.contains_key(identity)
    }

    /// Push a frame to the session serving `identity`
    ///
    /// Returns false if there is no session, the transport refused the frame
    /// or the session's queue stayed full past the send timeout. Transport
    /// failures never propagate past this call.
    pub async fn send(&self, identity: &str, message: Outbound) -> bool {
        let Some(session) = self.lookup(identity).await else {
            return false;
        };
        match session.push_within(message, self.send_timeout).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(sensor_id = %identity, error = %e, "send to session failed");
                false
            }
        }
    }

    /// Best-effort push of `message` to every session not in `exclude`
    ///
    /// A failed recipient is logged and skipped; it stays registered until
    /// its own transport reports the disconnect. Returns how many sessions
    /// accepted the frame.
    pub async fn broadcast(&self, message: &Outbound, exclude: &HashSet<String>) -> usize {
        let recipients: Vec<(String, SessionHandle)> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(identity, _)| !exclude.contains(*identity))
            .map(|(identity, session)| (identity.clone(), session.clone()))
            .collect();

        let mut delivered = 0;
        for (identity, session) in recipients {
            match session.try_push(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(sensor_id = %identity, error = %e, "broadcast skipped recipient");
                }
            }
        }
        delivered
    }

    /// Identities with a live session
    pub async fn identities(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Number of live sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no session is connected
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

/// Exclusion set holding a single identity
#[must_use]
pub fn except(identity: &str) -> HashSet<String> {
    HashSet::from([identity.to_string()])
}
