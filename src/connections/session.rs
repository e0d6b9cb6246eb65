//! Session handles for connected peers

use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::Outbound;
use crate::{Error, Result};

/// Sending half of a connected session
///
/// The socket task owns the receiving half and writes every queued frame to
/// the transport. Cloning a handle is cheap; all clones feed the same socket.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Uuid,
    tx: mpsc::Sender<Outbound>,
}

impl SessionHandle {
    /// Wrap the sender of a session's outbound queue
    #[must_use]
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }

    /// Create a handle together with its outbound queue
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Unique id of this session (distinct across reconnects of one device)
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a frame, waiting for room if the queue is full
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the session's socket task has ended
    pub async fn push(&self, message: Outbound) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Error::Transport(format!("session {} closed", self.id)))
    }

    /// Queue a frame, giving up if the queue stays full for `limit`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the session is closed or no room
    /// opened up in time
    pub async fn push_within(&self, message: Outbound, limit: Duration) -> Result<()> {
        self.tx.send_timeout(message, limit).await.map_err(|e| match e {
            mpsc::error::SendTimeoutError::Timeout(_) => {
                Error::Transport(format!("session {} queue stayed full", self.id))
            }
            mpsc::error::SendTimeoutError::Closed(_) => {
                Error::Transport(format!("session {} closed", self.id))
            }
        })
    }

    /// Queue a frame without waiting
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the session is closed or its queue is full
    pub fn try_push(&self, message: Outbound) -> Result<()> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::Transport(format!("session {} queue full", self.id))
            }
            mpsc::error::TrySendError::Closed(_) => {
                Error::Transport(format!("session {} closed", self.id))
            }
        })
    }
}
