//! Device session driver
//!
//! [`Gateway`] bundles the registries and the dispatcher that every session
//! shares. [`DeviceSession`] turns the frames of one connection into calls on
//! them and owns that connection's disconnect cleanup.

pub mod session;

pub use session::DeviceSession;

use tokio::sync::mpsc;

use crate::connections::{ConnectionRegistry, SessionHandle};
use crate::devices::PresenceRegistry;
use crate::ota::{AckLog, CommandDispatcher};
use crate::protocol::Outbound;
use crate::store::Documents;
use crate::{Config, Result};

/// Outbound queue depth used when none is configured
pub const DEFAULT_SESSION_BUFFER: usize = 64;

/// Shared gateway state
#[derive(Debug, Clone)]
pub struct Gateway {
    connections: ConnectionRegistry,
    presence: PresenceRegistry,
    dispatcher: CommandDispatcher,
    acks: AckLog,
    session_buffer: usize,
}

impl Gateway {
    /// Build a gateway over `docs`
    #[must_use]
    pub fn new(docs: Documents, session_buffer: usize) -> Self {
        let connections = ConnectionRegistry::new();
        let presence = PresenceRegistry::new(docs.clone());
        let dispatcher = CommandDispatcher::new(docs.clone(), connections.clone(), presence.clone());
        Self {
            connections,
            presence,
            dispatcher,
            acks: AckLog::new(docs),
            session_buffer: session_buffer.max(1),
        }
    }

    /// Gateway persisting to the configured data directory
    ///
    /// # Errors
    ///
    /// Returns error if the data directory cannot be created
    pub fn open(config: &Config) -> Result<Self> {
        let docs = Documents::open(&config.data_dir)?;
        tracing::info!(data_dir = %config.data_dir.display(), "opened document store");
        Ok(Self::new(docs, config.session_buffer))
    }

    /// Gateway whose state lives only in memory
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Documents::in_memory(), DEFAULT_SESSION_BUFFER)
    }

    /// Start a session and return the queue of frames to write to its transport
    #[must_use]
    pub fn open_session(&self) -> (DeviceSession, mpsc::Receiver<Outbound>) {
        let (handle, rx) = SessionHandle::channel(self.session_buffer);
        (DeviceSession::new(self.clone(), handle), rx)
    }

    /// Live session registry
    #[must_use]
    pub const fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Durable device records
    #[must_use]
    pub const fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// Command fan-out and ack correlation
    #[must_use]
    pub const fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    /// Raw acknowledgement log
    #[must_use]
    pub const fn acks(&self) -> &AckLog {
        &self.acks
    }
}
