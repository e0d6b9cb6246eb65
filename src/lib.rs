//! OTA Gateway - device fleet presence tracking and command fan-out
//!
//! Devices hold a persistent WebSocket session with the gateway. The gateway
//! keeps three pieces of state in step:
//! - which devices are connected right now ([`ConnectionRegistry`])
//! - each device's durable presence record ([`PresenceRegistry`])
//! - OTA commands fanned out to sets of devices and the acknowledgements
//!   they produce ([`CommandDispatcher`])
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │        Devices (WebSocket)  │  Admin HTTP API         │
//! └──────────────┬──────────────┴──────────┬─────────────┘
//!                │                         │
//! ┌──────────────▼─────────────────────────▼─────────────┐
//! │  Gateway sessions  │  Connection registry (memory)   │
//! │  Presence registry │  Command dispatcher │ Ack log   │
//! └──────────────────────────┬───────────────────────────┘
//!                            │
//! ┌──────────────────────────▼───────────────────────────┐
//! │         Document store (JSON files, flock)           │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod connections;
pub mod devices;
pub mod error;
pub mod gateway;
pub mod ota;
pub mod protocol;
pub mod store;

pub use config::Config;
pub use connections::{ConnectionRegistry, SessionHandle};
pub use devices::{Device, PresenceRegistry, RegisterFields, Snapshot, SnapshotUpdate};
pub use error::{Error, Result};
pub use gateway::{DeviceSession, Gateway};
pub use ota::{
    AckLog, AckRecord, Command, CommandDispatcher, CommandRequest, CommandStatus, TargetState,
    TargetStatus,
};
pub use protocol::{Event, Inbound, Outbound};
pub use store::{DocumentStore, Documents, FileStore, MemoryStore};

/// Current UTC time as a fixed-width ISO-8601 string
///
/// Every stored timestamp uses this format so that string order matches
/// chronological order.
#[must_use]
pub fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
