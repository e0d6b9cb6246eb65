//! Device presence registry
//!
//! Durable per-device state: online flag, last-seen time and the latest
//! configuration and health reports.

pub mod registry;
pub mod types;

pub use registry::{DEVICES_KEY, PresenceRegistry};
pub use types::{Device, ProvisionFields, RegisterFields, Snapshot, SnapshotUpdate};
