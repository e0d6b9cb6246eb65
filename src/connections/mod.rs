//! Live connection registry
//!
//! Maps a device identity to the session currently serving it. Entries are
//! installed on a successful `register` handshake and removed when the
//! transport reports the session closed.

pub mod registry;
pub mod session;

pub use registry::{ConnectionRegistry, except};
pub use session::SessionHandle;
