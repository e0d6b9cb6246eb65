//! OTA command dispatch
//!
//! A command is fanned out once to each of its targets and then tracks
//! per-target delivery and acknowledgement state. Acknowledgements without a
//! command id are correlated to the target's most recent outstanding command.

pub mod acks;
pub mod dispatcher;
pub mod types;

pub use acks::{ACKS_KEY, AckLog};
pub use dispatcher::{COMMANDS_KEY, CommandDispatcher};
pub use types::{
    AckRecord, Command, CommandFailure, CommandRequest, CommandStatus, FailureReason, TargetState,
    TargetStatus, Targets,
};
