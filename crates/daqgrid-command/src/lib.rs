//! daqgrid-command — transition command fan-out.
//!
//! The environment manager drives state changes across many tasks at
//! once. The [`CommandServant`] serializes a command once, dispatches one
//! executor message per target, and correlates the asynchronous responses
//! against per-target pending slots with an absolute deadline:
//!
//! - every target responded → [`CommandOutcome::Ok`]
//! - some responded, some silent at the deadline → [`CommandOutcome::Partial`]
//! - nobody responded → [`CommandOutcome::Timeout`]
//! - shutdown while waiting → [`CommandOutcome::Cancelled`]
//!
//! Duplicate and unmatched responses are logged and discarded.

pub mod command;
pub mod error;
pub mod servant;

pub use command::{
    CommandId, CommandOutcome, CommandResponse, CommandTarget, TargetStatus, TransitionRequest,
    TRANSITION_COMMAND,
};
pub use error::{CommandError, CommandResult};
pub use servant::CommandServant;
