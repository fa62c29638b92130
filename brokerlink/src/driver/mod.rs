//! Per-device command execution and recovery.
//!
//! The driver layer sends a command list to one device through a
//! [`CommandChannel`](crate::channel::CommandChannel), answers interactive
//! prompts along the way, retries channel-level failures and then probes
//! the device until it is reachable again.

mod attempt;
mod matcher;
mod outcome;
mod params;
mod recovery;
mod runner;
pub mod state;

pub use attempt::{CANCELLED_DETAIL, ExecutionAttempt, FailureReason, Transcript};
pub use matcher::PromptMatcher;
pub use outcome::{DeviceOutcome, DeviceStatus};
pub use params::{
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_DELAY_BEFORE_CHECK, DEFAULT_RECOVERY_TEST_COMMAND, RunParams,
};
pub use recovery::{ProbeReport, RecoveryProbe};
pub use runner::DeviceRunner;
pub use state::{RunEvent, RunFailure, RunState};
