//! The per-device run as an explicit state machine.
//!
//! ```text
//! Attempting(1) --ok--> Settling --settled--> Probing --answered--> Done
//!      |                                         |
//!      +--retryable, attempts left--> Attempting(n+1)
//!      +--otherwise--> Failed(Commands)          +--deadline--> Failed(Recovery)
//!
//! any running state --cancelled--> Failed(Cancelled)
//! ```
//!
//! Transitions are pure, so the policy can be tested without any I/O.

use super::attempt::FailureReason;

/// Where a device run currently is.
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    /// Running the command list for the given 1-based attempt.
    Attempting { attempt: u32 },

    /// Waiting `delay_before_check` before the first probe.
    Settling,

    /// Polling the device until it answers.
    Probing,

    /// Commands ran and the device came back.
    Done,

    /// The run is over and failed.
    Failed(RunFailure),
}

/// Why a run ended in [`RunState::Failed`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunFailure {
    /// The command list never completed.
    Commands {
        attempts: u32,
        reason: FailureReason,
    },

    /// The device did not answer the probe in time.
    Recovery,

    /// The run was cancelled before it could finish.
    Cancelled,
}

/// What just happened in the current state.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// An attempt finished, with its failure if any.
    AttemptFinished { failure: Option<FailureReason> },

    /// The settling delay elapsed.
    Settled,

    /// The probe finished.
    ProbeFinished { succeeded: bool },

    /// The run was cancelled.
    Cancelled,
}

impl RunState {
    /// Starting state of every run.
    pub fn start() -> Self {
        Self::Attempting { attempt: 1 }
    }

    /// Apply `event`; `max_attempts` bounds command retries.
    ///
    /// Events that do not belong to the current state leave it unchanged.
    pub fn advance(self, event: RunEvent, max_attempts: u32) -> Self {
        match (self, event) {
            (state, RunEvent::Cancelled) if !state.is_terminal() => {
                Self::Failed(RunFailure::Cancelled)
            }
            (Self::Attempting { .. }, RunEvent::AttemptFinished { failure: None }) => {
                Self::Settling
            }
            (Self::Attempting { attempt }, RunEvent::AttemptFinished { failure: Some(reason) }) => {
                if reason.is_retryable() && attempt < max_attempts {
                    Self::Attempting {
                        attempt: attempt + 1,
                    }
                } else {
                    Self::Failed(RunFailure::Commands {
                        attempts: attempt,
                        reason,
                    })
                }
            }
            (Self::Settling, RunEvent::Settled) => Self::Probing,
            (Self::Probing, RunEvent::ProbeFinished { succeeded: true }) => Self::Done,
            (Self::Probing, RunEvent::ProbeFinished { succeeded: false }) => {
                Self::Failed(RunFailure::Recovery)
            }
            (state, _) => state,
        }
    }

    /// Whether the run is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}
