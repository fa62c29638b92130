//! Record of one pass over a device's command list.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::channel::normalize_output;

/// Failure detail for devices whose run was cut short by cancellation.
pub const CANCELLED_DETAIL: &str = "cancelled before completion";

/// Why a command attempt failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The channel could not be opened, refused a write, or closed early.
    Channel { message: String },

    /// No prompt matched and the command never completed in time.
    Timeout { seconds: f64 },

    /// The device kept prompting past the per-command answer cap.
    ExhaustedPrompts { command: String, answers: usize },

    /// The run was cancelled while the attempt was in progress.
    Cancelled,
}

impl FailureReason {
    /// Build a channel failure from any displayable error.
    pub fn channel(error: impl fmt::Display) -> Self {
        Self::Channel {
            message: error.to_string(),
        }
    }

    /// Build a timeout failure.
    pub fn timeout(waited: Duration) -> Self {
        Self::Timeout {
            seconds: waited.as_secs_f64(),
        }
    }

    /// Whether another attempt may help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Channel { .. } | Self::Timeout { .. })
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel { message } => write!(f, "channel error: {message}"),
            Self::Timeout { seconds } => {
                write!(f, "no prompt matched and no completion within {seconds}s")
            }
            Self::ExhaustedPrompts { command, answers } => {
                write!(f, "command {command:?} still prompting after {answers} answer(s)")
            }
            Self::Cancelled => f.write_str(CANCELLED_DETAIL),
        }
    }
}

/// What went over the wire during an attempt.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    /// Commands and answers in the order they were sent.
    pub sent: Vec<String>,

    /// Everything the device printed, ANSI-stripped.
    pub output: Vec<u8>,
}

impl Transcript {
    /// Record a sent command or answer.
    pub fn record_sent(&mut self, text: impl Into<String>) {
        self.sent.push(text.into());
    }

    /// Append device output.
    pub fn record_output(&mut self, data: &[u8]) {
        self.output.extend_from_slice(data);
    }
}

/// One pass over the command list.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionAttempt {
    /// 1-based attempt number.
    pub index: u32,

    /// Commands and answers sent on this attempt.
    pub executed_commands: Vec<String>,

    /// Captured output with normalized line endings.
    pub output: String,

    /// Why the attempt failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,

    /// Wall time spent on the attempt.
    #[serde(skip)]
    pub elapsed: Duration,
}

impl ExecutionAttempt {
    /// Seal an attempt from its transcript.
    pub fn finish(
        index: u32,
        transcript: Transcript,
        failure: Option<FailureReason>,
        elapsed: Duration,
    ) -> Self {
        Self {
            index,
            executed_commands: transcript.sent,
            output: normalize_output(&transcript.output),
            failure,
            elapsed,
        }
    }

    /// Whether the whole command list completed.
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_reasons() {
        assert!(FailureReason::channel("closed").is_retryable());
        assert!(FailureReason::timeout(Duration::from_secs(5)).is_retryable());
        assert!(
            !FailureReason::ExhaustedPrompts {
                command: "reload".into(),
                answers: 32
            }
            .is_retryable()
        );
        assert!(!FailureReason::Cancelled.is_retryable());
        assert_eq!(FailureReason::Cancelled.to_string(), CANCELLED_DETAIL);
    }

    #[test]
    fn test_finish_normalizes_output() {
        let mut transcript = Transcript::default();
        transcript.record_sent("show clock");
        transcript.record_output(b"show clock\r\n12:00:00\r\nr1#");

        let attempt = ExecutionAttempt::finish(1, transcript, None, Duration::ZERO);
        assert!(attempt.succeeded());
        assert_eq!(attempt.output, "show clock\n12:00:00\nr1#");
        assert_eq!(attempt.executed_commands, vec!["show clock"]);
    }

    #[test]
    fn test_reason_display() {
        let reason = FailureReason::timeout(Duration::from_secs(300));
        assert_eq!(
            reason.to_string(),
            "no prompt matched and no completion within 300s"
        );
    }
}
