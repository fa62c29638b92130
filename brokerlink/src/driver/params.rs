//! Per-run parameters shared by every device in a fleet run.

use std::time::Duration;

use crate::channel::PromptRules;
use crate::error::ConfigError;

/// Default pre-probe settling time.
pub const DEFAULT_DELAY_BEFORE_CHECK: Duration = Duration::from_secs(10);

/// Default time box for a single channel read.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// Default probe command; a bare carriage return elicits a prompt.
pub const DEFAULT_RECOVERY_TEST_COMMAND: &str = "\r";

/// Everything a [`DeviceRunner`](super::DeviceRunner) needs besides the
/// device itself.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use brokerlink::channel::{PromptRule, PromptRules};
/// use brokerlink::driver::RunParams;
///
/// let params = RunParams::new(vec!["reload".into()], Duration::from_secs(300))
///     .prompt_rules(PromptRules::new(vec![
///         PromptRule::new(r".*yes/no.*", "yes\r").unwrap(),
///         PromptRule::new(r".*confirm.*", "\r").unwrap(),
///     ]))
///     .recovery_test_command("show clock");
/// assert_eq!(params.command_retries, 1);
/// ```
#[derive(Debug, Clone)]
pub struct RunParams {
    /// Commands sent in order on every attempt.
    pub commands: Vec<String>,

    /// Interactive prompts and their answers.
    pub prompt_rules: PromptRules,

    /// Bounds each command's prompt/completion window and the recovery wait.
    pub seconds_to_wait: Duration,

    /// Fixed settling time before the first probe.
    pub delay_before_check: Duration,

    /// Total number of command attempts (at least 1).
    pub command_retries: u32,

    /// Probe command sent while waiting for recovery.
    pub recovery_test_command: String,

    /// Time box for a single channel read, and the quiet period that ends
    /// a command when the channel has no completion pattern.
    pub command_timeout: Duration,

    /// Pause after each command is sent.
    pub wait_between_commands: Duration,

    /// Pause after each answer is sent.
    pub wait_after_answer: Duration,

    /// Answers allowed per command before the attempt is abandoned.
    pub max_answers_per_command: usize,

    /// Pause between failed command attempts.
    pub retry_pause: Duration,

    /// Backoff between probe attempts.
    pub probe_interval: Duration,
}

impl RunParams {
    /// Parameters with defaults for everything but the commands and the
    /// wait bound.
    pub fn new(commands: Vec<String>, seconds_to_wait: Duration) -> Self {
        Self {
            commands,
            prompt_rules: PromptRules::default(),
            seconds_to_wait,
            delay_before_check: DEFAULT_DELAY_BEFORE_CHECK,
            command_retries: 1,
            recovery_test_command: DEFAULT_RECOVERY_TEST_COMMAND.to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            wait_between_commands: Duration::from_millis(500),
            wait_after_answer: Duration::from_millis(500),
            max_answers_per_command: 32,
            retry_pause: Duration::from_secs(1),
            probe_interval: Duration::from_secs(2),
        }
    }

    /// Set the prompt rules.
    pub fn prompt_rules(mut self, rules: PromptRules) -> Self {
        self.prompt_rules = rules;
        self
    }

    /// Set the settling delay before recovery probing.
    pub fn delay_before_check(mut self, delay: Duration) -> Self {
        self.delay_before_check = delay;
        self
    }

    /// Set the total number of command attempts.
    pub fn command_retries(mut self, retries: u32) -> Self {
        self.command_retries = retries;
        self
    }

    /// Set the recovery probe command.
    pub fn recovery_test_command(mut self, command: impl Into<String>) -> Self {
        self.recovery_test_command = command.into();
        self
    }

    /// Set the per-read time box.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the pauses after commands and after answers.
    pub fn pacing(mut self, between_commands: Duration, after_answer: Duration) -> Self {
        self.wait_between_commands = between_commands;
        self.wait_after_answer = after_answer;
        self
    }

    /// Set the per-command answer cap.
    pub fn max_answers_per_command(mut self, max: usize) -> Self {
        self.max_answers_per_command = max;
        self
    }

    /// Set the pause between failed attempts.
    pub fn retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    /// Set the probe backoff.
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Reject parameter combinations that can never run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.commands.is_empty() {
            return Err(ConfigError::Missing("commands"));
        }
        if self.seconds_to_wait.is_zero() {
            return Err(ConfigError::Invalid {
                name: "seconds_to_wait",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.command_retries == 0 {
            return Err(ConfigError::Invalid {
                name: "command_retries",
                message: "must be at least 1".to_string(),
            });
        }
        if self.command_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                name: "command_timeout",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.max_answers_per_command == 0 {
            return Err(ConfigError::Invalid {
                name: "max_answers_per_command",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
