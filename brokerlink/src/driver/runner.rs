//! Drives one device from the first command to recovery.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::attempt::{CANCELLED_DETAIL, ExecutionAttempt, FailureReason, Transcript};
use super::matcher::PromptMatcher;
use super::outcome::{DeviceOutcome, DeviceStatus};
use super::params::RunParams;
use super::recovery::{ProbeReport, RecoveryProbe};
use super::state::{RunEvent, RunFailure, RunState};
use crate::broker::Broker;
use crate::channel::CommandChannel;
use crate::error::DriverError;

/// Runs the command list against one device, retries channel-level
/// failures, waits for the device to settle and probes it until it
/// answers again.
///
/// The runner holds no state between calls; everything about a run ends
/// up in the returned [`DeviceOutcome`]. Once the token given to
/// [`cancel_on`](Self::cancel_on) fires, the runner stops at its next wait,
/// closes whatever channel it holds and reports the device as cancelled.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use brokerlink::broker::MemoryBroker;
/// use brokerlink::driver::{DeviceRunner, RunParams};
///
/// # async fn example(broker: MemoryBroker) {
/// let params = RunParams::new(vec!["reload".into()], Duration::from_secs(300));
/// let outcome = DeviceRunner::new(&broker, &params).run("core-rtr-1").await;
/// println!("{}: {}", outcome.device_name, outcome.status);
/// # }
/// ```
#[derive(Debug)]
pub struct DeviceRunner<'a, B> {
    broker: &'a B,
    params: &'a RunParams,
    cancel: CancellationToken,
}

impl<'a, B: Broker> DeviceRunner<'a, B> {
    /// Create a runner over `broker` with the run's parameters.
    pub fn new(broker: &'a B, params: &'a RunParams) -> Self {
        Self {
            broker,
            params,
            cancel: CancellationToken::new(),
        }
    }

    /// Abandon the run when `cancel` fires.
    pub fn cancel_on(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn pause(&self, duration: Duration) {
        self.cancel
            .run_until_cancelled(tokio::time::sleep(duration))
            .await;
    }

    /// Run `device` to completion.
    pub async fn run(&self, device: &str) -> DeviceOutcome {
        let max_attempts = self.params.command_retries.max(1);
        let mut state = RunState::start();
        let mut attempts: Vec<ExecutionAttempt> = Vec::new();
        let mut probe: Option<ProbeReport> = None;

        info!(
            "{}: running {} command(s), up to {} attempt(s)",
            device,
            self.params.commands.len(),
            max_attempts
        );

        loop {
            let event = match &state {
                RunState::Attempting { attempt } => {
                    if *attempt > 1 {
                        self.pause(self.params.retry_pause).await;
                    }
                    let record = self.attempt(device, *attempt).await;
                    if let Some(reason) = &record.failure {
                        warn!(
                            "{}: attempt {}/{} failed: {}",
                            device, attempt, max_attempts, reason
                        );
                    }
                    let failure = record.failure.clone();
                    attempts.push(record);
                    RunEvent::AttemptFinished { failure }
                }
                RunState::Settling => {
                    debug!(
                        "{}: settling for {:?} before probing",
                        device, self.params.delay_before_check
                    );
                    self.pause(self.params.delay_before_check).await;
                    RunEvent::Settled
                }
                RunState::Probing => {
                    let deadline = Instant::now() + self.params.seconds_to_wait;
                    let report = RecoveryProbe::new(
                        self.broker,
                        self.params.probe_interval,
                        self.params.command_timeout,
                    )
                    .cancel_on(self.cancel.clone())
                    .probe(device, &self.params.recovery_test_command, deadline)
                    .await;
                    probe = Some(report);
                    RunEvent::ProbeFinished {
                        succeeded: report.succeeded,
                    }
                }
                RunState::Done | RunState::Failed(_) => break,
            };
            let event = if self.cancel.is_cancelled() {
                debug!("{}: cancelled in state {:?}", device, state);
                RunEvent::Cancelled
            } else {
                event
            };
            state = state.advance(event, max_attempts);
        }

        self.outcome(device, state, attempts, probe)
    }

    async fn attempt(&self, device: &str, index: u32) -> ExecutionAttempt {
        let started = Instant::now();
        let mut transcript = Transcript::default();

        let opened = self
            .cancel
            .run_until_cancelled(self.broker.open_channel(device))
            .await;
        let failure = match opened {
            None => Some(FailureReason::Cancelled),
            Some(Ok(mut channel)) => {
                let result = PromptMatcher::new(device, self.params)
                    .cancel_on(self.cancel.clone())
                    .run_sequence(&mut channel, &self.params.commands, &mut transcript)
                    .await;
                if let Err(e) = channel.close().await {
                    debug!("{}: closing command channel: {}", device, e);
                }
                result.err()
            }
            Some(Err(e)) => Some(FailureReason::channel(e)),
        };

        ExecutionAttempt::finish(index, transcript, failure, started.elapsed())
    }

    fn outcome(
        &self,
        device: &str,
        state: RunState,
        attempts: Vec<ExecutionAttempt>,
        probe: Option<ProbeReport>,
    ) -> DeviceOutcome {
        let probe = probe.unwrap_or(ProbeReport {
            succeeded: false,
            elapsed: Default::default(),
            attempts: 0,
        });

        let (status, error) = match state {
            RunState::Done => (DeviceStatus::Success, None),
            RunState::Failed(RunFailure::Commands {
                attempts: made,
                reason,
            }) => {
                let error = DriverError::CommandsFailed {
                    attempts: made,
                    message: reason.to_string(),
                };
                (DeviceStatus::Failed, Some(error.to_string()))
            }
            RunState::Failed(RunFailure::Recovery) => {
                let error = DriverError::RecoveryTimeout {
                    device: device.to_string(),
                    seconds: self.params.seconds_to_wait.as_secs(),
                    attempts: probe.attempts,
                };
                (DeviceStatus::Failed, Some(error.to_string()))
            }
            RunState::Failed(RunFailure::Cancelled) => {
                (DeviceStatus::Failed, Some(CANCELLED_DETAIL.to_string()))
            }
            other => (
                DeviceStatus::Failed,
                Some(format!("run stopped in state {other:?}")),
            ),
        };

        match &error {
            None => info!("{}: SUCCESS", device),
            Some(detail) => warn!("{}: FAILED: {}", device, detail),
        }

        let (executed_commands, stdout) = attempts
            .last()
            .map(|last| (last.executed_commands.clone(), last.output.clone()))
            .unwrap_or_default();

        DeviceOutcome {
            device_name: device.to_string(),
            executed_commands,
            stdout,
            status,
            recovery_time: probe.elapsed.as_secs_f64(),
            attempt_count: u32::try_from(attempts.len()).unwrap_or(u32::MAX).max(1),
            recovery_attempts: probe.attempts,
            changed: status == DeviceStatus::Success,
            error,
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{DeviceRecord, DeviceScript, MemoryBroker, ScriptedReply};
    use crate::channel::{PromptRule, PromptRules};

    fn reload_rules() -> PromptRules {
        PromptRules::new(vec![
            PromptRule::new(r".*yes/no.*", "yes\r").unwrap(),
            PromptRule::new(r".*confirm.*", "\r").unwrap(),
        ])
    }

    fn reloading_device() -> DeviceScript {
        DeviceScript::responsive("r1#")
            .greeting("r1#")
            .reply(ScriptedReply::new("^reload$", "\r\nSave? [yes/no]: "))
            .reply(ScriptedReply::new("^yes$", "\r\nProceed with reload? [confirm]"))
            .reply(ScriptedReply::new("^$", "\r\n").then_close())
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_scenario_recovers() {
        let broker = MemoryBroker::new().device(
            DeviceRecord::new("r1", "10.0.0.1"),
            reloading_device().unreachable_on(2..=10),
        );
        let params = RunParams::new(vec!["reload".into()], Duration::from_secs(300))
            .prompt_rules(reload_rules())
            .delay_before_check(Duration::from_secs(10))
            .recovery_test_command("show clock");

        let outcome = DeviceRunner::new(&broker, &params).run("r1").await;

        assert_eq!(outcome.status, DeviceStatus::Success, "{:?}", outcome.error);
        assert_eq!(outcome.attempt_count, 1);
        assert_eq!(outcome.executed_commands, vec!["reload", "yes\r", "\r"]);
        assert_eq!(outcome.recovery_attempts, 10);
        assert_eq!(outcome.recovery_time, 18.0);
        assert!(outcome.changed);
        assert!(outcome.error.is_none());
        // The command channel and the probe channel that answered.
        assert_eq!(broker.closes("r1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_command_closes_channel() {
        let broker = MemoryBroker::new().device(
            DeviceRecord::new("r1", "10.0.0.1"),
            DeviceScript::silent().greeting("r1#"),
        );
        let params = RunParams::new(vec!["reload".into()], Duration::from_secs(300))
            .prompt_rules(reload_rules())
            .command_retries(3);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = DeviceRunner::new(&broker, &params)
            .cancel_on(cancel)
            .run("r1")
            .await;

        assert_eq!(started.elapsed(), Duration::from_secs(7));
        assert_eq!(outcome.status, DeviceStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some(CANCELLED_DETAIL));
        assert_eq!(outcome.attempt_count, 1);
        assert_eq!(outcome.attempts[0].failure, Some(FailureReason::Cancelled));
        assert_eq!(broker.opens("r1"), 1);
        assert_eq!(broker.closes("r1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_recovery_opens_no_more_channels() {
        let broker = MemoryBroker::new().device(
            DeviceRecord::new("r1", "10.0.0.1"),
            reloading_device().unreachable_on(2..=u32::MAX),
        );
        let params = RunParams::new(vec!["reload".into()], Duration::from_secs(300))
            .prompt_rules(reload_rules())
            .pacing(Duration::ZERO, Duration::ZERO);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(21)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = DeviceRunner::new(&broker, &params)
            .cancel_on(cancel)
            .run("r1")
            .await;

        // One command channel, then probes at 10, 12, ..., 20 seconds.
        assert_eq!(started.elapsed(), Duration::from_secs(21));
        assert_eq!(broker.opens("r1"), 7);
        assert_eq!(outcome.error.as_deref(), Some(CANCELLED_DETAIL));
        assert_eq!(outcome.recovery_attempts, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_exactly_seconds_to_wait() {
        let broker = MemoryBroker::new().device(
            DeviceRecord::new("r1", "10.0.0.1"),
            DeviceScript::silent().greeting("r1#"),
        );
        let params = RunParams::new(vec!["reload".into()], Duration::from_secs(45))
            .prompt_rules(reload_rules());

        let started = Instant::now();
        let outcome = DeviceRunner::new(&broker, &params).run("r1").await;

        assert_eq!(started.elapsed(), Duration::from_secs(45));
        assert_eq!(outcome.status, DeviceStatus::Failed);
        assert_eq!(outcome.attempt_count, 1);
        assert_eq!(
            outcome.attempts[0].failure,
            Some(FailureReason::timeout(Duration::from_secs(45)))
        );
        assert!(outcome.error.unwrap().contains("no prompt matched"));
        assert_eq!(broker.opens("r1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_last_allowed_attempt() {
        for retries in 1..=4u32 {
            let mut script = DeviceScript::responsive("r1#").greeting("r1#");
            if retries > 1 {
                script = script.unreachable_on(1..=retries - 1);
            }
            let broker =
                MemoryBroker::new().device(DeviceRecord::new("r1", "10.0.0.1"), script);
            let params = RunParams::new(vec!["show clock".into()], Duration::from_secs(30))
                .command_retries(retries)
                .delay_before_check(Duration::ZERO);

            let outcome = DeviceRunner::new(&broker, &params).run("r1").await;

            assert_eq!(outcome.status, DeviceStatus::Success);
            assert_eq!(outcome.attempt_count, retries);
            assert_eq!(outcome.attempts.len(), retries as usize);
            assert!(outcome.attempts[..retries as usize - 1]
                .iter()
                .all(|a| matches!(a.failure, Some(FailureReason::Channel { .. }))));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_once_retries_are_exhausted() {
        let broker = MemoryBroker::new().device(
            DeviceRecord::new("r1", "10.0.0.1"),
            DeviceScript::responsive("r1#").always_unreachable(),
        );
        let params = RunParams::new(vec!["show clock".into()], Duration::from_secs(30))
            .command_retries(3);

        let started = Instant::now();
        let outcome = DeviceRunner::new(&broker, &params).run("r1").await;

        assert_eq!(outcome.status, DeviceStatus::Failed);
        assert_eq!(outcome.attempt_count, 3);
        assert_eq!(outcome.recovery_attempts, 0);
        assert!(
            outcome
                .error
                .as_deref()
                .unwrap()
                .starts_with("commands failed after 3 attempt(s)")
        );
        // Two pauses between three attempts, none after the last.
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_deadline() {
        let broker = MemoryBroker::new().device(
            DeviceRecord::new("r1", "10.0.0.1"),
            reloading_device().unreachable_on(2..=u32::MAX),
        );
        let params = RunParams::new(vec!["reload".into()], Duration::from_secs(60))
            .prompt_rules(reload_rules());

        let outcome = DeviceRunner::new(&broker, &params).run("r1").await;

        assert_eq!(outcome.status, DeviceStatus::Failed);
        assert_eq!(outcome.recovery_time, 60.0);
        assert!(
            outcome
                .error
                .unwrap()
                .contains("did not recover within 60s")
        );
    }
}
