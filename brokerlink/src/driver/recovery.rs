//! Recovery probing after a disruptive command sequence.

use std::time::Duration;

use log::{debug, info};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::matcher::line_terminated;
use crate::broker::Broker;
use crate::channel::CommandChannel;

/// How often a still-waiting probe reports progress.
const PROGRESS_EVERY: Duration = Duration::from_secs(30);

/// Outcome of a probe run. Always data, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProbeReport {
    /// Whether the device answered before the deadline.
    pub succeeded: bool,

    /// Time from the first probe to the answer (or to giving up).
    pub elapsed: Duration,

    /// Number of probe attempts made.
    pub attempts: u32,
}

/// Polls a device with a cheap command until it answers again.
///
/// Every attempt opens a fresh channel, since whatever session existed
/// before the disruptive command is assumed dead. Refusals and silence
/// count as failed attempts and are retried after `interval`. A cancelled
/// probe closes the channel it is using and reports failure.
#[derive(Debug)]
pub struct RecoveryProbe<'a, B> {
    broker: &'a B,
    interval: Duration,
    read_timeout: Duration,
    cancel: CancellationToken,
}

impl<'a, B: Broker> RecoveryProbe<'a, B> {
    /// Create a probe with the given backoff and per-read time box.
    pub fn new(broker: &'a B, interval: Duration, read_timeout: Duration) -> Self {
        Self {
            broker,
            interval,
            read_timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Give up as soon as `cancel` fires.
    pub fn cancel_on(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Probe `device` with `test_command` until it answers or `deadline`
    /// passes. At least one attempt is always made.
    pub async fn probe(&self, device: &str, test_command: &str, deadline: Instant) -> ProbeReport {
        let started = Instant::now();
        let mut next_progress = started + PROGRESS_EVERY;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let answered =
                tokio::time::timeout_at(deadline, self.attempt(device, test_command, deadline))
                    .await
                    .unwrap_or(false);

            if answered {
                let elapsed = started.elapsed();
                info!(
                    "{}: recovered after {:.1}s ({} probe attempt(s))",
                    device,
                    elapsed.as_secs_f64(),
                    attempts
                );
                return ProbeReport {
                    succeeded: true,
                    elapsed,
                    attempts,
                };
            }

            let now = Instant::now();
            if now >= deadline || self.cancel.is_cancelled() {
                return ProbeReport {
                    succeeded: false,
                    elapsed: started.elapsed(),
                    attempts,
                };
            }
            if now >= next_progress {
                info!(
                    "{}: still waiting for recovery, {:.0}s elapsed, {} attempt(s)",
                    device,
                    (now - started).as_secs_f64(),
                    attempts
                );
                next_progress += PROGRESS_EVERY;
            }

            let backoff = tokio::time::sleep_until((now + self.interval).min(deadline));
            if self.cancel.run_until_cancelled(backoff).await.is_none() {
                debug!("{}: probe cancelled after {} attempt(s)", device, attempts);
                return ProbeReport {
                    succeeded: false,
                    elapsed: started.elapsed(),
                    attempts,
                };
            }
        }
    }

    async fn attempt(&self, device: &str, test_command: &str, deadline: Instant) -> bool {
        let opened = self
            .cancel
            .run_until_cancelled(self.broker.open_channel(device))
            .await;
        let mut channel = match opened {
            None => return false,
            Some(Ok(channel)) => channel,
            Some(Err(e)) => {
                debug!("{}: probe could not open a channel: {}", device, e);
                return false;
            }
        };

        let read_box = self
            .read_timeout
            .min(deadline.saturating_duration_since(Instant::now()));
        let prompt = channel.completion_pattern().cloned();

        let exchange = async {
            channel.send(&line_terminated(test_command)).await.map_err(|e| {
                debug!("{}: probe write failed: {}", device, e);
            })?;
            channel
                .read_until(prompt.as_ref(), read_box)
                .await
                .map(|read| !read.data.is_empty())
                .map_err(|e| debug!("{}: probe read failed: {}", device, e))
        };
        let answered = matches!(
            self.cancel.run_until_cancelled(exchange).await,
            Some(Ok(true))
        );

        if let Err(e) = channel.close().await {
            debug!("{}: closing probe channel: {}", device, e);
        }
        answered
    }
}
