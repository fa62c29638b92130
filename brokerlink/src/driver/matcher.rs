//! Prompt matching: answer interactive prompts until a command finishes.

use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;

use log::{debug, trace};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::attempt::{FailureReason, Transcript};
use super::params::RunParams;
use crate::channel::{CommandChannel, PatternBuffer, PromptRules};
use crate::error::ChannelError;

/// Append a newline unless the text already ends a line.
pub(crate) fn line_terminated(text: &str) -> Cow<'_, str> {
    if text.ends_with(['\r', '\n']) {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(format!("{text}\n"))
    }
}

/// Drives one command at a time through the prompt rules.
///
/// After a command is sent, newly arrived output is scanned against the
/// rules in order. A hit sends the rule's answer and consumes the matched
/// region; each rule fires at most once per scan cycle, and a new cycle
/// starts whenever more output arrives. The command is finished when no
/// rule matches and the channel's completion pattern shows up, or, for
/// channels without one, after a quiet read of `command_timeout`.
///
/// Every wait also watches the cancel token; a cancelled run ends the
/// current command with [`FailureReason::Cancelled`].
#[derive(Debug)]
pub struct PromptMatcher<'a> {
    device: &'a str,
    rules: &'a PromptRules,
    window: Duration,
    read_timeout: Duration,
    wait_between_commands: Duration,
    wait_after_answer: Duration,
    max_answers: usize,
    cancel: CancellationToken,
}

impl<'a> PromptMatcher<'a> {
    /// Create a matcher for `device` using the run's rules and timings.
    pub fn new(device: &'a str, params: &'a RunParams) -> Self {
        Self {
            device,
            rules: &params.prompt_rules,
            window: params.seconds_to_wait,
            read_timeout: params.command_timeout,
            wait_between_commands: params.wait_between_commands,
            wait_after_answer: params.wait_after_answer,
            max_answers: params.max_answers_per_command,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop waiting as soon as `cancel` fires.
    pub fn cancel_on(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn unless_cancelled<F: Future>(&self, fut: F) -> Result<F::Output, FailureReason> {
        self.cancel
            .run_until_cancelled(fut)
            .await
            .ok_or(FailureReason::Cancelled)
    }

    /// Send every command in order, stopping at the first failure.
    pub async fn run_sequence<C: CommandChannel>(
        &self,
        channel: &mut C,
        commands: &[String],
        transcript: &mut Transcript,
    ) -> Result<(), FailureReason> {
        self.drain_banner(channel).await?;
        for command in commands {
            self.run_command(channel, command, transcript).await?;
        }
        Ok(())
    }

    /// Send one command and answer its prompts until it completes.
    pub async fn run_command<C: CommandChannel>(
        &self,
        channel: &mut C,
        command: &str,
        transcript: &mut Transcript,
    ) -> Result<(), FailureReason> {
        if !channel.is_alive() {
            debug!("{}: session gone before {:?}", self.device, command);
            return Err(FailureReason::channel(ChannelError::Closed));
        }

        debug!("{}: sending {:?}", self.device, command);
        channel
            .send(&line_terminated(command))
            .await
            .map_err(FailureReason::channel)?;
        transcript.record_sent(command);

        let deadline = Instant::now() + self.window;
        if !self.wait_between_commands.is_zero() {
            self.unless_cancelled(tokio::time::sleep(self.wait_between_commands))
                .await?;
        }

        self.await_completion(channel, command, deadline, transcript)
            .await
    }

    /// Swallow the login banner up to the first prompt so it cannot be
    /// mistaken for the first command finishing.
    async fn drain_banner<C: CommandChannel>(&self, channel: &mut C) -> Result<(), FailureReason> {
        let Some(prompt) = channel.completion_pattern().cloned() else {
            return Ok(());
        };

        match self
            .unless_cancelled(channel.read_until(Some(&prompt), self.read_timeout))
            .await?
        {
            Ok(read) if read.pattern_matched => Ok(()),
            Ok(_) => {
                debug!("{}: no prompt seen before the first command", self.device);
                Ok(())
            }
            Err(e) => Err(FailureReason::channel(e)),
        }
    }

    async fn await_completion<C: CommandChannel>(
        &self,
        channel: &mut C,
        command: &str,
        deadline: Instant,
        transcript: &mut Transcript,
    ) -> Result<(), FailureReason> {
        let mut buffer = PatternBuffer::default();
        let mut fired = vec![false; self.rules.len()];
        let mut answers = 0usize;

        loop {
            if buffer.has_unconsumed() {
                if let Some(hit) = self.rules.scan(&mut buffer, &fired) {
                    fired[hit.index] = true;
                    if answers >= self.max_answers {
                        return Err(FailureReason::ExhaustedPrompts {
                            command: command.to_string(),
                            answers,
                        });
                    }

                    debug!(
                        "{}: prompt {:?} matched rule {}, answering {:?}",
                        self.device,
                        hit.matched.trim(),
                        hit.index,
                        hit.rule.display_answer()
                    );
                    let shown = hit.rule.display_answer().to_string();
                    channel
                        .send(&hit.rule.answer)
                        .await
                        .map_err(FailureReason::channel)?;
                    transcript.record_sent(shown);
                    answers += 1;

                    if !self.wait_after_answer.is_zero() {
                        self.unless_cancelled(tokio::time::sleep(self.wait_after_answer))
                            .await?;
                    }
                    continue;
                }

                if let Some(prompt) = channel.completion_pattern() {
                    if buffer.search_unconsumed(prompt).is_some() {
                        trace!("{}: back at prompt {:?}", self.device, buffer.last_line());
                        buffer.consume_all();
                        return Ok(());
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(
                    "{}: {:?} timed out, last line {:?}",
                    self.device,
                    command,
                    buffer.last_line()
                );
                return Err(FailureReason::timeout(self.window));
            }

            let read_box = self.read_timeout.min(remaining);
            match self.unless_cancelled(channel.read_chunk(read_box)).await? {
                Ok(Some(chunk)) => {
                    transcript.record_output(buffer.extend(&chunk));
                    fired.fill(false);
                }
                Ok(None) => {
                    if channel.completion_pattern().is_none() && read_box == self.read_timeout {
                        trace!("{}: quiet for {:?}, command done", self.device, read_box);
                        return Ok(());
                    }
                }
                Err(ChannelError::Closed) if answers > 0 => {
                    debug!(
                        "{}: session closed after {} answer(s) to {:?}",
                        self.device, answers, command
                    );
                    return Ok(());
                }
                Err(e) if e.is_timeout() => return Err(FailureReason::timeout(self.window)),
                Err(e) => return Err(FailureReason::channel(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, DeviceRecord, DeviceScript, MemoryBroker, ScriptedReply};
    use crate::channel::PromptRule;

    fn params(rules: Vec<PromptRule>) -> RunParams {
        RunParams::new(vec!["reload".into()], Duration::from_secs(60))
            .prompt_rules(PromptRules::new(rules))
            .pacing(Duration::ZERO, Duration::ZERO)
    }

    fn reload_device() -> DeviceScript {
        DeviceScript::responsive("r1#")
            .greeting("r1#")
            .reply(ScriptedReply::new("^reload$", "\r\nProceed with reload? [yes/no]: "))
            .reply(ScriptedReply::new("^yes$", "\r\n[confirm]"))
            .reply(ScriptedReply::new("^$", "\r\nReloading...").then_close())
    }

    #[test]
    fn test_line_terminated() {
        assert_eq!(line_terminated("show clock"), "show clock\n");
        assert_eq!(line_terminated("\r"), "\r");
        assert_eq!(line_terminated("yes\n"), "yes\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_answers_prompts_until_close() {
        let broker =
            MemoryBroker::new().device(DeviceRecord::new("r1", "10.0.0.1"), reload_device());
        let params = params(vec![
            PromptRule::new(r".*yes/no.*", "yes\r").unwrap(),
            PromptRule::new(r".*confirm.*", "\r").unwrap(),
        ]);
        let matcher = PromptMatcher::new("r1", &params);

        let mut channel = broker.open_channel("r1").await.unwrap();
        let mut transcript = Transcript::default();
        matcher
            .run_sequence(&mut channel, &params.commands, &mut transcript)
            .await
            .unwrap();

        assert_eq!(transcript.sent, vec!["reload", "yes\r", "\r"]);
        assert_eq!(broker.sent("r1"), vec!["reload\n", "yes\r", "\r"]);
        assert!(String::from_utf8_lossy(&transcript.output).contains("Reloading"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_matching_rule_wins() {
        let broker = MemoryBroker::new().device(
            DeviceRecord::new("r1", "10.0.0.1"),
            DeviceScript::responsive("r1#")
                .greeting("r1#")
                .reply(ScriptedReply::new("^erase$", "\r\nErase all? [confirm]"))
                .reply(ScriptedReply::new("^first$", "\r\nr1#")),
        );
        let params = params(vec![
            PromptRule::new(r"Erase", "first\r").unwrap(),
            PromptRule::new(r"confirm", "second\r").unwrap(),
        ]);
        let matcher = PromptMatcher::new("r1", &params);

        let mut channel = broker.open_channel("r1").await.unwrap();
        let mut transcript = Transcript::default();
        matcher
            .run_sequence(&mut channel, &["erase".to_string()], &mut transcript)
            .await
            .unwrap();

        // "Erase" consumed the region up to its match; "confirm" sits after
        // it and is still unconsumed, so it fires next in the same cycle.
        assert_eq!(transcript.sent[1], "first\r");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rule_fires_once_per_cycle() {
        let broker = MemoryBroker::new().device(
            DeviceRecord::new("r1", "10.0.0.1"),
            DeviceScript::silent()
                .greeting("r1#")
                .reply(ScriptedReply::new("^copy$", "\r\nOverwrite? [y/n] Overwrite? [y/n] ")),
        );
        let mut params = params(vec![PromptRule::new(r"Overwrite\?", "y\r").unwrap()])
            .command_timeout(Duration::from_secs(5));
        params.seconds_to_wait = Duration::from_secs(20);
        let matcher = PromptMatcher::new("r1", &params);

        let mut channel = broker.open_channel("r1").await.unwrap();
        let mut transcript = Transcript::default();
        let result = matcher
            .run_sequence(&mut channel, &["copy".to_string()], &mut transcript)
            .await;

        assert!(matches!(result, Err(FailureReason::Timeout { .. })));
        assert_eq!(broker.sent("r1"), vec!["copy\n", "y\r"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_exactly_at_window() {
        let broker = MemoryBroker::new().device(
            DeviceRecord::new("r1", "10.0.0.1"),
            DeviceScript::silent().greeting("r1#"),
        );
        let params = params(vec![PromptRule::new(r"never", "x").unwrap()]);
        let matcher = PromptMatcher::new("r1", &params);

        let mut channel = broker.open_channel("r1").await.unwrap();
        let mut transcript = Transcript::default();
        let started = Instant::now();
        let result = matcher
            .run_sequence(&mut channel, &params.commands, &mut transcript)
            .await;

        assert_eq!(result, Err(FailureReason::timeout(Duration::from_secs(60))));
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_write_is_channel_failure() {
        let broker = MemoryBroker::new().device(
            DeviceRecord::new("r1", "10.0.0.1"),
            DeviceScript::silent()
                .greeting("r1#\r\nProceed? [confirm]")
                .refuse_writes(),
        );
        let params = params(vec![PromptRule::new(r"confirm", "\r").unwrap()]);
        let matcher = PromptMatcher::new("r1", &params);

        let mut channel = broker.open_channel("r1").await.unwrap();
        let mut transcript = Transcript::default();
        let result = matcher.run_command(&mut channel, "reload", &mut transcript).await;
        assert!(matches!(result, Err(FailureReason::Channel { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_without_answer_is_channel_failure() {
        let broker = MemoryBroker::new().device(
            DeviceRecord::new("r1", "10.0.0.1"),
            DeviceScript::silent()
                .greeting("r1#")
                .reply(ScriptedReply::new("^exit$", "").then_close()),
        );
        let params = params(vec![]);
        let matcher = PromptMatcher::new("r1", &params);

        let mut channel = broker.open_channel("r1").await.unwrap();
        let mut transcript = Transcript::default();
        let result = matcher
            .run_sequence(&mut channel, &["exit".to_string()], &mut transcript)
            .await;
        assert_eq!(result, Err(FailureReason::channel(ChannelError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_cap() {
        let broker = MemoryBroker::new().device(
            DeviceRecord::new("r1", "10.0.0.1"),
            DeviceScript::silent()
                .greeting("r1#")
                .reply(ScriptedReply::new(".*", "\r\nAre you sure? ")),
        );
        let params = params(vec![PromptRule::new(r"sure\?", "y\r").unwrap()])
            .max_answers_per_command(3);
        let matcher = PromptMatcher::new("r1", &params);

        let mut channel = broker.open_channel("r1").await.unwrap();
        let mut transcript = Transcript::default();
        let result = matcher
            .run_sequence(&mut channel, &["delete".to_string()], &mut transcript)
            .await;

        assert_eq!(
            result,
            Err(FailureReason::ExhaustedPrompts {
                command: "delete".into(),
                answers: 3
            })
        );
        assert_eq!(broker.sent("r1").len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prompt_behind_split_escape_completes() {
        let broker = MemoryBroker::new().device(
            DeviceRecord::new("r1", "10.0.0.1"),
            DeviceScript::silent().greeting("r1#").reply(
                ScriptedReply::new("^show clock$", "\r\n12:00 UTC\r\nr1#\x1b[").chunk("0m "),
            ),
        );
        let params = params(vec![]);
        let matcher = PromptMatcher::new("r1", &params);

        let mut channel = broker.open_channel("r1").await.unwrap();
        let mut transcript = Transcript::default();
        let started = Instant::now();
        matcher
            .run_sequence(&mut channel, &["show clock".to_string()], &mut transcript)
            .await
            .unwrap();

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(transcript.output, b"\r\n12:00 UTC\r\nr1#");
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_after_session_closed_is_not_sent() {
        let broker =
            MemoryBroker::new().device(DeviceRecord::new("r1", "10.0.0.1"), reload_device());
        let params = params(vec![
            PromptRule::new(r".*yes/no.*", "yes\r").unwrap(),
            PromptRule::new(r".*confirm.*", "\r").unwrap(),
        ]);
        let matcher = PromptMatcher::new("r1", &params);

        let mut channel = broker.open_channel("r1").await.unwrap();
        let mut transcript = Transcript::default();
        let commands = vec!["reload".to_string(), "show clock".to_string()];
        let result = matcher
            .run_sequence(&mut channel, &commands, &mut transcript)
            .await;

        assert_eq!(result, Err(FailureReason::channel(ChannelError::Closed)));
        assert_eq!(broker.sent("r1"), vec!["reload\n", "yes\r", "\r"]);
        assert_eq!(transcript.sent, vec!["reload", "yes\r", "\r"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let broker = MemoryBroker::new().device(
            DeviceRecord::new("r1", "10.0.0.1"),
            DeviceScript::silent().greeting("r1#"),
        );
        let params = params(vec![]);
        let cancel = CancellationToken::new();
        let matcher = PromptMatcher::new("r1", &params).cancel_on(cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let mut channel = broker.open_channel("r1").await.unwrap();
        let mut transcript = Transcript::default();
        let started = Instant::now();
        let result = matcher
            .run_sequence(&mut channel, &params.commands, &mut transcript)
            .await;

        assert_eq!(result, Err(FailureReason::Cancelled));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_period_completes_without_prompt_pattern() {
        let broker = MemoryBroker::new().device(
            DeviceRecord::new("r1", "10.0.0.1"),
            DeviceScript::silent()
                .prompt(None)
                .reply(ScriptedReply::new("^show clock$", "12:00:00 UTC\r\n")),
        );
        let params = params(vec![]).command_timeout(Duration::from_secs(2));
        let matcher = PromptMatcher::new("r1", &params);

        let mut channel = broker.open_channel("r1").await.unwrap();
        let mut transcript = Transcript::default();
        let started = Instant::now();
        matcher
            .run_sequence(&mut channel, &["show clock".to_string()], &mut transcript)
            .await
            .unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(transcript.output, b"12:00:00 UTC\r\n");
    }
}
