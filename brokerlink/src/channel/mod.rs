//! Channel layer: the interactive session capability and prompt matching.
//!
//! A [`CommandChannel`] is one device's interactive session as handed out
//! by the broker. The core only ever sends text, reads chunks and closes;
//! the concrete session lives in the broker adapter.

mod buffer;
mod patterns;
mod ssh;

pub use buffer::{AnsiStripper, PatternBuffer, normalize_output};
pub use patterns::{
    DEFAULT_PROMPT_PATTERN, PromptRule, PromptRules, RuleMatch, compile_prompt_pattern,
};
pub use ssh::SshChannel;

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use regex::bytes::Regex;
use tokio::time::Instant;

use crate::error::ChannelError;

/// One device's interactive session.
pub trait CommandChannel: Send {
    /// Write raw text to the session.
    fn send(&mut self, text: &str) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Wait up to `timeout` for the next chunk of output.
    ///
    /// Returns `Ok(None)` when nothing arrived in time and
    /// `Err(ChannelError::Closed)` once the remote end has closed.
    fn read_chunk(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<Bytes>, ChannelError>> + Send;

    /// Close the session.
    fn close(&mut self) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Whether the session still looks usable. Commands are not sent on
    /// a session that is no longer alive.
    fn is_alive(&self) -> bool;

    /// Pattern signalling the device is back at an idle prompt, if the
    /// channel can recognize one.
    fn completion_pattern(&self) -> Option<&Regex> {
        None
    }

    /// Read until `pattern` shows up in the output or `timeout` elapses.
    ///
    /// With no pattern this simply collects everything that arrives within
    /// the timeout.
    fn read_until(
        &mut self,
        pattern: Option<&Regex>,
        timeout: Duration,
    ) -> impl Future<Output = Result<ReadResult, ChannelError>> + Send {
        async move {
            let deadline = Instant::now() + timeout;
            let mut stripper = AnsiStripper::new();
            let mut data = Vec::new();

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(ReadResult {
                        data,
                        pattern_matched: false,
                    });
                }

                if let Some(chunk) = self.read_chunk(remaining).await? {
                    stripper.push(&chunk, &mut data);
                    if pattern.is_some_and(|p| p.is_match(&data)) {
                        return Ok(ReadResult {
                            data,
                            pattern_matched: true,
                        });
                    }
                }
            }
        }
    }
}

/// Result of a read operation.
#[derive(Debug)]
pub struct ReadResult {
    /// The data that was read.
    pub data: Vec<u8>,

    /// Whether the pattern was matched.
    pub pattern_matched: bool,
}

impl ReadResult {
    /// Get the data as a string (lossy UTF-8).
    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}
