//! Command channel over an SSH PTY shell.

use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace};
use regex::bytes::Regex;
use russh::ChannelMsg;
use russh::client::Msg;

use super::CommandChannel;
use crate::error::ChannelError;
use crate::transport::SshTransport;

/// Interactive device session on a PTY shell opened through the gateway.
///
/// The channel owns its transport, so dropping it tears the whole SSH
/// connection down.
pub struct SshChannel {
    channel: russh::Channel<Msg>,
    transport: Option<SshTransport>,
    prompt_pattern: Regex,
    label: String,
    open: bool,
}

impl SshChannel {
    /// Wrap an opened PTY shell channel.
    pub fn new(
        label: impl Into<String>,
        transport: SshTransport,
        channel: russh::Channel<Msg>,
        prompt_pattern: Regex,
    ) -> Self {
        Self {
            channel,
            transport: Some(transport),
            prompt_pattern,
            label: label.into(),
            open: true,
        }
    }
}

impl CommandChannel for SshChannel {
    async fn send(&mut self, text: &str) -> Result<(), ChannelError> {
        if !self.open {
            return Err(ChannelError::Closed);
        }
        trace!("{}: send {:?}", self.label, text);
        self.channel
            .data(text.as_bytes())
            .await
            .map_err(|e| ChannelError::WriteFailed(e.to_string()))
    }

    async fn read_chunk(&mut self, timeout: Duration) -> Result<Option<Bytes>, ChannelError> {
        if !self.open {
            return Err(ChannelError::Closed);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let msg = match tokio::time::timeout_at(deadline, self.channel.wait()).await {
                Ok(msg) => msg,
                Err(_) => return Ok(None),
            };

            match msg {
                Some(ChannelMsg::Data { ref data }) | Some(ChannelMsg::ExtendedData { ref data, .. }) => {
                    trace!("{}: received {} bytes", self.label, data.len());
                    return Ok(Some(Bytes::copy_from_slice(data)));
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    debug!("{}: channel closed by remote", self.label);
                    self.open = false;
                    return Err(ChannelError::Closed);
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("{}: remote shell exited with {}", self.label, exit_status);
                }
                Some(_) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        if self.open {
            self.open = false;
            // The peer may already be gone; a failed EOF is not interesting.
            let _ = self.channel.eof().await;
            let _ = self.channel.close().await;
        }
        if let Some(transport) = self.transport.take() {
            transport
                .close()
                .await
                .map_err(|e| ChannelError::WriteFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.open
            && self
                .transport
                .as_ref()
                .is_some_and(|transport| !transport.is_closed())
    }

    fn completion_pattern(&self) -> Option<&Regex> {
        Some(&self.prompt_pattern)
    }
}
