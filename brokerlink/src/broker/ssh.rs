//! Broker adapter that reaches devices through the broker's SSH gateway.
//!
//! The gateway addresses a device by the login name
//! `<device>@<routing-key>`, the same composite identity the session relay
//! accepts from its own clients.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use log::{debug, info};
use regex::bytes::Regex;
use russh::ChannelStream;
use russh::client::Msg;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::Broker;
use super::inventory::{DeviceFilter, Inventory};
use crate::channel::SshChannel;
use crate::error::{BrokerError, TransportError};
use crate::relay::RouteIdentity;
use crate::transport::{SshConfig, SshTransport};

/// Production broker adapter.
pub struct SshBroker {
    /// Connection settings for the gateway; the username is replaced per
    /// device.
    gateway: SshConfig,

    /// Routing key (service serial) used for device channels.
    routing_key: String,

    /// Prompt pattern that tells a device is idle.
    prompt_pattern: Regex,

    /// Devices the broker is known to serve.
    inventory: Inventory,
}

impl SshBroker {
    /// Create an adapter for the given gateway.
    pub fn new(
        gateway: SshConfig,
        routing_key: impl Into<String>,
        prompt_pattern: Regex,
        inventory: Inventory,
    ) -> Self {
        Self {
            gateway,
            routing_key: routing_key.into(),
            prompt_pattern,
            inventory,
        }
    }

    async fn connect(&self, identity: &RouteIdentity) -> Result<SshTransport, TransportError> {
        SshTransport::connect(self.gateway.for_user(identity.to_string())).await
    }
}

fn unreachable(device: &str, error: impl ToString) -> BrokerError {
    BrokerError::DeviceUnreachable {
        device: device.to_string(),
        reason: error.to_string(),
    }
}

impl Broker for SshBroker {
    type Channel = SshChannel;
    type Stream = BackendStream;

    async fn open_channel(&self, device: &str) -> Result<SshChannel, BrokerError> {
        let identity = RouteIdentity::new(device, &self.routing_key);
        let transport = self
            .connect(&identity)
            .await
            .map_err(|e| unreachable(device, e))?;
        let channel = transport
            .open_shell()
            .await
            .map_err(|e| unreachable(device, e))?;

        debug!("opened shell to {} through {}", device, self.gateway.host);
        Ok(SshChannel::new(
            device,
            transport,
            channel,
            self.prompt_pattern.clone(),
        ))
    }

    async fn resolve_inventory(&self, filter: &DeviceFilter) -> Result<Vec<String>, BrokerError> {
        let devices = self.inventory.select(filter);
        info!("inventory filter {} selected {} device(s)", filter, devices.len());
        Ok(devices)
    }

    async fn open_backend_stream(
        &self,
        target: &str,
        routing_key: &str,
    ) -> Result<BackendStream, BrokerError> {
        if !self.inventory.is_empty() && self.inventory.get(target).is_none() {
            return Err(BrokerError::UnknownTarget {
                target: target.to_string(),
                routing_key: routing_key.to_string(),
            });
        }

        let identity = RouteIdentity::new(target, routing_key);
        let transport = match self.connect(&identity).await {
            Ok(transport) => transport,
            Err(TransportError::AuthenticationFailed { .. }) => {
                return Err(BrokerError::UnknownTarget {
                    target: target.to_string(),
                    routing_key: routing_key.to_string(),
                });
            }
            Err(e) => return Err(unreachable(target, e)),
        };
        let channel = transport
            .open_shell()
            .await
            .map_err(|e| unreachable(target, e))?;

        Ok(BackendStream {
            stream: Box::pin(channel.into_stream()),
            _transport: transport,
        })
    }
}

/// Duplex byte stream to a routed backend.
///
/// Keeps the SSH connection alive for as long as the stream exists.
pub struct BackendStream {
    stream: Pin<Box<ChannelStream<Msg>>>,
    _transport: SshTransport,
}

impl AsyncRead for BackendStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.stream.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.stream.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stream.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stream.as_mut().poll_shutdown(cx)
    }
}
