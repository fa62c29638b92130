//! The remote access broker, consumed as a capability.
//!
//! The broker owns real connectivity to devices. This crate needs three
//! things from it: an interactive channel to a device, a raw duplex stream
//! to a routed backend, and an inventory query. Unknown routing keys show
//! up as backend open failures. [`SshBroker`] reaches a broker through its
//! SSH gateway; [`MemoryBroker`] is a scripted fake.

pub mod inventory;
pub mod memory;
mod ssh;

pub use inventory::{DeviceFilter, DeviceRecord, Inventory};
pub use memory::{BackendScript, DeviceScript, MemoryBroker, ScriptedChannel, ScriptedReply};
pub use ssh::{BackendStream, SshBroker};

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::channel::CommandChannel;
use crate::error::BrokerError;

/// Capability surface required from the broker.
pub trait Broker: Send + Sync + 'static {
    /// Interactive channel type handed out for devices.
    type Channel: CommandChannel + 'static;

    /// Byte stream type handed out for relay backends.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a fresh interactive channel to `device`.
    ///
    /// Fails with [`BrokerError::DeviceUnreachable`] when the device cannot
    /// be reached.
    fn open_channel(
        &self,
        device: &str,
    ) -> impl Future<Output = Result<Self::Channel, BrokerError>> + Send;

    /// List the devices whose `filter.attribute` matches `filter.pattern`.
    fn resolve_inventory(
        &self,
        filter: &DeviceFilter,
    ) -> impl Future<Output = Result<Vec<String>, BrokerError>> + Send;

    /// Open a bidirectional stream to `target`, scoped by `routing_key`.
    fn open_backend_stream(
        &self,
        target: &str,
        routing_key: &str,
    ) -> impl Future<Output = Result<Self::Stream, BrokerError>> + Send;
}
