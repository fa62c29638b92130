//! Error types for brokerlink.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Main error type for brokerlink operations.
#[derive(Error, Debug)]
pub enum Error {
    /// SSH transport-level errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Channel operation errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Broker capability errors
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Device run errors
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// Session relay errors
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Configuration errors, fatal before any work starts
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors talking to the broker's SSH gateway.
#[derive(Error, Debug)]
pub enum TransportError {
    /// russh protocol or handshake failure
    #[error("ssh: {0}")]
    Ssh(#[from] russh::Error),

    /// Gateway refused the login
    #[error("gateway refused login '{user}'")]
    AuthenticationFailed { user: String },

    /// Client key could not be loaded
    #[error("client key: {0}")]
    Key(String),

    /// Host key did not match the known_hosts entry
    #[error("Host key for {host}:{port} changed (known_hosts line {line})")]
    HostKeyChanged { host: String, port: u16, line: usize },

    /// Host is not in known_hosts and strict checking is on
    #[error("Host key for {host}:{port} is unknown")]
    HostKeyUnknown { host: String, port: u16 },

    /// known_hosts could not be read or written
    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    /// Connect or login took longer than the configured timeout
    #[error("gateway did not answer within {0:?}")]
    Timeout(Duration),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Channel layer errors (reads, writes, pattern waits).
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Nothing matched and nothing completed within the window
    #[error("no prompt or output within {0:?}")]
    Timeout(Duration),

    /// Channel closed by the remote end
    #[error("channel closed by device")]
    Closed,

    /// Write rejected by the channel
    #[error("Write failed: {0}")]
    WriteFailed(String),
}

impl ChannelError {
    /// Whether this is the "nothing arrived in time" case rather than a
    /// transport failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ChannelError::Timeout(_))
    }
}

/// Errors surfaced by the remote access broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The broker could not reach the device
    #[error("Device '{device}' is unreachable: {reason}")]
    DeviceUnreachable { device: String, reason: String },

    /// The broker does not know the target
    #[error("Unknown target '{target}' for routing key '{routing_key}'")]
    UnknownTarget { target: String, routing_key: String },
}

/// Device run errors (command sequences, recovery).
#[derive(Error, Debug)]
pub enum DriverError {
    /// Every command attempt failed
    #[error("commands failed after {attempts} attempt(s): {message}")]
    CommandsFailed { attempts: u32, message: String },

    /// The recovery probe never got a response
    #[error("device {device} did not recover within {seconds}s ({attempts} probe attempt(s))")]
    RecoveryTimeout {
        device: String,
        seconds: u64,
        attempts: u32,
    },
}

/// Session relay errors; each one is terminal for a single session only.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Shared proxy password did not match
    #[error("authentication failed for '{user}'")]
    Authentication { user: String },

    /// Presented identity is not `<target>@<routing-key>`
    #[error("invalid identity '{identity}': expected <target>@<routing-key>")]
    InvalidIdentity { identity: String },

    /// The broker could not map the identity to a backend
    #[error("cannot route '{target}@{routing_key}': {reason}")]
    RouteResolution {
        target: String,
        routing_key: String,
        reason: String,
    },

    /// I/O error on the listener or a session stream
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required parameter is missing
    #[error("missing required parameter: {0}")]
    Missing(&'static str),

    /// A parameter has an invalid value
    #[error("invalid value for {name}: {message}")]
    Invalid { name: &'static str, message: String },

    /// Prompt and answer lists differ in length
    #[error("number of prompts ({prompts}) must match number of answers ({answers})")]
    PromptAnswerMismatch { prompts: usize, answers: usize },

    /// No device matched the selector
    #[error("no devices found in inventory matching {0}")]
    NoDevices(String),

    /// Inventory or key file could not be loaded
    #[error("failed to load {path}: {message}")]
    Load { path: String, message: String },
}

/// Result type alias using brokerlink's Error.
pub type Result<T> = std::result::Result<T, Error>;
