//! SSH transport layer wrapping russh.
//!
//! This module provides the low-level SSH connection management used to
//! reach devices through the broker's gateway: connection setup,
//! authentication, and PTY shell creation.

pub mod config;
mod ssh;

pub use config::{AuthMethod, HostKeyVerification, PtySize, SshConfig};
pub use ssh::SshTransport;
