//! Connection settings for the broker's SSH gateway.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

/// How the gateway's host key is checked, after OpenSSH's
/// `StrictHostKeyChecking`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum HostKeyVerification {
    /// Only keys already in known_hosts are accepted.
    Strict,

    /// Unknown keys are learned, changed keys are refused.
    #[default]
    AcceptNew,

    /// Any key is accepted. Lab use only.
    Disabled,
}

/// Terminal geometry requested for PTY shells.
///
/// Wide by default so devices do not wrap long output lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub columns: u32,
    pub rows: u32,
}

impl Default for PtySize {
    fn default() -> Self {
        Self {
            columns: 511,
            rows: 24,
        }
    }
}

/// How to log into the gateway.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// The `none` method; the gateway decides from the login name alone.
    None,

    /// Password authentication.
    Password(SecretString),

    /// Public key authentication with a key file.
    PrivateKey {
        path: PathBuf,
        passphrase: Option<SecretString>,
    },
}

impl AuthMethod {
    /// Short name for logs; never includes secrets.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PrivateKey { .. } => "publickey",
        }
    }
}

/// One SSH login to the gateway.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,

    /// Login name. Per-device logins replace it with
    /// `<device>@<routing-key>`.
    pub username: String,

    pub auth: AuthMethod,

    /// Bound on connecting and authenticating, and the inactivity timeout
    /// of the session.
    pub timeout: Duration,

    pub pty: PtySize,
    pub host_key_verification: HostKeyVerification,

    /// known_hosts file; `~/.ssh/known_hosts` when unset.
    pub known_hosts_path: Option<PathBuf>,
}

impl SshConfig {
    /// Settings for `username@host:22` with `none` auth and a 30 second
    /// timeout.
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            auth: AuthMethod::None,
            timeout: Duration::from_secs(30),
            pty: PtySize::default(),
            host_key_verification: HostKeyVerification::default(),
            known_hosts_path: None,
        }
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the authentication method.
    pub fn auth(mut self, auth: AuthMethod) -> Self {
        self.auth = auth;
        self
    }

    /// Set the connect timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set host key checking and the known_hosts file it uses.
    pub fn host_keys(mut self, verification: HostKeyVerification, known_hosts: Option<PathBuf>) -> Self {
        self.host_key_verification = verification;
        self.known_hosts_path = known_hosts;
        self
    }

    /// The same login settings under a different login name.
    pub fn for_user(&self, username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_user_keeps_everything_else() {
        let gateway = SshConfig::new("broker.example.net", "svc123")
            .port(2022)
            .auth(AuthMethod::Password(SecretString::from("pw".to_string())))
            .host_keys(HostKeyVerification::Strict, Some("/tmp/known_hosts".into()));

        let device = gateway.for_user("core-1@svc123");
        assert_eq!(device.username, "core-1@svc123");
        assert_eq!(device.port, 2022);
        assert_eq!(device.auth.kind(), "password");
        assert_eq!(device.host_key_verification, HostKeyVerification::Strict);
        assert_eq!(device.pty, PtySize::default());
    }
}
