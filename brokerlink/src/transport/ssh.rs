//! russh client plumbing: connect to the gateway, log in, open PTY shells.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use russh::Channel;
use russh::client::{self, Handle, Msg};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey, load_secret_key};
use secrecy::ExposeSecret;

use super::config::{AuthMethod, HostKeyVerification, PtySize, SshConfig};
use crate::error::TransportError;

/// An authenticated SSH connection to the gateway.
pub struct SshTransport {
    handle: Handle<GatewayClient>,
    config: SshConfig,
}

impl SshTransport {
    /// Connect and log in, both within `config.timeout`.
    pub async fn connect(config: SshConfig) -> Result<Self, TransportError> {
        let rejection = Arc::new(Mutex::new(None));
        let client = GatewayClient {
            policy: HostKeyPolicy::for_config(&config),
            rejection: Arc::clone(&rejection),
        };
        let russh_config = Arc::new(client::Config {
            inactivity_timeout: Some(config.timeout),
            ..Default::default()
        });

        debug!(
            "connecting to {}:{} as {} ({})",
            config.host,
            config.port,
            config.username,
            config.auth.kind()
        );
        let connecting = client::connect(russh_config, (config.host.as_str(), config.port), client);
        let mut handle = match tokio::time::timeout(config.timeout, connecting).await {
            Err(_) => return Err(TransportError::Timeout(config.timeout)),
            Ok(Err(e)) => {
                // A refused host key surfaces from russh as a generic error.
                let refused = rejection.lock().ok().and_then(|mut slot| slot.take());
                return Err(refused.unwrap_or(TransportError::Ssh(e)));
            }
            Ok(Ok(handle)) => handle,
        };

        tokio::time::timeout(config.timeout, login(&mut handle, &config))
            .await
            .map_err(|_| TransportError::Timeout(config.timeout))??;

        Ok(Self { handle, config })
    }

    /// Open a session channel with a PTY and an interactive shell.
    pub async fn open_shell(&self) -> Result<Channel<Msg>, TransportError> {
        let channel = self.handle.channel_open_session().await?;
        let PtySize { columns, rows } = self.config.pty;
        channel
            .request_pty(true, "vt100", columns, rows, 0, 0, &[])
            .await?;
        channel.request_shell(true).await?;
        Ok(channel)
    }

    /// Whether the connection's background task has stopped.
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Disconnect politely.
    pub async fn close(self) -> Result<(), TransportError> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}

async fn login(handle: &mut Handle<GatewayClient>, config: &SshConfig) -> Result<(), TransportError> {
    let user = config.username.as_str();
    let result = match &config.auth {
        AuthMethod::None => handle.authenticate_none(user).await?,
        AuthMethod::Password(password) => {
            handle
                .authenticate_password(user, password.expose_secret())
                .await?
        }
        AuthMethod::PrivateKey { path, passphrase } => {
            let key = load_secret_key(path, passphrase.as_ref().map(|p| p.expose_secret()))
                .map_err(|e| TransportError::Key(format!("{}: {}", path.display(), e)))?;
            let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
            handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                .await?
        }
    };

    if result.success() {
        Ok(())
    } else {
        Err(TransportError::AuthenticationFailed {
            user: user.to_string(),
        })
    }
}

/// Why a host key was refused.
#[derive(Debug)]
enum HostKeyRejection {
    Unknown,
    Changed { line: usize },
    KnownHosts(String),
}

/// known_hosts checking for one host.
#[derive(Debug, Clone)]
struct HostKeyPolicy {
    host: String,
    port: u16,
    verification: HostKeyVerification,
    known_hosts: Option<PathBuf>,
}

impl HostKeyPolicy {
    fn for_config(config: &SshConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            verification: config.host_key_verification,
            known_hosts: config.known_hosts_path.clone(),
        }
    }

    /// `Ok(true)` when known_hosts holds this key, `Ok(false)` when the
    /// host is not listed at all.
    fn lookup(&self, key: &PublicKey) -> Result<bool, HostKeyRejection> {
        let found = match &self.known_hosts {
            Some(path) => russh::keys::check_known_hosts_path(&self.host, self.port, key, path),
            None => russh::keys::check_known_hosts(&self.host, self.port, key),
        };
        match found {
            Ok(known) => Ok(known),
            Err(russh::keys::Error::KeyChanged { line }) => Err(HostKeyRejection::Changed { line }),
            Err(e) => Err(HostKeyRejection::KnownHosts(e.to_string())),
        }
    }

    fn learn(&self, key: &PublicKey) {
        let learned = match &self.known_hosts {
            Some(path) => {
                russh::keys::known_hosts::learn_known_hosts_path(&self.host, self.port, key, path)
            }
            None => russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, key),
        };
        match learned {
            Ok(()) => info!("learned host key for {}:{}", self.host, self.port),
            Err(e) => warn!("could not save host key for {}:{}: {}", self.host, self.port, e),
        }
    }

    fn verify(&self, key: &PublicKey) -> Result<(), HostKeyRejection> {
        match self.verification {
            HostKeyVerification::Disabled => Ok(()),
            HostKeyVerification::AcceptNew => {
                if !self.lookup(key)? {
                    self.learn(key);
                }
                Ok(())
            }
            HostKeyVerification::Strict => match self.lookup(key)? {
                true => Ok(()),
                false => Err(HostKeyRejection::Unknown),
            },
        }
    }

    fn error(&self, rejection: HostKeyRejection) -> TransportError {
        match rejection {
            HostKeyRejection::Unknown => TransportError::HostKeyUnknown {
                host: self.host.clone(),
                port: self.port,
            },
            HostKeyRejection::Changed { line } => TransportError::HostKeyChanged {
                host: self.host.clone(),
                port: self.port,
                line,
            },
            HostKeyRejection::KnownHosts(message) => TransportError::KnownHosts(message),
        }
    }
}

/// russh client handler; only host key checking is customized.
struct GatewayClient {
    policy: HostKeyPolicy,
    rejection: Arc<Mutex<Option<TransportError>>>,
}

impl client::Handler for GatewayClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        match self.policy.verify(key) {
            Ok(()) => Ok(true),
            Err(rejection) => {
                let error = self.policy.error(rejection);
                warn!("refusing host key: {}", error);
                if let Ok(mut slot) = self.rejection.lock() {
                    *slot = Some(error);
                }
                Ok(false)
            }
        }
    }
}
