//! SSH front end for the session relay.
//!
//! Accepts SSH clients, authenticates them against the shared proxy
//! password and hands every shell or exec channel to [`SessionRelay`] as an
//! [`InboundSession`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use russh::keys::ssh_key::private::Ed25519Keypair;
use russh::keys::{HashAlg, PrivateKey};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, ChannelStream, Pty};
use secrecy::SecretString;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{InboundSession, ProxyAuth, RelayOptions, SessionRegistry, SessionRelay};
use crate::broker::Broker;
use crate::config::RelayConfig;
use crate::error::{ConfigError, Error, RelayError, Result};

/// Client byte stream of an accepted SSH channel.
pub type RelayStream = Pin<Box<ChannelStream<Msg>>>;

/// Lifecycle state reported by the relay server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    /// Configuration checked, nothing served.
    Tested,
    /// Accepting sessions.
    Running,
    /// Shut down.
    Stopped,
}

/// What the relay server reports about itself.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub status: ServerStatus,
    pub addresses: Vec<SocketAddr>,
    pub fingerprint_sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions_served: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions_rejected: Option<u64>,
}

/// Listens for SSH clients and feeds them to a [`SessionRelay`].
pub struct RelayServer<B> {
    relay: Arc<SessionRelay<B>>,
    config: RelayConfig,
    host_key: PrivateKey,
}

impl<B: Broker> RelayServer<B> {
    /// Build a server for `broker` from `config`.
    ///
    /// Fails if the host key PEM cannot be decoded or the port is 0.
    pub fn new(broker: Arc<B>, config: RelayConfig) -> Result<Self> {
        if config.local_port == 0 {
            return Err(ConfigError::Invalid {
                name: "local_port",
                message: "must be between 1 and 65535".to_string(),
            }
            .into());
        }

        let host_key = match &config.host_key_pem {
            Some(pem) => russh::keys::decode_secret_key(pem, None).map_err(|e| {
                Error::from(ConfigError::Invalid {
                    name: "host_key",
                    message: e.to_string(),
                })
            })?,
            None => {
                debug!("no host key configured, generating an ephemeral Ed25519 key");
                PrivateKey::from(Ed25519Keypair::from_seed(&rand::random::<[u8; 32]>()))
            }
        };

        let relay = Arc::new(SessionRelay::new(
            broker,
            ProxyAuth::new(config.password.clone()),
            RelayOptions {
                lifetime: config.lifetime,
                shutdown_grace: config.shutdown_grace,
            },
        ));

        Ok(Self {
            relay,
            config,
            host_key,
        })
    }

    /// The relay engine behind this server.
    pub fn relay(&self) -> &Arc<SessionRelay<B>> {
        &self.relay
    }

    /// SHA-256 fingerprint of the host key, `SHA256:...`.
    pub fn fingerprint(&self) -> String {
        self.host_key
            .public_key()
            .fingerprint(HashAlg::Sha256)
            .to_string()
    }

    /// Bind the listen address once and release it again.
    pub async fn test(&self) -> Result<ServerInfo> {
        let listener = self.bind().await?;
        let info = self.info(&listener, ServerStatus::Tested);
        drop(listener);
        info!("relay configuration tested on {:?}", info.addresses);
        Ok(info)
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let address = (self.config.local_address.as_str(), self.config.local_port);
        TcpListener::bind(address)
            .await
            .map_err(|e| Error::from(RelayError::Io(e)))
    }

    /// Report for a bound listener.
    pub fn info(&self, listener: &TcpListener, status: ServerStatus) -> ServerInfo {
        ServerInfo {
            status,
            addresses: listener.local_addr().into_iter().collect(),
            fingerprint_sha256: self.fingerprint(),
            sessions_served: None,
            sessions_rejected: None,
        }
    }

    /// Serve SSH clients on `listener` until `cancel` fires or the relay's
    /// lifetime ends.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<ServerInfo> {
        let mut info = self.info(&listener, ServerStatus::Running);
        info!(
            "relay listening on {:?}, host key {}",
            info.addresses, info.fingerprint_sha256
        );

        let ssh_config = Arc::new(russh::server::Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![self.host_key.clone()],
            ..Default::default()
        });

        let (sessions_tx, sessions_rx) = mpsc::channel(64);
        // The relay decides when serving ends; the listener follows it.
        let stop_accepting = CancellationToken::new();
        let listener_task = tokio::spawn(accept_connections(
            listener,
            ssh_config,
            sessions_tx,
            self.relay.auth().clone(),
            Arc::clone(self.relay.registry()),
            stop_accepting.clone(),
        ));

        let stats = Arc::clone(&self.relay).run(sessions_rx, cancel).await;
        stop_accepting.cancel();
        if let Err(e) = listener_task.await {
            warn!("relay listener task failed: {}", e);
        }

        info.status = ServerStatus::Stopped;
        info.sessions_served = Some(stats.served);
        info.sessions_rejected = Some(stats.rejected);
        Ok(info)
    }
}

/// Accept TCP connections and run the SSH protocol on each one.
async fn accept_connections(
    listener: TcpListener,
    config: Arc<russh::server::Config>,
    sessions: mpsc::Sender<InboundSession<RelayStream>>,
    auth: ProxyAuth,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("relay listener shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let handler = ConnectionHandler::new(
                        peer,
                        auth.clone(),
                        Arc::clone(&registry),
                        sessions.clone(),
                    );
                    tokio::spawn(serve_connection(
                        Arc::clone(&config),
                        socket,
                        peer,
                        handler,
                        cancel.clone(),
                    ));
                }
                Err(e) => warn!("failed to accept connection: {}", e),
            }
        }
    }
}

async fn serve_connection(
    config: Arc<russh::server::Config>,
    socket: TcpStream,
    peer: SocketAddr,
    handler: ConnectionHandler,
    cancel: CancellationToken,
) {
    debug!("connection from {}", peer);
    let result = async {
        let session = russh::server::run_stream(config, socket, handler).await?;
        session.await
    };

    tokio::select! {
        _ = cancel.cancelled() => debug!("dropping connection from {}", peer),
        result = result => match result {
            Ok(()) => debug!("connection from {} closed", peer),
            Err(e) => debug!("connection from {} closed with error: {}", peer, e),
        }
    }
}

/// Per-connection SSH handler.
///
/// Channels are parked on open and turned into [`InboundSession`]s once the
/// client asks for a shell or an exec.
struct ConnectionHandler {
    peer: SocketAddr,
    auth: ProxyAuth,
    registry: Arc<SessionRegistry>,
    sessions: mpsc::Sender<InboundSession<RelayStream>>,
    user: String,
    password: Option<SecretString>,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl ConnectionHandler {
    fn new(
        peer: SocketAddr,
        auth: ProxyAuth,
        registry: Arc<SessionRegistry>,
        sessions: mpsc::Sender<InboundSession<RelayStream>>,
    ) -> Self {
        Self {
            peer,
            auth,
            registry,
            sessions,
            user: String::new(),
            password: None,
            channels: HashMap::new(),
        }
    }

    fn check(&mut self, user: &str, password: Option<SecretString>) -> Auth {
        match self.auth.verify(user, password.as_ref()) {
            Ok(()) => {
                self.user = user.to_string();
                self.password = password;
                Auth::Accept
            }
            Err(e) => {
                if password.is_some() {
                    warn!("{} from {}", e, self.peer);
                    self.registry.record_rejection();
                }
                Auth::reject()
            }
        }
    }

    async fn start_session(
        &mut self,
        channel_id: ChannelId,
        exec: Option<String>,
        session: &mut Session,
    ) -> std::result::Result<(), russh::Error> {
        let Some(channel) = self.channels.remove(&channel_id) else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };
        session.channel_success(channel_id)?;

        let diagnostics = channel.make_writer_ext(Some(1));
        let inbound = InboundSession {
            peer: Some(self.peer),
            username: self.user.clone(),
            password: self.password.clone(),
            exec,
            stream: Box::pin(channel.into_stream()),
            diagnostics: Some(Box::pin(diagnostics)),
        };
        if self.sessions.send(inbound).await.is_err() {
            debug!("relay no longer accepting, dropping channel from {}", self.peer);
        }
        Ok(())
    }
}

impl Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> std::result::Result<Auth, Self::Error> {
        if self.auth.requires_password() {
            return Ok(Auth::reject());
        }
        Ok(self.check(user, None))
    }

    async fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> std::result::Result<Auth, Self::Error> {
        Ok(self.check(user, Some(SecretString::from(password.to_string()))))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        self.start_session(channel, None, session).await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        self.start_session(channel, Some(command), session).await
    }
}
