//! Session relay: route inbound sessions to backends by identity.
//!
//! Each inbound session presents a username of the form
//! `<target>@<routing-key>`. The relay checks the shared password, parses
//! the identity, asks the broker for a backend stream and pumps bytes both
//! ways until either side closes. Sessions run as independent tasks, so a
//! stuck backend only ever stalls its own session.
//!
//! [`SessionRelay`] is transport-agnostic: it consumes [`InboundSession`]s
//! from any [`Acceptor`]. The SSH front end in [`server`] is the production
//! acceptor.

mod identity;
mod pump;
mod registry;
pub mod server;

pub use identity::RouteIdentity;
pub use pump::{PEER_IO_TIMEOUT, PumpEnd, pump};
pub use registry::{SessionGuard, SessionInfo, SessionRegistry};
pub use server::{RelayServer, RelayStream, ServerInfo, ServerStatus};

use std::future::{Future, pending};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use self::pump::close_quietly;
use crate::broker::Broker;
use crate::error::RelayError;

/// Side channel for telling a rejected client why.
pub type Diagnostics = Pin<Box<dyn AsyncWrite + Send>>;

/// An inbound connection that has presented credentials.
pub struct InboundSession<S> {
    /// Remote address, when known.
    pub peer: Option<SocketAddr>,

    /// Presented username; carries the route identity.
    pub username: String,

    /// Presented password, if any.
    pub password: Option<SecretString>,

    /// Command line for exec sessions; written to the backend first.
    pub exec: Option<String>,

    /// The client's byte stream.
    pub stream: S,

    /// Where to write a one-line rejection reason (SSH stderr).
    pub diagnostics: Option<Diagnostics>,
}

impl<S> InboundSession<S> {
    /// A shell session with no password and no diagnostics channel.
    pub fn new(username: impl Into<String>, stream: S) -> Self {
        Self {
            peer: None,
            username: username.into(),
            password: None,
            exec: None,
            stream,
            diagnostics: None,
        }
    }

    /// Attach a password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::from(password.into()));
        self
    }
}

/// Source of inbound sessions.
pub trait Acceptor: Send {
    /// Client stream type.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next session; `None` once no more will come.
    fn accept(&mut self) -> impl Future<Output = Option<InboundSession<Self::Stream>>> + Send;
}

impl<S> Acceptor for mpsc::Receiver<InboundSession<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    async fn accept(&mut self) -> Option<InboundSession<S>> {
        self.recv().await
    }
}

/// Shared-password check; fails closed.
#[derive(Debug, Clone, Default)]
pub struct ProxyAuth {
    password: Option<SecretString>,
}

impl ProxyAuth {
    /// Require `password` when set, accept anyone otherwise.
    pub fn new(password: Option<SecretString>) -> Self {
        Self { password }
    }

    /// Whether a password is configured.
    pub fn requires_password(&self) -> bool {
        self.password.is_some()
    }

    /// Check presented credentials.
    pub fn verify(&self, user: &str, presented: Option<&SecretString>) -> Result<(), RelayError> {
        match (&self.password, presented) {
            (None, _) => Ok(()),
            (Some(expected), Some(given))
                if constant_time_eq(
                    expected.expose_secret().as_bytes(),
                    given.expose_secret().as_bytes(),
                ) =>
            {
                Ok(())
            }
            _ => Err(RelayError::Authentication {
                user: user.to_string(),
            }),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Stop accepting once this much time has passed.
    pub lifetime: Option<Duration>,

    /// How long live sessions get to wind down on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            lifetime: None,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Counters reported when a relay stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub served: u64,
    pub rejected: u64,
}

/// The relay engine.
pub struct SessionRelay<B> {
    broker: Arc<B>,
    auth: ProxyAuth,
    options: RelayOptions,
    registry: Arc<SessionRegistry>,
}

impl<B: Broker> SessionRelay<B> {
    /// Create a relay over `broker`.
    pub fn new(broker: Arc<B>, auth: ProxyAuth, options: RelayOptions) -> Self {
        Self {
            broker,
            auth,
            options,
            registry: Arc::new(SessionRegistry::new()),
        }
    }

    /// Live session bookkeeping.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The shared-password policy.
    pub fn auth(&self) -> &ProxyAuth {
        &self.auth
    }

    /// Accept sessions until cancelled, the lifetime runs out or the
    /// acceptor dries up; then give live sessions the grace period and
    /// abort whatever is left.
    pub async fn run<A: Acceptor>(self: Arc<Self>, mut acceptor: A, cancel: CancellationToken) -> RelayStats {
        let sessions_cancel = cancel.child_token();
        let lifetime_ends = self.options.lifetime.map(|lifetime| Instant::now() + lifetime);
        let mut sessions = JoinSet::new();

        loop {
            let lifetime = async {
                match lifetime_ends {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => pending().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("relay shutdown requested");
                    break;
                }
                _ = lifetime => {
                    info!("relay lifetime elapsed");
                    break;
                }
                accepted = acceptor.accept() => {
                    let Some(session) = accepted else {
                        debug!("acceptor closed");
                        break;
                    };
                    let relay = Arc::clone(&self);
                    let token = sessions_cancel.clone();
                    sessions.spawn(async move { relay.serve_session(session, token).await });
                }
                Some(done) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = done {
                        warn!("relay session task failed: {}", e);
                    }
                }
            }
        }

        sessions_cancel.cancel();
        let grace_ends = Instant::now() + self.options.shutdown_grace;
        while let Ok(Some(_)) = tokio::time::timeout_at(grace_ends, sessions.join_next()).await {}
        if !sessions.is_empty() {
            warn!("aborting {} relay session(s) after grace period", sessions.len());
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        let stats = RelayStats {
            served: self.registry.served(),
            rejected: self.registry.rejected(),
        };
        info!(
            "relay stopped: {} session(s) served, {} rejected",
            stats.served, stats.rejected
        );
        stats
    }

    /// Take one session through authentication, routing and relaying.
    ///
    /// Errors are terminal for this session only. A rejected session is
    /// told why on its diagnostics channel before its stream is closed.
    pub async fn serve_session<S>(
        &self,
        mut session: InboundSession<S>,
        cancel: CancellationToken,
    ) -> Result<PumpEnd, RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let peer = session
            .peer
            .map_or_else(|| "local".to_string(), |p| p.to_string());

        let routed = self
            .route(&session.username, session.password.as_ref())
            .await;
        let (identity, mut backend) = match routed {
            Ok(routed) => routed,
            Err(e) => return Err(self.reject(&mut session, &peer, e).await),
        };

        if let Some(command) = &session.exec {
            let line = format!("{command}\n");
            let written = tokio::time::timeout(PEER_IO_TIMEOUT, backend.write_all(line.as_bytes()))
                .await
                .unwrap_or_else(|_| {
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "backend did not take the exec command",
                    ))
                });
            if let Err(e) = written {
                close_quietly("backend", &mut backend).await;
                return Err(self.reject(&mut session, &peer, e.into()).await);
            }
        }

        let guard = self.registry.register(session.peer, &identity);
        info!(
            "session {} from {} relaying to {} ({} live)",
            guard.id(),
            peer,
            identity,
            self.registry.len()
        );

        let end = pump(session.stream, backend, &cancel).await;
        match &end {
            Ok(how) => info!("session {} to {} ended: {:?}", guard.id(), identity, how),
            Err(e) => warn!("session {} to {} failed: {}", guard.id(), identity, e),
        }
        Ok(end?)
    }

    /// Record and report a rejected session, then close its stream.
    async fn reject<S>(&self, session: &mut InboundSession<S>, peer: &str, error: RelayError) -> RelayError
    where
        S: AsyncWrite + Unpin,
    {
        warn!("rejecting session from {} as {:?}: {}", peer, session.username, error);
        self.registry.record_rejection();
        if let Some(mut diagnostics) = session.diagnostics.take() {
            let line = format!("brokerlink: {error}\r\n");
            match tokio::time::timeout(PEER_IO_TIMEOUT, diagnostics.write_all(line.as_bytes())).await {
                Ok(Ok(())) => close_quietly("diagnostics", &mut diagnostics).await,
                Ok(Err(e)) => debug!("could not tell {} why: {}", peer, e),
                Err(_) => debug!("could not tell {} why: write timed out", peer),
            }
        }
        close_quietly("inbound", &mut session.stream).await;
        error
    }

    async fn route(
        &self,
        username: &str,
        password: Option<&SecretString>,
    ) -> Result<(RouteIdentity, B::Stream), RelayError> {
        self.auth.verify(username, password)?;
        let identity = RouteIdentity::parse(username)?;

        let backend = self
            .broker
            .open_backend_stream(&identity.target, &identity.routing_key)
            .await
            .map_err(|e| RelayError::RouteResolution {
                target: identity.target.clone(),
                routing_key: identity.routing_key.clone(),
                reason: e.to_string(),
            })?;
        Ok((identity, backend))
    }
}
