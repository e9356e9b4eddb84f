//! Connection managers shared by the requester and executor front-ends.
//!
//! Either side of the protocol may be the TCP client or the TCP server, so
//! the managers are written once against two small traits:
//!
//! - [`SessionFactory`] wraps an accepted/connected stream in a session.
//! - [`ManagedSession`] is what the managers drive: run it, check whether
//!   it is still open, close it.
//!
//! [`ClientManager`] keeps one outbound connection alive, reconnecting with
//! exponential backoff.  [`ServerManager`] accepts any number of peers, each
//! on its own task, and sweeps closed sessions out of its table.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reason carried by the DISCONNECT each session sends on server shutdown.
pub const SERVER_SHUTDOWN_REASON: &str = "Server shutting down";

/// Reason carried by the DISCONNECT a client sends on shutdown.
pub const CLIENT_SHUTDOWN_REASON: &str = "Client shutting down";

/// Default interval between sweeps of closed server sessions.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Errors raised while setting up a manager.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Binding the listening socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Any other socket error.
    #[error("network I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A session the managers can drive.
#[async_trait]
pub trait ManagedSession: Send + Sync + 'static {
    /// Runs the session's read loop until its connection closes.
    async fn run(self: Arc<Self>);

    /// Returns `true` while the underlying connection is open.
    fn is_open(&self) -> bool;

    /// Closes the session, sending DISCONNECT with `reason` if still open.
    fn close(&self, reason: &str);
}

/// Builds sessions from freshly connected streams.
pub trait SessionFactory: Send + Sync + 'static {
    type Session: ManagedSession;

    /// Wraps `stream` in a new session.  Must be called from within a tokio runtime.
    fn open(&self, stream: TcpStream, peer: String) -> Arc<Self::Session>;
}

/// `min(cap, 2^attempt seconds)`.
pub fn backoff_delay(attempt: u32, cap: Duration) -> Duration {
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(cap)
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Keeps one outbound session connected until shut down.
pub struct ClientManager<F: SessionFactory> {
    remote: String,
    max_backoff: Duration,
    factory: F,
    current: Mutex<Option<Arc<F::Session>>>,
    shutdown: CancellationToken,
}

impl<F: SessionFactory> fmt::Debug for ClientManager<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientManager")
            .field("remote", &self.remote)
            .field("max_backoff", &self.max_backoff)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl<F: SessionFactory> ClientManager<F> {
    /// Creates a manager that will connect to `remote` (`host:port`).
    pub fn new(remote: impl Into<String>, factory: F, max_backoff: Duration) -> Arc<Self> {
        Arc::new(Self {
            remote: remote.into(),
            max_backoff,
            factory,
            current: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// The connected session, if it is still open.
    pub fn current(&self) -> Option<Arc<F::Session>> {
        self.current
            .lock()
            .as_ref()
            .filter(|session| session.is_open())
            .cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some()
    }

    /// Connects, runs the session, and reconnects after every disconnect or
    /// failed attempt, until [`shutdown`](Self::shutdown) is called.
    ///
    /// The wait before attempt `n` is [`backoff_delay`]`(n, max_backoff)`;
    /// `n` resets to 0 each time a TCP connection is established.
    pub async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;

        while !self.shutdown.is_cancelled() {
            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = TcpStream::connect(self.remote.as_str()) => result,
            };

            match connected {
                Ok(stream) => {
                    attempt = 0;
                    let peer = stream
                        .peer_addr()
                        .map(|addr| addr.to_string())
                        .unwrap_or_else(|_| self.remote.clone());
                    info!(%peer, "connected");

                    let session = self.factory.open(stream, peer.clone());
                    *self.current.lock() = Some(Arc::clone(&session));
                    if self.shutdown.is_cancelled() {
                        session.close(CLIENT_SHUTDOWN_REASON);
                    }

                    Arc::clone(&session).run().await;

                    *self.current.lock() = None;
                    info!(%peer, "disconnected");
                }
                Err(e) => {
                    warn!(remote = %self.remote, error = %e, "connect failed");
                }
            }

            let delay = backoff_delay(attempt, self.max_backoff);
            attempt = attempt.saturating_add(1);
            debug!(?delay, attempt, "waiting before reconnect");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!(remote = %self.remote, "client manager stopped");
    }

    /// Stops reconnecting and closes the current session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(session) = self.current.lock().take() {
            session.close(CLIENT_SHUTDOWN_REASON);
        }
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

/// Accepts peers and runs one session per connection.
pub struct ServerManager<F: SessionFactory> {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    factory: F,
    sessions: Mutex<Vec<Arc<F::Session>>>,
    sweep_interval: Duration,
    shutdown: CancellationToken,
}

impl<F: SessionFactory> fmt::Debug for ServerManager<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerManager")
            .field("local_addr", &self.local_addr)
            .field("sessions", &self.sessions.lock().len())
            .finish_non_exhaustive()
    }
}

impl<F: SessionFactory> ServerManager<F> {
    /// Binds `addr` (`host:port`; port 0 picks a free port).
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Bind`] if the address is in use or not permitted.
    pub async fn bind(addr: &str, factory: F) -> Result<Arc<Self>, NetworkError> {
        Self::bind_with_sweep(addr, factory, DEFAULT_SWEEP_INTERVAL).await
    }

    /// Like [`bind`](Self::bind) with a custom sweep interval.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Bind`] if the address is in use or not permitted.
    pub async fn bind_with_sweep(
        addr: &str,
        factory: F,
        sweep_interval: Duration,
    ) -> Result<Arc<Self>, NetworkError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NetworkError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening");

        Ok(Arc::new(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            factory,
            sessions: Mutex::new(Vec::new()),
            sweep_interval,
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Snapshot of the sessions whose connection is still open.
    pub fn sessions(&self) -> Vec<Arc<F::Session>> {
        self.sessions
            .lock()
            .iter()
            .filter(|session| session.is_open())
            .cloned()
            .collect()
    }

    /// Accepts connections until [`shutdown`](Self::shutdown).
    ///
    /// Each session runs on its own task, so one slow peer never blocks the
    /// accept loop or other sessions.  Calling `run` twice is a no-op the
    /// second time: the listener is consumed by the first call.
    pub async fn run(self: Arc<Self>) {
        let Some(listener) = self.listener.lock().take() else {
            warn!("server manager is already running or was shut down");
            return;
        };

        let sweeper = tokio::spawn(Self::sweep_loop(Arc::clone(&self)));

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = listener.accept() => result,
            };

            match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "accepted connection");
                    let session = self.factory.open(stream, peer.to_string());
                    self.sessions.lock().push(Arc::clone(&session));
                    tokio::spawn(async move {
                        session.run().await;
                        debug!(%peer, "session ended");
                    });
                }
                Err(e) => {
                    // Transient (e.g. out of file descriptors); keep accepting.
                    error!(error = %e, "accept failed");
                }
            }
        }

        drop(listener);
        sweeper.abort();
        self.close_all();
        info!(local_addr = %self.local_addr, "server stopped");
    }

    /// Stops accepting and closes every live session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.listener.lock().take();
        self.close_all();
    }

    fn close_all(&self) {
        let sessions = std::mem::take(&mut *self.sessions.lock());
        for session in sessions {
            session.close(SERVER_SHUTDOWN_REASON);
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        loop {
            ticker.tick().await;
            let mut sessions = self.sessions.lock();
            let before = sessions.len();
            sessions.retain(|session| session.is_open());
            if sessions.len() != before {
                debug!(removed = before - sessions.len(), "swept closed sessions");
            }
        }
    }
}
