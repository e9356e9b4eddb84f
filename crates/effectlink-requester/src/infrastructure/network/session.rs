//! Requester side of one protocol session.
//!
//! # Handshake
//!
//! ```text
//! requester                              executor
//!    │── KEEP_ALIVE ───────────────────────►│   elicits the first packet
//!    │◄──────────────── LOGIN (packet) ─────│   only if the executor wants a password
//!    │── LOGIN (message = hash) ───────────►│
//!    │── KEEP_ALIVE ───────────────────────►│
//!    │◄────── LOGIN_SUCCESS or KEEP_ALIVE ──│   either one means "ready"
//! ```
//!
//! A wrong password ends with the executor's DISCONNECT; the session then
//! stops accepting requests.  Pending requests fail once the shutdown grace
//! period has passed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::futures::Notified;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use effectlink_core::protocol::{
    decode_response, FrameReader, PacketType, Request, RequestConfig, RequestIdCounter, Response,
    ValidationError,
};
use effectlink_core::session::{
    BoxedReader, Connection, ManagedSession, SessionFactory, SessionState, StateCell,
};
use effectlink_core::TimerService;

use crate::application::{
    CorrelationError, Correlator, CorrelatorConfig, RequestTransport, ResponseStream,
};

/// Reason logged when the executor asks for a password we do not have.
pub const PASSWORD_REQUIRED_REASON: &str = "Password required but none configured";

/// Capacity of the EFFECT_STATUS broadcast channel.
pub const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Errors from [`RequesterSession::send_request`].
#[derive(Debug, Error)]
pub enum RequestError {
    /// No session is connected and past its handshake.
    #[error("not accepting requests: no ready executor session")]
    NotAccepting,

    #[error("invalid request: {0}")]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),
}

/// Settings shared by every session of one requester.
#[derive(Debug, Clone, Default)]
pub struct RequesterSettings {
    /// `hex(SHA-512(password))` presented when the executor asks.
    pub password_hash: Option<String>,
    pub correlator: CorrelatorConfig,
    /// Interval of unsolicited keep-alives; `None` sends only the first one.
    pub keep_alive_interval: Option<Duration>,
}

/// State shared by every session one factory creates.
#[derive(Debug)]
struct Shared {
    settings: RequesterSettings,
    ids: RequestIdCounter,
    timer: TimerService,
    statuses: broadcast::Sender<Response>,
    /// Woken whenever any session becomes ready or ends.
    ready: Notify,
}

/// One connection to an executor.
pub struct RequesterSession {
    conn: Arc<Connection>,
    reader: Mutex<Option<FrameReader<BoxedReader>>>,
    state: StateCell,
    correlator: Correlator,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RequesterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequesterSession")
            .field("conn", &self.conn.id())
            .field("peer", &self.conn.peer())
            .field("state", &self.state.get())
            .field("pending", &self.correlator.pending_len())
            .finish_non_exhaustive()
    }
}

impl RequesterSession {
    fn new<S>(stream: S, peer: String, shared: Arc<Shared>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (conn, reader) = Connection::open_without_farewell(stream, peer);
        let correlator = Correlator::new(
            Arc::clone(&conn) as Arc<dyn RequestTransport>,
            shared.timer.clone(),
            shared.settings.correlator.clone(),
        );
        Arc::new(Self {
            conn,
            reader: Mutex::new(Some(reader)),
            state: StateCell::new(SessionState::Connecting),
            correlator,
            shared,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// `true` once the handshake finished and until the connection closes.
    pub fn is_accepting_requests(&self) -> bool {
        self.state.get() == SessionState::Ready && self.conn.is_open()
    }

    /// Waits until the session is ready.  Returns `false` if the connection
    /// closed first.
    pub async fn wait_ready(&self) -> bool {
        loop {
            let notified = self.shared.ready.notified();
            if self.is_accepting_requests() {
                return true;
            }
            if !self.conn.is_open() {
                return false;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.conn.closed() => {}
            }
        }
    }

    /// Sends an effect or notification request.
    ///
    /// Effect requests (TEST, START, STOP) get a fresh id; other request types
    /// keep the id in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::NotAccepting`] before the handshake or after
    /// close, [`RequestError::Invalid`] if `config` fails validation, and
    /// [`RequestError::Correlation`] if the request cannot be written.
    pub fn send_request(&self, mut config: RequestConfig) -> Result<ResponseStream, RequestError> {
        if !self.is_accepting_requests() {
            return Err(RequestError::NotAccepting);
        }
        if config.request_type.is_effect_type() {
            config.id = self.shared.ids.next();
        }
        let request = Request::new(config)?;
        Ok(self.correlator.send(request)?)
    }

    fn mark_ready(&self) {
        let promoted = self
            .state
            .transition(SessionState::Connecting, SessionState::Ready)
            || self
                .state
                .transition(SessionState::Authenticating, SessionState::Ready);
        if promoted {
            info!(peer = %self.conn.peer(), "executor session ready");
            self.shared.ready.notify_waiters();
        }
    }

    fn handle(&self, response: Response) {
        match response.packet_type() {
            PacketType::Login => self.handle_login(),
            PacketType::LoginSuccess | PacketType::KeepAlive => self.mark_ready(),
            PacketType::Disconnect => {
                info!(peer = %self.conn.peer(), reason = ?response.message(), "executor disconnected");
                self.state.advance(SessionState::Closing);
                self.conn.terminate();
            }
            PacketType::EffectResult => {
                self.mark_ready();
                self.correlator.route(response);
            }
            PacketType::EffectStatus => {
                self.mark_ready();
                debug!(effect = ?response.effect(), status = ?response.result_type(), "effect status");
                let _ = self.shared.statuses.send(response);
            }
        }
    }

    fn handle_login(&self) {
        let Some(hash) = self.shared.settings.password_hash.as_deref() else {
            warn!(peer = %self.conn.peer(), "executor wants a password but none is configured");
            self.close(PASSWORD_REQUIRED_REASON);
            return;
        };
        if self.state.get() == SessionState::Ready {
            warn!(peer = %self.conn.peer(), "LOGIN after the handshake ignored");
            return;
        }
        self.state
            .transition(SessionState::Connecting, SessionState::Authenticating);
        debug!(peer = %self.conn.peer(), "presenting password");
        let sent = self
            .conn
            .send_request(&Request::login(hash))
            .and_then(|()| self.conn.send_request(&Request::keep_alive()));
        if let Err(e) = sent {
            debug!(error = %e, "could not send LOGIN");
        }
    }

    fn spawn_keep_alive(self: &Arc<Self>) {
        let Some(period) = self.shared.settings.keep_alive_interval else {
            return;
        };
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = session.conn.closed() => break,
                    _ = ticker.tick() => {
                        if session.conn.send_request(&Request::keep_alive()).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl ManagedSession for RequesterSession {
    async fn run(self: Arc<Self>) {
        let taken = self.reader.lock().take();
        let Some(mut reader) = taken else {
            warn!("requester session is already running");
            return;
        };

        if let Err(e) = self.conn.send_request(&Request::keep_alive()) {
            debug!(error = %e, "could not send first KEEP_ALIVE");
        }
        self.spawn_keep_alive();

        while let Some(response) = self.conn.recv(&mut reader, decode_response).await {
            self.handle(response);
        }

        self.state.close();
        self.shared.ready.notify_waiters();
        self.correlator
            .fail_pending_after(self.shared.settings.correlator.shutdown_grace);
        debug!(peer = %self.conn.peer(), "requester session ended");
    }

    fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    fn close(&self, reason: &str) {
        self.state.advance(SessionState::Closing);
        self.conn.close(reason);
    }
}

/// Builds [`RequesterSession`]s that share one id counter, timer and status
/// channel.
#[derive(Debug, Clone)]
pub struct RequesterSessionFactory {
    shared: Arc<Shared>,
}

impl RequesterSessionFactory {
    pub fn new(settings: RequesterSettings) -> Self {
        let (statuses, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                settings,
                ids: RequestIdCounter::new(),
                timer: TimerService::new(),
                statuses,
                ready: Notify::new(),
            }),
        }
    }

    pub fn settings(&self) -> &RequesterSettings {
        &self.shared.settings
    }

    /// EFFECT_STATUS packets from every session of this factory.
    pub fn subscribe_status(&self) -> broadcast::Receiver<Response> {
        self.shared.statuses.subscribe()
    }

    /// Resolves the next time any session of this factory becomes ready or
    /// ends.  Create it before checking state, as with [`Notify::notified`].
    pub fn readiness_changed(&self) -> Notified<'_> {
        self.shared.ready.notified()
    }

    /// Wraps any duplex stream, e.g. an in-memory pipe in tests.
    pub fn open_stream<S>(&self, stream: S, peer: impl Into<String>) -> Arc<RequesterSession>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        RequesterSession::new(stream, peer.into(), Arc::clone(&self.shared))
    }
}

impl SessionFactory for RequesterSessionFactory {
    type Session = RequesterSession;

    fn open(&self, stream: TcpStream, peer: String) -> Arc<RequesterSession> {
        self.open_stream(stream, peer)
    }
}
