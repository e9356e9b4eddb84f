//! Executor side of one protocol session.
//!
//! # Handshake
//!
//! ```text
//! executor                              requester
//!    │── LOGIN (packet, id 0) ─────────────►│   only if a password is configured
//!    │◄──────────── LOGIN (request, hash) ──│
//!    │── LOGIN_SUCCESS ────────────────────►│   hash matches (optional packet)
//!    │── DISCONNECT "Incorrect password" ──►│   hash does not match; then close
//! ```
//!
//! Keep-alives are answered in every state.  Any other request that arrives
//! before the handshake completes is answered with NOT_READY.  Once ready,
//! every request is dispatched on its own task so a slow effect never stalls
//! the read loop.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use effectlink_core::dispatch::dispatch_guarded;
use effectlink_core::protocol::{
    decode_request, verify_password_hash, FrameReader, Request, RequestType, Response, ResultType,
};
use effectlink_core::session::{
    BoxedReader, Connection, ManagedSession, SessionFactory, SessionState, StateCell,
};
use effectlink_core::{EffectDispatcher, Responder, ResponseSink};

/// Reason sent when the presented password hash does not match.
pub const INCORRECT_PASSWORD_REASON: &str = "Incorrect password";

/// Authentication settings shared by every session of one executor.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Expected `hex(SHA-512(password))`; `None` disables the handshake.
    pub password_hash: Option<String>,
    /// Whether to confirm a correct password with LOGIN_SUCCESS.
    pub send_login_success: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            password_hash: None,
            send_login_success: true,
        }
    }
}

/// One connected requester.
pub struct ExecutorSession {
    conn: Arc<Connection>,
    reader: Mutex<Option<FrameReader<BoxedReader>>>,
    state: StateCell,
    settings: Arc<ExecutorSettings>,
    dispatcher: Arc<dyn EffectDispatcher>,
}

impl std::fmt::Debug for ExecutorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorSession")
            .field("conn", &self.conn.id())
            .field("peer", &self.conn.peer())
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl ExecutorSession {
    /// Wraps `stream`; nothing is sent until [`ManagedSession::run`].
    pub fn new<S>(
        stream: S,
        peer: impl Into<String>,
        settings: Arc<ExecutorSettings>,
        dispatcher: Arc<dyn EffectDispatcher>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (conn, reader) = Connection::open(stream, peer);
        Arc::new(Self {
            conn,
            reader: Mutex::new(Some(reader)),
            state: StateCell::new(SessionState::Connecting),
            settings,
            dispatcher,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// A responder writing to this session's connection.
    pub fn responder(&self) -> Responder {
        Responder::new(Arc::clone(&self.conn) as Arc<dyn ResponseSink>)
    }

    fn begin(&self) {
        if self.settings.password_hash.is_some() {
            self.state
                .transition(SessionState::Connecting, SessionState::Authenticating);
            debug!(peer = %self.conn.peer(), "requesting password");
            if let Err(e) = self.conn.send_response(&Response::login()) {
                debug!(error = %e, "could not send LOGIN");
            }
        } else {
            self.state
                .transition(SessionState::Connecting, SessionState::Ready);
        }
    }

    fn handle(&self, request: Request) {
        match request.request_type() {
            RequestType::KeepAlive => {
                let _ = self.conn.send_response(&Response::keep_alive());
            }
            RequestType::Login => self.handle_login(&request),
            _ => match self.state.get() {
                SessionState::Ready => {
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let responder = self.responder();
                    tokio::spawn(async move {
                        dispatch_guarded(dispatcher.as_ref(), request, responder).await;
                    });
                }
                SessionState::Connecting | SessionState::Authenticating => {
                    debug!(request_id = request.id(), "request before login; NOT_READY");
                    self.responder().reply(&request, ResultType::NotReady, None);
                }
                SessionState::Closing | SessionState::Closed => {}
            },
        }
    }

    fn handle_login(&self, request: &Request) {
        if self.state.get() != SessionState::Authenticating {
            warn!(peer = %self.conn.peer(), state = ?self.state.get(), "unexpected LOGIN ignored");
            return;
        }
        let Some(expected) = self.settings.password_hash.as_deref() else {
            return;
        };

        let presented = request.message().or(request.password()).unwrap_or_default();
        if verify_password_hash(expected, presented) {
            if self
                .state
                .transition(SessionState::Authenticating, SessionState::Ready)
            {
                info!(peer = %self.conn.peer(), "requester authenticated");
                if self.settings.send_login_success {
                    let _ = self.conn.send_response(&Response::login_success());
                }
            }
        } else {
            warn!(peer = %self.conn.peer(), "requester presented an incorrect password");
            self.close(INCORRECT_PASSWORD_REASON);
        }
    }
}

#[async_trait]
impl ManagedSession for ExecutorSession {
    async fn run(self: Arc<Self>) {
        let taken = self.reader.lock().take();
        let Some(mut reader) = taken else {
            warn!("executor session is already running");
            return;
        };

        self.begin();
        while let Some(request) = self.conn.recv(&mut reader, decode_request).await {
            self.handle(request);
        }

        self.state.close();
        debug!(peer = %self.conn.peer(), "executor session ended");
    }

    fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    fn close(&self, reason: &str) {
        self.state.advance(SessionState::Closing);
        self.conn.close(reason);
    }
}

/// Builds [`ExecutorSession`]s for the connection managers.
#[derive(Clone)]
pub struct ExecutorSessionFactory {
    settings: Arc<ExecutorSettings>,
    dispatcher: Arc<dyn EffectDispatcher>,
}

impl ExecutorSessionFactory {
    pub fn new(settings: ExecutorSettings, dispatcher: Arc<dyn EffectDispatcher>) -> Self {
        Self {
            settings: Arc::new(settings),
            dispatcher,
        }
    }
}

impl SessionFactory for ExecutorSessionFactory {
    type Session = ExecutorSession;

    fn open(&self, stream: TcpStream, peer: String) -> Arc<ExecutorSession> {
        ExecutorSession::new(
            stream,
            peer,
            Arc::clone(&self.settings),
            Arc::clone(&self.dispatcher),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use effectlink_core::protocol::{
        decode_response, encode_request, hash_password, PacketType, RequestConfig,
    };
    use effectlink_core::{DispatchOutcome, ResponseConfig};
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    struct AlwaysSucceed;

    #[async_trait]
    impl EffectDispatcher for AlwaysSucceed {
        async fn dispatch(
            &self,
            request: Request,
            _responder: Responder,
        ) -> anyhow::Result<DispatchOutcome> {
            Ok(DispatchOutcome::Build(ResponseConfig::for_request(
                &request,
                ResultType::Success,
            )))
        }
    }

    struct Peer {
        reader: FrameReader<tokio::io::ReadHalf<DuplexStream>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn send(&mut self, request: &Request) {
            self.writer
                .write_all(&encode_request(request).unwrap())
                .await
                .unwrap();
        }

        async fn next(&mut self) -> Option<Response> {
            let frame = self.reader.next_frame().await.unwrap()?;
            Some(decode_response(&frame).unwrap())
        }
    }

    fn start_session(password: Option<&str>) -> (Arc<ExecutorSession>, Peer) {
        let (local, remote) = duplex(64 * 1024);
        let settings = ExecutorSettings {
            password_hash: password.map(hash_password),
            send_login_success: true,
        };
        let session =
            ExecutorSession::new(local, "test", Arc::new(settings), Arc::new(AlwaysSucceed));
        tokio::spawn(Arc::clone(&session).run());
        let (read_half, write_half) = tokio::io::split(remote);
        (
            session,
            Peer {
                reader: FrameReader::new(read_half),
                writer: write_half,
            },
        )
    }

    fn start_request(id: u32) -> Request {
        Request::new(RequestConfig {
            id,
            ..RequestConfig::effect(RequestType::Start, "spawn")
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_without_password_session_is_immediately_ready() {
        let (_session, mut peer) = start_session(None);

        peer.send(&start_request(1)).await;

        let reply = peer.next().await.unwrap();
        assert_eq!(reply.id(), 1);
        assert_eq!(reply.result_type(), Some(ResultType::Success));
    }

    #[tokio::test]
    async fn test_password_handshake_then_dispatch() {
        let (session, mut peer) = start_session(Some("secret"));

        assert_eq!(peer.next().await.unwrap().packet_type(), PacketType::Login);
        peer.send(&Request::login(hash_password("secret"))).await;
        assert_eq!(
            peer.next().await.unwrap().packet_type(),
            PacketType::LoginSuccess
        );
        assert_eq!(session.state(), SessionState::Ready);

        peer.send(&start_request(2)).await;
        assert_eq!(peer.next().await.unwrap().id(), 2);
    }

    #[tokio::test]
    async fn test_request_before_login_gets_not_ready() {
        let (_session, mut peer) = start_session(Some("secret"));
        peer.next().await.unwrap();

        peer.send(&start_request(3)).await;

        let reply = peer.next().await.unwrap();
        assert_eq!(reply.id(), 3);
        assert_eq!(reply.result_type(), Some(ResultType::NotReady));
    }

    #[tokio::test]
    async fn test_keep_alive_answered_while_authenticating() {
        let (_session, mut peer) = start_session(Some("secret"));
        peer.next().await.unwrap();

        peer.send(&Request::keep_alive()).await;

        assert_eq!(peer.next().await.unwrap(), Response::keep_alive());
    }

    #[tokio::test]
    async fn test_wrong_password_disconnects() {
        let (session, mut peer) = start_session(Some("secret"));
        peer.next().await.unwrap();

        peer.send(&Request::login(hash_password("guess"))).await;

        let farewell = peer.next().await.unwrap();
        assert_eq!(farewell.packet_type(), PacketType::Disconnect);
        assert_eq!(farewell.message(), Some(INCORRECT_PASSWORD_REASON));
        assert!(peer.next().await.is_none());
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_password_field_is_accepted_as_fallback() {
        let (_session, mut peer) = start_session(Some("secret"));
        peer.next().await.unwrap();
        let login = Request::new(RequestConfig {
            password: Some(hash_password("secret").to_uppercase()),
            ..RequestConfig::new(RequestType::Login)
        })
        .unwrap();

        peer.send(&login).await;

        assert_eq!(
            peer.next().await.unwrap().packet_type(),
            PacketType::LoginSuccess
        );
    }
}
