//! One duplex connection to a peer.
//!
//! # Writing
//!
//! All outbound packets go through an unbounded queue drained by a single
//! writer task, so concurrent senders (the read loop answering keep-alives,
//! dispatcher tasks sending results, timers finishing effects) never
//! interleave bytes and packets leave in the order they were queued.
//!
//! # Reading
//!
//! The read side is handed back to the session as a [`FrameReader`] and
//! driven with [`Connection::recv`], which also watches the connection's
//! cancellation token so a local `close()` ends the read loop promptly.
//!
//! # Closing
//!
//! [`Connection::close`] is idempotent: the first call queues exactly one
//! DISCONNECT carrying the reason, then shuts the stream down.  Use
//! [`Connection::terminate`] when the peer is already gone or announced its
//! own DISCONNECT; it closes without sending anything.
//!
//! DISCONNECT only exists in the response direction.  Connections opened
//! with [`Connection::open_without_farewell`] (the requester side) never
//! send it: `close()` there behaves like `terminate()` and only logs the
//! reason.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::dispatch::ResponseSink;
use crate::protocol::{
    encode_request, encode_response, FrameReader, ProtocolError, Request, Response,
};

/// Read half of a connection, boxed so sessions are not generic over the transport.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Reason sent when an inbound frame cannot be decoded.
pub const MALFORMED_PACKET_REASON: &str = "Malformed packet";

/// Errors surfaced to code sending on a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection was closed locally or by the peer.
    #[error("connection is closed")]
    Closed,

    /// The packet could not be encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

enum Outbound {
    Frame(Vec<u8>),
    Close { farewell: Option<Vec<u8>> },
}

/// Returns `true` for transport errors that simply mean "the peer went away".
///
/// These are logged at debug level; anything else is worth a warning.
pub fn is_peer_reset(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// A live connection.  Shared between the session's read loop, dispatcher
/// tasks and timers via `Arc`.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    peer: String,
    open: AtomicBool,
    farewell: bool,
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outbound::Frame(bytes) => write!(f, "Frame({} bytes)", bytes.len()),
            Outbound::Close { farewell } => write!(f, "Close(farewell: {})", farewell.is_some()),
        }
    }
}

impl Connection {
    /// Splits `stream` into a connection (write side, running its writer task)
    /// and the frame reader for the session's read loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<S>(stream: S, peer: impl Into<String>) -> (Arc<Self>, FrameReader<BoxedReader>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::split(stream, peer.into(), true)
    }

    /// Like [`Connection::open`], but `close()` sends no DISCONNECT.
    pub fn open_without_farewell<S>(
        stream: S,
        peer: impl Into<String>,
    ) -> (Arc<Self>, FrameReader<BoxedReader>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::split(stream, peer.into(), false)
    }

    fn split<S>(stream: S, peer: String, farewell: bool) -> (Arc<Self>, FrameReader<BoxedReader>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader: BoxedReader = Box::new(read_half);
        let conn = Self::with_writer(Box::new(write_half), peer, farewell);
        (conn, FrameReader::new(reader))
    }

    fn with_writer(writer: BoxedWriter, peer: String, farewell: bool) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let id = Uuid::new_v4();

        tokio::spawn(write_loop(writer, rx, cancel.clone(), id, peer.clone()));

        Arc::new(Self {
            id,
            peer,
            open: AtomicBool::new(true),
            farewell,
            outbound: tx,
            cancel,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Human-readable peer label (usually the socket address).
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Returns `true` until the connection is closed locally, by the peer, or
    /// by a write failure.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Queues an already-encoded frame.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] after the connection closed.
    pub fn send_frame(&self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| ConnectionError::Closed)
    }

    /// Encodes and queues a response.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] when encoding fails or the connection is closed.
    pub fn send_response(&self, response: &Response) -> Result<(), ConnectionError> {
        trace!(conn_id = %self.id, packet = response.packet_type().name(), id = response.id(), "send response");
        self.send_frame(encode_response(response)?)
    }

    /// Encodes and queues a request.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] when encoding fails or the connection is closed.
    pub fn send_request(&self, request: &Request) -> Result<(), ConnectionError> {
        trace!(conn_id = %self.id, request = request.request_type().name(), id = request.id(), "send request");
        self.send_frame(encode_request(request)?)
    }

    /// Sends one DISCONNECT carrying `reason`, then closes the stream.
    ///
    /// Returns `false` if the connection was already closed; nothing is sent
    /// in that case.
    pub fn close(&self, reason: &str) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        debug!(conn_id = %self.id, peer = %self.peer, reason, "closing connection");
        let farewell = if !self.farewell {
            None
        } else {
            match encode_response(&Response::disconnect(reason)) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    warn!(conn_id = %self.id, error = %e, "could not encode DISCONNECT");
                    None
                }
            }
        };
        let _ = self.outbound.send(Outbound::Close { farewell });
        self.cancel.cancel();
        true
    }

    /// Closes without sending DISCONNECT.  Returns `false` if already closed.
    pub fn terminate(&self) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        debug!(conn_id = %self.id, peer = %self.peer, "terminating connection");
        let _ = self.outbound.send(Outbound::Close { farewell: None });
        self.cancel.cancel();
        true
    }

    /// Reads and decodes the next packet.
    ///
    /// Returns `None` when the read loop should stop: the connection was
    /// closed locally, the peer closed the stream, the transport failed, or a
    /// frame could not be decoded (in which case the connection is closed with
    /// [`MALFORMED_PACKET_REASON`]).
    pub async fn recv<T, R>(
        &self,
        reader: &mut FrameReader<R>,
        decode: fn(&[u8]) -> Result<T, ProtocolError>,
    ) -> Option<T>
    where
        R: AsyncRead + Unpin,
    {
        let frame = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            frame = reader.next_frame() => frame,
        };

        match frame {
            Ok(Some(bytes)) => match decode(&bytes) {
                Ok(packet) => Some(packet),
                Err(e) => {
                    warn!(conn_id = %self.id, peer = %self.peer, error = %e, "dropping connection after undecodable packet");
                    self.close(MALFORMED_PACKET_REASON);
                    None
                }
            },
            Ok(None) => {
                debug!(conn_id = %self.id, peer = %self.peer, "peer closed the stream");
                self.terminate();
                None
            }
            Err(ProtocolError::Io(e)) => {
                if is_peer_reset(&e) {
                    debug!(conn_id = %self.id, peer = %self.peer, error = %e, "peer reset the connection");
                } else {
                    warn!(conn_id = %self.id, peer = %self.peer, error = %e, "read failed");
                }
                self.terminate();
                None
            }
            Err(e) => {
                warn!(conn_id = %self.id, peer = %self.peer, error = %e, "dropping connection after bad frame");
                self.close(MALFORMED_PACKET_REASON);
                None
            }
        }
    }
}

impl ResponseSink for Connection {
    fn send_response(&self, response: Response) -> Result<(), ConnectionError> {
        Connection::send_response(self, &response)
    }
}

async fn write_loop(
    mut writer: BoxedWriter,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
    id: Uuid,
    peer: String,
) {
    while let Some(item) = rx.recv().await {
        let (frame, last) = match item {
            Outbound::Frame(frame) => (Some(frame), false),
            Outbound::Close { farewell } => (farewell, true),
        };

        if let Some(frame) = frame {
            if let Err(e) = writer.write_all(&frame).await {
                if is_peer_reset(&e) {
                    debug!(conn_id = %id, peer = %peer, error = %e, "peer went away during write");
                } else {
                    warn!(conn_id = %id, peer = %peer, error = %e, "write failed");
                }
                cancel.cancel();
                break;
            }
        }

        if last {
            break;
        }
    }

    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
    trace!(conn_id = %id, "writer task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_response, PacketType};
    use tokio::io::{duplex, AsyncReadExt};

    async fn read_all(mut stream: tokio::io::DuplexStream) -> Vec<u8> {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        buf
    }

    fn frames(bytes: &[u8]) -> Vec<Response> {
        bytes
            .split_inclusive(|&b| b == 0)
            .map(|frame| decode_response(frame).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_packets_leave_in_queue_order() {
        let (local, remote) = duplex(4096);
        let (conn, _reader) = Connection::open(local, "test");

        conn.send_response(&Response::login()).unwrap();
        conn.send_response(&Response::keep_alive()).unwrap();
        conn.terminate();

        let received = frames(&read_all(remote).await);
        assert_eq!(received, vec![Response::login(), Response::keep_alive()]);
    }

    #[tokio::test]
    async fn test_close_sends_exactly_one_disconnect() {
        let (local, remote) = duplex(4096);
        let (conn, _reader) = Connection::open(local, "test");

        assert!(conn.close("Server shutting down"));
        assert!(!conn.close("second reason"));
        assert!(!conn.terminate());

        let received = frames(&read_all(remote).await);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].packet_type(), PacketType::Disconnect);
        assert_eq!(received[0].message(), Some("Server shutting down"));
    }

    #[tokio::test]
    async fn test_close_without_farewell_sends_nothing() {
        // Arrange
        let (local, remote) = duplex(4096);
        let (conn, _reader) = Connection::open_without_farewell(local, "test");
        conn.send_request(&Request::keep_alive()).unwrap();

        // Act
        assert!(conn.close("Client shutting down"));

        // Assert
        let received = read_all(remote).await;
        assert_eq!(received, encode_request(&Request::keep_alive()).unwrap());
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_malformed_frame_without_farewell_closes_silently() {
        let (local, mut remote) = duplex(4096);
        let (conn, mut reader) = Connection::open_without_farewell(local, "test");
        tokio::io::AsyncWriteExt::write_all(&mut remote, b"not json\0")
            .await
            .unwrap();

        let packet = conn.recv(&mut reader, decode_response).await;

        assert!(packet.is_none());
        assert!(read_all(remote).await.is_empty());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (local, _remote) = duplex(4096);
        let (conn, _reader) = Connection::open(local, "test");

        conn.terminate();

        assert!(!conn.is_open());
        assert!(matches!(
            conn.send_response(&Response::keep_alive()),
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_recv_returns_none_when_peer_closes() {
        let (local, remote) = duplex(4096);
        let (conn, mut reader) = Connection::open(local, "test");
        drop(remote);

        let packet = conn.recv(&mut reader, decode_response).await;

        assert!(packet.is_none());
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_recv_closes_on_malformed_frame() {
        let (local, mut remote) = duplex(4096);
        let (conn, mut reader) = Connection::open(local, "test");
        tokio::io::AsyncWriteExt::write_all(&mut remote, b"not json\0")
            .await
            .unwrap();

        let packet = conn.recv(&mut reader, decode_response).await;

        assert!(packet.is_none());
        let received = frames(&read_all(remote).await);
        assert_eq!(received[0].message(), Some(MALFORMED_PACKET_REASON));
    }

    #[tokio::test]
    async fn test_recv_stops_after_local_close() {
        let (local, _remote) = duplex(4096);
        let (conn, mut reader) = Connection::open(local, "test");

        let reading = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.recv(&mut reader, decode_response).await })
        };
        conn.close("bye");

        assert!(reading.await.unwrap().is_none());
    }

    #[test]
    fn test_peer_reset_classification() {
        assert!(is_peer_reset(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_peer_reset(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!is_peer_reset(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
