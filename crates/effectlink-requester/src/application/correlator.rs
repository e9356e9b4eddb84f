//! Outbound request correlation.
//!
//! Every effect request the requester sends gets an entry in the pending
//! table, keyed by request id, **before** the request is written.  The
//! session read loop feeds each EFFECT_RESULT to [`Correlator::route`],
//! which forwards it to the [`ResponseStream`] returned by
//! [`Correlator::send`].
//!
//! ```text
//! send(START id=7) ──► pending[7] ──► stream: SUCCESS(10s) .. PAUSED .. FINISHED ┤
//!                         │
//!                         ├─ RETRY + auto_retry ──► resend after 4s, 8s, 16s, 32s
//!                         ├─ no response within timeout ──► Err(Timeout)
//!                         └─ session gone ──► Err(ShuttingDown) after the grace period
//! ```
//!
//! A stream yields zero or more responses, then either ends (a terminating
//! response was seen) or yields exactly one error.  Dropping the stream
//! forgets the entry; late responses for it are logged and dropped.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use effectlink_core::protocol::{Request, Response, ResultType};
use effectlink_core::session::{Connection, ConnectionError};
use effectlink_core::{TimerHandle, TimerService};

/// Default cap on automatic resends after RETRY.
pub const DEFAULT_MAX_RETRIES: u32 = 4;

/// Default delay between a session ending and its pending requests failing.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Errors surfaced on a [`ResponseStream`] or by [`Correlator::send`].
#[derive(Debug, Error)]
pub enum CorrelationError {
    /// No response arrived within the configured timeout.
    #[error("request {id} timed out after {after:?}")]
    Timeout { id: u32, after: Duration },

    /// The session carrying the request ended before it finished.
    #[error("connection shut down before request completed")]
    ShuttingDown,

    /// Another request with the same id is still pending.
    #[error("request id {0} is already pending")]
    DuplicateId(u32),

    /// The request could not be written.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Anything a request can be written to.
pub trait RequestTransport: Send + Sync + 'static {
    /// Queues `request` for sending.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] when the connection is gone.
    fn send_request(&self, request: &Request) -> Result<(), ConnectionError>;
}

impl RequestTransport for Connection {
    fn send_request(&self, request: &Request) -> Result<(), ConnectionError> {
        Connection::send_request(self, request)
    }
}

/// Timeout and retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelatorConfig {
    /// Budget for the first response after each send; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Resend automatically on RETRY instead of forwarding it.
    pub auto_retry: bool,
    pub max_retries: u32,
    pub shutdown_grace: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            auto_retry: false,
            max_retries: DEFAULT_MAX_RETRIES,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// `2^(2 + retry_count)` seconds: 4, 8, 16, 32, ...
pub fn retry_delay(retry_count: u32) -> Duration {
    let secs = 1u64
        .checked_shl(retry_count.saturating_add(2))
        .unwrap_or(u64::MAX);
    Duration::from_secs(secs)
}

type Item = Result<Response, CorrelationError>;

struct Pending {
    request: Request,
    /// Distinguishes this entry from a later one that reuses the id.
    token: u64,
    tx: mpsc::UnboundedSender<Item>,
    retries: u32,
    /// Bumped whenever the timeout is armed or disarmed.
    deadline: u64,
    timeout: Option<TimerHandle>,
    resend: Option<TimerHandle>,
}

impl Pending {
    fn disarm_timeout(&mut self) {
        self.deadline += 1;
        if let Some(handle) = self.timeout.take() {
            handle.cancel();
        }
    }

    fn cancel_timers(&mut self) {
        self.disarm_timeout();
        if let Some(handle) = self.resend.take() {
            handle.cancel();
        }
    }

    fn finish(mut self, item: Item) {
        self.cancel_timers();
        let _ = self.tx.send(item);
    }
}

struct Inner {
    transport: Arc<dyn RequestTransport>,
    timer: TimerService,
    config: CorrelatorConfig,
    pending: DashMap<u32, Pending>,
    tokens: AtomicU64,
}

/// Tracks in-flight requests for one session.  Cheap to clone.
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("config", &self.inner.config)
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}

impl Correlator {
    pub fn new(
        transport: Arc<dyn RequestTransport>,
        timer: TimerService,
        config: CorrelatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                timer,
                config,
                pending: DashMap::new(),
                tokens: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.inner.config
    }

    /// Number of requests still waiting for a terminating response.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_pending(&self, id: u32) -> bool {
        self.inner.pending.contains_key(&id)
    }

    /// Registers and writes `request`.
    ///
    /// Only effect requests (TEST, START, STOP) are answered; anything else
    /// is written and gets an already-finished stream.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::DuplicateId`] if the id is already pending,
    /// or [`CorrelationError::Connection`] if the write fails (the entry is
    /// removed again in that case).
    pub fn send(&self, request: Request) -> Result<ResponseStream, CorrelationError> {
        let inner = &self.inner;
        if !request.request_type().is_effect_type() {
            inner.transport.send_request(&request)?;
            return Ok(ResponseStream::finished(request.id()));
        }

        let id = request.id();
        let token = inner.tokens.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        match inner.pending.entry(id) {
            Entry::Occupied(_) => return Err(CorrelationError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                let mut entry = slot.insert(Pending {
                    request: request.clone(),
                    token,
                    tx,
                    retries: 0,
                    deadline: 0,
                    timeout: None,
                    resend: None,
                });
                self.arm_timeout(id, &mut entry);
            }
        }

        if let Err(e) = inner.transport.send_request(&request) {
            self.forget(id, token);
            return Err(e.into());
        }
        debug!(request_id = id, effect = ?request.effect(), "request sent");

        Ok(ResponseStream {
            id,
            token,
            rx,
            owner: Arc::downgrade(inner),
        })
    }

    /// Hands a response from the session read loop to its waiting stream.
    ///
    /// Returns `false` if no request with that id is pending.
    pub fn route(&self, response: Response) -> bool {
        let inner = &self.inner;
        let id = response.id();

        if response.result_type() == Some(ResultType::Retry) && inner.config.auto_retry {
            let Some(mut entry) = inner.pending.get_mut(&id) else {
                debug!(request_id = id, "RETRY for unknown request dropped");
                return false;
            };
            if entry.retries < inner.config.max_retries {
                entry.disarm_timeout();
                let delay = retry_delay(entry.retries);
                entry.retries += 1;
                let attempt = entry.retries;
                debug!(request_id = id, attempt, ?delay, "executor asked to retry");
                let owner = Arc::downgrade(inner);
                entry.resend = Some(inner.timer.schedule(delay, async move {
                    if let Some(inner) = owner.upgrade() {
                        Correlator { inner }.resend(id, attempt);
                    }
                }));
                return true;
            }
            drop(entry);
            info!(request_id = id, "retries exhausted");
            if let Some((_, pending)) = inner.pending.remove(&id) {
                pending.finish(Ok(response));
            }
            return true;
        }

        if response.is_terminating() {
            return match inner.pending.remove(&id) {
                Some((_, pending)) => {
                    pending.finish(Ok(response));
                    true
                }
                None => {
                    debug!(request_id = id, "response for unknown request dropped");
                    false
                }
            };
        }

        let Some(mut entry) = inner.pending.get_mut(&id) else {
            debug!(request_id = id, "response for unknown request dropped");
            return false;
        };
        entry.disarm_timeout();
        let token = entry.token;
        let delivered = entry.tx.send(Ok(response)).is_ok();
        drop(entry);
        if !delivered {
            self.forget(id, token);
        }
        true
    }

    /// After `grace`, fails every request still pending with
    /// [`CorrelationError::ShuttingDown`].
    pub fn fail_pending_after(&self, grace: Duration) -> TimerHandle {
        let owner = Arc::downgrade(&self.inner);
        self.inner.timer.schedule(grace, async move {
            if let Some(inner) = owner.upgrade() {
                Correlator { inner }.fail_all();
            }
        })
    }

    /// Fails every pending request now.
    pub fn fail_all(&self) {
        let ids: Vec<u32> = self.inner.pending.iter().map(|entry| *entry.key()).collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "failing pending requests");
        }
        for id in ids {
            if let Some((_, pending)) = self.inner.pending.remove(&id) {
                pending.finish(Err(CorrelationError::ShuttingDown));
            }
        }
    }

    fn arm_timeout(&self, id: u32, pending: &mut Pending) {
        let Some(after) = self.inner.config.timeout else {
            return;
        };
        pending.disarm_timeout();
        let deadline = pending.deadline;
        let token = pending.token;
        let owner = Arc::downgrade(&self.inner);
        pending.timeout = Some(self.inner.timer.schedule(after, async move {
            if let Some(inner) = owner.upgrade() {
                Correlator { inner }.expire(id, token, deadline, after);
            }
        }));
    }

    fn expire(&self, id: u32, token: u64, deadline: u64, after: Duration) {
        let expired = self
            .inner
            .pending
            .remove_if(&id, |_, p| p.token == token && p.deadline == deadline);
        if let Some((_, mut pending)) = expired {
            warn!(request_id = id, ?after, "request timed out");
            pending.timeout = None;
            pending.finish(Err(CorrelationError::Timeout { id, after }));
        }
    }

    fn resend(&self, id: u32, attempt: u32) {
        let Some(mut entry) = self.inner.pending.get_mut(&id) else {
            return;
        };
        if entry.retries != attempt {
            return;
        }
        entry.resend = None;

        match self.inner.transport.send_request(&entry.request) {
            Ok(()) => {
                debug!(request_id = id, attempt, "request resent");
                self.arm_timeout(id, &mut entry);
            }
            Err(e) => {
                let token = entry.token;
                drop(entry);
                let removed = self.inner.pending.remove_if(&id, |_, p| p.token == token);
                if let Some((_, pending)) = removed {
                    pending.finish(Err(e.into()));
                }
            }
        }
    }

    fn forget(&self, id: u32, token: u64) {
        let removed = self.inner.pending.remove_if(&id, |_, p| p.token == token);
        if let Some((_, mut pending)) = removed {
            pending.cancel_timers();
        }
    }
}

/// Responses to one request, in arrival order.
#[derive(Debug)]
pub struct ResponseStream {
    id: u32,
    token: u64,
    rx: mpsc::UnboundedReceiver<Item>,
    owner: Weak<Inner>,
}

impl ResponseStream {
    /// A stream that is already over, for requests nobody answers.
    fn finished(id: u32) -> Self {
        let (_, rx) = mpsc::unbounded_channel();
        Self {
            id,
            token: 0,
            rx,
            owner: Weak::new(),
        }
    }

    /// The request id this stream answers.
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Stream for ResponseStream {
    type Item = Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if let Some(inner) = self.owner.upgrade() {
            Correlator { inner }.forget(self.id, self.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use effectlink_core::protocol::{RequestConfig, RequestType, ResponseConfig};
    use futures::StreamExt;
    use parking_lot::Mutex;
    use tokio_test::{assert_pending, assert_ready};

    /// Records every request written.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Request>>,
        closed: std::sync::atomic::AtomicBool,
    }

    impl RecordingTransport {
        fn sent_ids(&self) -> Vec<u32> {
            self.sent.lock().iter().map(Request::id).collect()
        }
    }

    impl RequestTransport for RecordingTransport {
        fn send_request(&self, request: &Request) -> Result<(), ConnectionError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ConnectionError::Closed);
            }
            self.sent.lock().push(request.clone());
            Ok(())
        }
    }

    fn correlator(config: CorrelatorConfig) -> (Correlator, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let correlator = Correlator::new(
            Arc::clone(&transport) as Arc<dyn RequestTransport>,
            TimerService::new(),
            config,
        );
        (correlator, transport)
    }

    fn start(id: u32) -> Request {
        Request::new(RequestConfig {
            id,
            ..RequestConfig::effect(RequestType::Start, "freeze")
        })
        .unwrap()
    }

    fn result(id: u32, result: ResultType) -> Response {
        ResponseConfig::for_request(&start(id), result)
            .build()
            .unwrap()
    }

    fn timed_success(id: u32) -> Response {
        ResponseConfig::for_request(&start(id), ResultType::Success)
            .with_time_remaining(Duration::from_secs(10))
            .build()
            .unwrap()
    }

    // ── Routing ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_terminating_response_completes_stream() {
        // Arrange
        let (correlator, transport) = correlator(CorrelatorConfig::default());
        let mut stream = correlator.send(start(1)).unwrap();

        // Act
        assert!(correlator.route(result(1, ResultType::Success)));

        // Assert
        let reply = stream.next().await.unwrap().unwrap();
        assert_eq!(reply.result_type(), Some(ResultType::Success));
        assert!(stream.next().await.is_none());
        assert_eq!(transport.sent_ids(), vec![1]);
        assert_eq!(correlator.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_timed_effect_streams_every_update() {
        let (correlator, _) = correlator(CorrelatorConfig::default());
        let stream = correlator.send(start(4)).unwrap();

        correlator.route(timed_success(4));
        correlator.route(result(4, ResultType::Paused));
        correlator.route(result(4, ResultType::Resumed));
        correlator.route(result(4, ResultType::Finished));

        let results: Vec<_> = stream
            .map(|item| item.unwrap().result_type().unwrap())
            .collect()
            .await;
        assert_eq!(
            results,
            vec![
                ResultType::Success,
                ResultType::Paused,
                ResultType::Resumed,
                ResultType::Finished
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_id_is_dropped() {
        let (correlator, _) = correlator(CorrelatorConfig::default());
        assert!(!correlator.route(result(99, ResultType::Success)));
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let (correlator, _) = correlator(CorrelatorConfig::default());
        let _first = correlator.send(start(5)).unwrap();

        let second = correlator.send(start(5));

        assert!(matches!(second, Err(CorrelationError::DuplicateId(5))));
    }

    #[tokio::test]
    async fn test_failed_write_removes_entry() {
        let (correlator, transport) = correlator(CorrelatorConfig::default());
        transport.closed.store(true, Ordering::SeqCst);

        let result = correlator.send(start(6));

        assert!(matches!(
            result,
            Err(CorrelationError::Connection(ConnectionError::Closed))
        ));
        assert!(!correlator.is_pending(6));
    }

    #[tokio::test]
    async fn test_dropping_stream_forgets_request() {
        let (correlator, _) = correlator(CorrelatorConfig::default());
        let stream = correlator.send(start(7)).unwrap();
        assert!(correlator.is_pending(7));

        drop(stream);

        assert!(!correlator.is_pending(7));
        assert!(!correlator.route(result(7, ResultType::Success)));
    }

    #[tokio::test]
    async fn test_non_effect_request_gets_finished_stream() {
        let (correlator, transport) = correlator(CorrelatorConfig::default());
        let info = Request::new(RequestConfig {
            player: Some(effectlink_core::Target::with_id("me")),
            ..RequestConfig::new(RequestType::PlayerInfo)
        })
        .unwrap();

        let mut stream = correlator.send(info).unwrap();

        assert!(stream.next().await.is_none());
        assert_eq!(transport.sent.lock().len(), 1);
        assert_eq!(correlator.pending_len(), 0);
    }

    // ── Timeouts ─────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_at_budget_not_before() {
        let (correlator, _) = correlator(CorrelatorConfig {
            timeout: Some(Duration::from_millis(50)),
            ..CorrelatorConfig::default()
        });
        let mut stream = tokio_test::task::spawn(correlator.send(start(1)).unwrap());

        tokio::time::sleep(Duration::from_millis(49)).await;
        assert_pending!(stream.poll_next());

        tokio::time::sleep(Duration::from_millis(2)).await;
        let item = assert_ready!(stream.poll_next());
        assert!(matches!(
            item,
            Some(Err(CorrelationError::Timeout { id: 1, .. }))
        ));
        assert!(assert_ready!(stream.poll_next()).is_none());
        assert_eq!(correlator.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_response_cancels_timeout() {
        let (correlator, _) = correlator(CorrelatorConfig {
            timeout: Some(Duration::from_millis(50)),
            ..CorrelatorConfig::default()
        });
        let mut stream = correlator.send(start(2)).unwrap();

        correlator.route(timed_success(2));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(stream.next().await.unwrap().is_ok());
        assert!(correlator.is_pending(2));
    }

    // ── Retries ──────────────────────────────────────────────────────────────

    #[test]
    fn test_retry_delay_doubles_from_four_seconds() {
        let delays: Vec<u64> = (0..4).map(|n| retry_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![4, 8, 16, 32]);
        assert_eq!(retry_delay(u32::MAX), Duration::from_secs(u64::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_retry_resends_after_backoff() {
        // Arrange
        let (correlator, transport) = correlator(CorrelatorConfig {
            auto_retry: true,
            ..CorrelatorConfig::default()
        });
        let mut stream = tokio_test::task::spawn(correlator.send(start(3)).unwrap());

        // Act
        correlator.route(result(3, ResultType::Retry));

        // Assert
        assert_pending!(stream.poll_next());
        tokio::time::sleep(Duration::from_millis(3_900)).await;
        assert_eq!(transport.sent_ids(), vec![3]);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.sent_ids(), vec![3, 3]);

        correlator.route(result(3, ResultType::Success));
        let reply = assert_ready!(stream.poll_next()).unwrap().unwrap();
        assert_eq!(reply.result_type(), Some(ResultType::Success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_is_forwarded_once_retries_run_out() {
        let (correlator, transport) = correlator(CorrelatorConfig {
            auto_retry: true,
            max_retries: 1,
            ..CorrelatorConfig::default()
        });
        let mut stream = correlator.send(start(8)).unwrap();

        correlator.route(result(8, ResultType::Retry));
        tokio::time::sleep(Duration::from_secs(5)).await;
        correlator.route(result(8, ResultType::Retry));

        let reply = stream.next().await.unwrap().unwrap();
        assert_eq!(reply.result_type(), Some(ResultType::Retry));
        assert!(stream.next().await.is_none());
        assert_eq!(transport.sent_ids(), vec![8, 8]);
    }

    #[tokio::test]
    async fn test_retry_without_auto_retry_is_intermediate() {
        let (correlator, _) = correlator(CorrelatorConfig::default());
        let mut stream = correlator.send(start(9)).unwrap();

        correlator.route(result(9, ResultType::Retry));

        let reply = stream.next().await.unwrap().unwrap();
        assert_eq!(reply.result_type(), Some(ResultType::Retry));
        assert!(correlator.is_pending(9));
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_fail_pending_after_grace() {
        let (correlator, _) = correlator(CorrelatorConfig::default());
        let mut stream = tokio_test::task::spawn(correlator.send(start(10)).unwrap());

        correlator.fail_pending_after(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_pending!(stream.poll_next());
        tokio::time::sleep(Duration::from_millis(2)).await;

        let item = assert_ready!(stream.poll_next());
        assert!(matches!(item, Some(Err(CorrelationError::ShuttingDown))));
    }
}
