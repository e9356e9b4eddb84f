//! Server and client front-ends for the requester.
//!
//! [`RequesterNode::Client`] dials one executor and reconnects with backoff;
//! [`RequesterNode::Server`] accepts any number of executors and can
//! broadcast a request to all of them.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, info};

use effectlink_core::protocol::{RequestConfig, Response};
use effectlink_core::session::{ClientManager, NetworkError, ServerManager};

use super::session::{RequestError, RequesterSession, RequesterSessionFactory};
use crate::application::{CorrelationError, ResponseStream};

/// Accepts executors.
pub type RequesterServer = ServerManager<RequesterSessionFactory>;

/// Dials an executor and reconnects with backoff.
pub type RequesterClient = ClientManager<RequesterSessionFactory>;

/// Responses from several executors, merged in arrival order.
///
/// Each executor's stream keeps its own contract (at most one error, then
/// nothing more from it), so the merged stream carries up to one error per
/// executor and ends only when every executor's stream has ended.
pub type MergedResponses = BoxStream<'static, Result<Response, CorrelationError>>;

/// A running requester in either connection role.
#[derive(Debug, Clone)]
pub enum RequesterNode {
    Server(Arc<RequesterServer>),
    Client(Arc<RequesterClient>),
}

impl RequesterNode {
    /// Binds `addr` and returns a server node.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Bind`] if the address cannot be bound.
    pub async fn listen(
        addr: &str,
        factory: RequesterSessionFactory,
    ) -> Result<Self, NetworkError> {
        let server = RequesterServer::bind(addr, factory).await?;
        info!(addr = %server.local_addr(), "requester listening for executors");
        Ok(Self::Server(server))
    }

    /// A client node that will dial the executor at `remote`.
    pub fn connect(remote: &str, factory: RequesterSessionFactory, max_backoff: Duration) -> Self {
        info!(%remote, "requester will connect to executor");
        Self::Client(RequesterClient::new(remote, factory, max_backoff))
    }

    pub async fn run(&self) {
        match self {
            Self::Server(server) => Arc::clone(server).run().await,
            Self::Client(client) => Arc::clone(client).run().await,
        }
    }

    pub fn shutdown(&self) {
        match self {
            Self::Server(server) => server.shutdown(),
            Self::Client(client) => client.shutdown(),
        }
    }

    fn factory(&self) -> &RequesterSessionFactory {
        match self {
            Self::Server(server) => server.factory(),
            Self::Client(client) => client.factory(),
        }
    }

    /// Sessions past their handshake, oldest first.
    pub fn ready_sessions(&self) -> Vec<Arc<RequesterSession>> {
        let sessions = match self {
            Self::Server(server) => server.sessions(),
            Self::Client(client) => client.current().into_iter().collect(),
        };
        sessions
            .into_iter()
            .filter(|session| session.is_accepting_requests())
            .collect()
    }

    pub fn is_accepting_requests(&self) -> bool {
        !self.ready_sessions().is_empty()
    }

    /// Waits until at least one session is ready.
    pub async fn wait_ready(&self) -> Arc<RequesterSession> {
        loop {
            let changed = self.factory().readiness_changed();
            if let Some(session) = self.ready_sessions().into_iter().next() {
                return session;
            }
            changed.await;
        }
    }

    /// EFFECT_STATUS packets from every executor.
    pub fn subscribe_status(&self) -> broadcast::Receiver<Response> {
        self.factory().subscribe_status()
    }

    /// Sends `config` to one executor: the connected one in client mode, the
    /// longest-connected ready one in server mode.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::NotAccepting`] when no session is ready, or
    /// the session's own error.
    pub fn send_request(&self, config: RequestConfig) -> Result<ResponseStream, RequestError> {
        let session = self
            .ready_sessions()
            .into_iter()
            .next()
            .ok_or(RequestError::NotAccepting)?;
        session.send_request(config)
    }

    /// Sends `config` to every ready executor and merges their response
    /// streams.  Sessions that fail to take the request are skipped.
    ///
    /// An `Err` item only ends one executor's part of the merged stream;
    /// keep polling for the others.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::NotAccepting`] when no session took the
    /// request.
    pub fn broadcast(&self, config: RequestConfig) -> Result<MergedResponses, RequestError> {
        let streams: Vec<ResponseStream> = self
            .ready_sessions()
            .into_iter()
            .filter_map(|session| match session.send_request(config.clone()) {
                Ok(stream) => Some(stream),
                Err(e) => {
                    debug!(peer = %session.connection().peer(), error = %e, "broadcast skipped session");
                    None
                }
            })
            .collect();

        if streams.is_empty() {
            return Err(RequestError::NotAccepting);
        }
        debug!(sessions = streams.len(), "request broadcast");
        Ok(stream::select_all(streams).boxed())
    }
}
