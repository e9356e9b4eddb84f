//! Server and client front-ends for the executor.
//!
//! Either role drives the same [`ExecutorSession`]; only the connection
//! manager differs.  [`ExecutorNode`] hides that choice from `main`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use effectlink_core::session::{ClientManager, NetworkError, ServerManager, SessionState};
use effectlink_core::{Response, ResponseConfig, ValidationError};

use super::session::{ExecutorSession, ExecutorSessionFactory};

/// Listens for requesters.
pub type ExecutorServer = ServerManager<ExecutorSessionFactory>;

/// Dials a requester and reconnects with backoff.
pub type ExecutorClient = ClientManager<ExecutorSessionFactory>;

/// A running executor in either connection role.
#[derive(Debug, Clone)]
pub enum ExecutorNode {
    Server(Arc<ExecutorServer>),
    Client(Arc<ExecutorClient>),
}

impl ExecutorNode {
    /// Binds `addr` and returns a server node.  Call [`run`](Self::run) to
    /// start accepting.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::Bind`] if the address cannot be bound.
    pub async fn listen(
        addr: &str,
        factory: ExecutorSessionFactory,
    ) -> Result<Self, NetworkError> {
        let server = ExecutorServer::bind(addr, factory).await?;
        info!(addr = %server.local_addr(), "executor listening");
        Ok(Self::Server(server))
    }

    /// A client node that will dial `remote`.
    pub fn connect(remote: &str, factory: ExecutorSessionFactory, max_backoff: Duration) -> Self {
        info!(%remote, "executor will connect out");
        Self::Client(ExecutorClient::new(remote, factory, max_backoff))
    }

    /// Runs the accept or reconnect loop until [`shutdown`](Self::shutdown).
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

    /// Sessions that finished their handshake.
    pub fn ready_sessions(&self) -> Vec<Arc<ExecutorSession>> {
        let sessions = match self {
            Self::Server(server) => server.sessions(),
            Self::Client(client) => client.current().into_iter().collect(),
        };
        sessions
            .into_iter()
            .filter(|session| session.state() == SessionState::Ready)
            .collect()
    }

    /// Sends an EFFECT_STATUS to every ready session.  Returns how many
    /// sessions it was queued for.
    ///
    /// # Errors
    ///
    /// Returns the [`ValidationError`] if `status` is not a valid response.
    pub fn broadcast_status(&self, status: ResponseConfig) -> Result<usize, ValidationError> {
        let response = Response::new(status)?;
        let mut sent = 0;
        for session in self.ready_sessions() {
            match session.connection().send_response(&response) {
                Ok(()) => sent += 1,
                Err(e) => debug!(peer = %session.connection().peer(), error = %e, "status not sent"),
            }
        }
        Ok(sent)
    }
}
