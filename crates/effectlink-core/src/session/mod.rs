//! Connection lifecycle: the duplex [`Connection`], the [`SessionState`]
//! machine, and the client/server managers that keep sessions running.

pub mod connection;
pub mod manager;
pub mod state;

pub use connection::{
    is_peer_reset, BoxedReader, Connection, ConnectionError, MALFORMED_PACKET_REASON,
};
pub use manager::{
    backoff_delay, ClientManager, ManagedSession, NetworkError, ServerManager, SessionFactory,
    CLIENT_SHUTDOWN_REASON, DEFAULT_SWEEP_INTERVAL, SERVER_SHUTDOWN_REASON,
};
pub use state::{SessionState, StateCell};

use serde::{Deserialize, Serialize};

/// Which side of the TCP connection a front-end takes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Listen and accept peers.
    #[default]
    Server,
    /// Connect out to a peer and reconnect on loss.
    Client,
}
