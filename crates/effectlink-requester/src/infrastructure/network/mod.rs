//! Network infrastructure for the requester.
//!
//! - **`session`** – the requester half of the protocol: handshake, status
//!   fan-out, and a per-connection correlator for outgoing requests.
//! - **`frontend`** – the client and server roles built from the core
//!   connection managers.

pub mod frontend;
pub mod session;

pub use frontend::{MergedResponses, RequesterClient, RequesterNode, RequesterServer};
pub use session::{
    RequestError, RequesterSession, RequesterSessionFactory, RequesterSettings,
    PASSWORD_REQUIRED_REASON, STATUS_CHANNEL_CAPACITY,
};
