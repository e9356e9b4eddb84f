//! Network infrastructure for the executor.
//!
//! - **`session`** – the executor half of the protocol: password handshake,
//!   keep-alive replies, and hand-off of every other request to the
//!   dispatcher.
//! - **`frontend`** – the server and client roles built from the core
//!   connection managers.

pub mod frontend;
pub mod session;

pub use frontend::{ExecutorClient, ExecutorNode, ExecutorServer};
pub use session::{
    ExecutorSession, ExecutorSessionFactory, ExecutorSettings, INCORRECT_PASSWORD_REASON,
};
