//! effectlink-requester library entry point.
//!
//! The requester is the control side: it asks an executor to test, start or
//! stop effects and follows each request's responses until the effect ends.
//! Connections are made in either direction (see
//! [`RequesterNode`](infrastructure::network::RequesterNode)); every session
//! owns a [`Correlator`](application::Correlator) that routes results back to
//! the caller's stream.

/// Application layer: response correlation.
pub mod application;

/// Infrastructure layer: sessions, front-ends and configuration.
pub mod infrastructure;
