//! effectlink-executor library entry point.
//!
//! The executor is the side that actually runs effects (typically a game).
//! It accepts requests from a requester, checks the optional password,
//! answers keep-alives, and hands every effect request to an
//! [`EffectRegistry`](application::EffectRegistry).
//!
//! The binary in `main.rs` and the integration tests in `tests/` share this
//! module tree.

/// Application layer: the effect registry.
pub mod application;

/// Infrastructure layer: sessions, front-ends and configuration.
pub mod infrastructure;
