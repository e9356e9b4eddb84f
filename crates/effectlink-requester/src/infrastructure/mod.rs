//! Infrastructure layer for the requester.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `effectlink_core`, but is never imported by `application`.
//!
//! - **`network`** – requester sessions and the client/server front-ends.
//! - **`storage`** – configuration file loading and saving.

pub mod network;
pub mod storage;
