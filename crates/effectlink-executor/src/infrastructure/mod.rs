//! Infrastructure layer for the executor.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `effectlink_core`, but is never imported by `application`.
//!
//! - **`network`** – executor sessions and the server/client front-ends.
//! - **`storage`** – configuration file loading and saving.

pub mod network;
pub mod storage;
