//! Application layer of the executor.
//!
//! - **`registry`** – the effect registry: effect names mapped to instant
//!   handlers or timed effects, implementing the core `EffectDispatcher`.

pub mod registry;

pub use registry::{EffectContext, EffectRegistry, TimedOptions};
