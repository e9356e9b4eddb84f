//! # effectlink-core
//!
//! Shared library for effectlink: the protocol that lets a **requester** (a
//! control application, e.g. a stream-interaction service) ask an
//! **executor** (typically a game) to run named effects and report back.
//!
//! Both applications link this crate.  It defines:
//!
//! - **`protocol`** – the request/response value types with their validation
//!   rules, and the wire codec: each packet is a UTF-8 JSON object followed by
//!   a single `0x00` byte.
//!
//! - **`session`** – one [`Connection`](session::Connection) per peer (single
//!   writer task, idempotent close), the session state machine, and the
//!   client/server managers that reconnect with backoff or accept peers.
//!
//! - **`effects`** – the exclusivity scheduler: at most one running timed
//!   effect per (effect group, target), with pause, resume and forced
//!   completion.
//!
//! - **`dispatch`** – the contract between an executor session and the code
//!   that actually runs effects.
//!
//! - **`timer`** – the shared delayed-job service used for effect completion,
//!   request timeouts and retries.

pub mod dispatch;
pub mod effects;
pub mod protocol;
pub mod session;
pub mod timer;

pub use dispatch::{DispatchOutcome, EffectDispatcher, Responder, ResponseSink};
pub use effects::{EffectError, EffectScheduler, TimedEffect, TimedEffectConfig};
pub use protocol::codec::{
    decode_request, decode_response, encode_request, encode_response, ProtocolError,
};
pub use protocol::messages::{
    PacketType, Request, RequestConfig, RequestType, Response, ResponseConfig, ResultType, Target,
    ValidationError,
};
pub use session::{Connection, ConnectionError, SessionState};
pub use timer::{TimerHandle, TimerService};
