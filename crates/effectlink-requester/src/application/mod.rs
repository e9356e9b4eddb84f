//! Application layer of the requester.
//!
//! - **`correlator`** – matches responses to the requests that caused them,
//!   with timeouts, automatic retry and shutdown handling.

pub mod correlator;

pub use correlator::{
    retry_delay, CorrelationError, Correlator, CorrelatorConfig, RequestTransport, ResponseStream,
};
