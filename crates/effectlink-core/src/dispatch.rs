//! Contract between an executor session and the code that runs effects.
//!
//! The session decodes a request and hands it to an [`EffectDispatcher`] on
//! a task of its own.  The dispatcher may answer immediately by returning a
//! [`DispatchOutcome`], or keep the [`Responder`] and send any number of
//! responses later (timed effects send SUCCESS, PAUSED, RESUMED, FINISHED
//! over several seconds).

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::protocol::{Request, Response, ResponseConfig, ResultType, ValidationError};
use crate::session::ConnectionError;

/// Anything that can carry responses back to the requester.
pub trait ResponseSink: Send + Sync {
    /// Queues one response.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] when the peer is gone.
    fn send_response(&self, response: Response) -> Result<(), ConnectionError>;
}

impl ResponseSink for mpsc::UnboundedSender<Response> {
    fn send_response(&self, response: Response) -> Result<(), ConnectionError> {
        self.send(response).map_err(|_| ConnectionError::Closed)
    }
}

/// Cloneable handle for answering one or more requests at any later time.
#[derive(Clone)]
pub struct Responder {
    sink: Arc<dyn ResponseSink>,
}

impl Responder {
    pub fn new(sink: Arc<dyn ResponseSink>) -> Self {
        Self { sink }
    }

    /// Returns a responder whose responses arrive on a channel.  Used by tests
    /// and by in-process executors.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Response>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(Arc::new(tx)), rx)
    }

    /// Sends a response.  A closed connection is logged and otherwise ignored:
    /// work that outlives its connection has nobody left to tell.
    pub fn send(&self, response: Response) {
        let id = response.id();
        if let Err(e) = self.sink.send_response(response) {
            debug!(request_id = id, error = %e, "dropping response for closed connection");
        }
    }

    /// Validates and sends a response.
    ///
    /// # Errors
    ///
    /// Returns the [`ValidationError`] if the config is not a valid response;
    /// nothing is sent in that case.
    pub fn send_config(&self, config: ResponseConfig) -> Result<(), ValidationError> {
        let response = config.build()?;
        self.send(response);
        Ok(())
    }

    /// Sends `result` for `request` with an optional message.
    pub fn reply(&self, request: &Request, result: ResultType, message: Option<&str>) {
        let mut config = ResponseConfig::for_request(request, result);
        config.message = message.map(str::to_string);
        match config.build() {
            Ok(response) => self.send(response),
            Err(e) => warn!(request_id = request.id(), error = %e, "could not build reply"),
        }
    }

    /// Sends a FAILURE for `request` carrying `message`.
    pub fn fail(&self, request: &Request, message: &str) {
        self.reply(request, ResultType::Failure, Some(message));
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder").finish_non_exhaustive()
    }
}

/// What a dispatcher wants sent once `dispatch` returns.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The dispatcher already answered (or will answer) through the responder.
    Handled,
    /// Send this response as-is.
    Respond(Response),
    /// Validate and send this response; an invalid config becomes FAILURE.
    Build(ResponseConfig),
}

/// Runs effects for one executor.
#[async_trait]
pub trait EffectDispatcher: Send + Sync + 'static {
    /// Handles one non-internal request.
    ///
    /// Returning `Err` (or panicking) produces a single FAILURE response for
    /// the request id.
    async fn dispatch(
        &self,
        request: Request,
        responder: Responder,
    ) -> anyhow::Result<DispatchOutcome>;
}

/// Calls `dispatcher` and turns its outcome, error or panic into responses.
pub async fn dispatch_guarded(
    dispatcher: &dyn EffectDispatcher,
    request: Request,
    responder: Responder,
) {
    let result = AssertUnwindSafe(dispatcher.dispatch(request.clone(), responder.clone()))
        .catch_unwind()
        .await;

    match result {
        Ok(Ok(DispatchOutcome::Handled)) => {}
        Ok(Ok(DispatchOutcome::Respond(response))) => responder.send(response),
        Ok(Ok(DispatchOutcome::Build(config))) => {
            if let Err(e) = responder.send_config(config) {
                warn!(request_id = request.id(), error = %e, "dispatcher built an invalid response");
                responder.fail(&request, &format!("Invalid response: {e}"));
            }
        }
        Ok(Err(e)) => {
            warn!(request_id = request.id(), effect = ?request.effect(), error = %e, "effect dispatch failed");
            responder.fail(&request, &e.to_string());
        }
        Err(_) => {
            error!(request_id = request.id(), effect = ?request.effect(), "effect dispatcher panicked");
            responder.fail(&request, "Effect handler panicked");
        }
    }
}
