//! Timed effects: effects that run for a duration, may be paused and
//! resumed, and hold exclusivity keys in the [`ActiveEffects`] table while
//! they run.
//!
//! Lifecycle:
//!
//! ```text
//! new ──queue()──► (RETRY, complete)        another effect holds a key
//!   │
//!   └──queue()/start()──► running ──pause()──► paused ──resume()──► running
//!                            │                                        │
//!                            └────────────── complete() ◄─────────────┘
//! ```
//!
//! Completion happens either when the scheduled timer fires or when
//! [`TimedEffect::complete`] is called; whichever runs first wins and the
//! other is a no-op.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::dispatch::Responder;
use crate::effects::table::{ActiveEffects, EffectKey, EffectSlot};
use crate::protocol::{Request, ResponseConfig, ResultType, Target};
use crate::timer::{TimerHandle, TimerService};

/// Message on the RETRY sent when another effect holds one of our keys.
pub const ALREADY_RUNNING_MESSAGE: &str = "Timed effect is already running";

/// Start callback.  `Ok(None)` means plain SUCCESS.
pub type StartHandler =
    Arc<dyn Fn(&Request) -> anyhow::Result<Option<ResponseConfig>> + Send + Sync>;

/// Pause, resume and completion callback.
pub type EffectHook = Arc<dyn Fn(&Request) -> anyhow::Result<()> + Send + Sync>;

/// Errors from timed-effect operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EffectError {
    /// Neither the config nor the request supplied a positive duration.
    #[error("timed effect `{0}` needs a positive duration")]
    MissingDuration(String),

    /// The operation is not valid in the effect's current state.
    #[error("cannot {operation} a timed effect that is {state}")]
    IllegalState {
        operation: &'static str,
        state: &'static str,
    },
}

/// How a timed effect left [`TimedEffect::queue`] or [`TimedEffect::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// SUCCESS was sent and completion is scheduled.
    Running,
    /// Another effect holds a key; RETRY was sent.
    Rejected,
    /// The start callback failed or returned a non-SUCCESS result, which was
    /// sent; nothing stays claimed.
    NotStarted,
}

/// Describes a timed effect before it is created.
pub struct TimedEffectConfig {
    request: Request,
    effect_group: Option<String>,
    duration: Option<Duration>,
    blocks_others: bool,
    waits_for_others: bool,
    on_start: StartHandler,
    on_pause: Option<EffectHook>,
    on_resume: Option<EffectHook>,
    on_complete: Option<EffectHook>,
}

impl TimedEffectConfig {
    /// Config for `request` running `on_start`, with every default applied:
    /// group = effect name, duration = request duration, blocks and waits.
    pub fn new<F>(request: Request, on_start: F) -> Self
    where
        F: Fn(&Request) -> anyhow::Result<Option<ResponseConfig>> + Send + Sync + 'static,
    {
        Self {
            request,
            effect_group: None,
            duration: None,
            blocks_others: true,
            waits_for_others: true,
            on_start: Arc::new(on_start),
            on_pause: None,
            on_resume: None,
            on_complete: None,
        }
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.effect_group = Some(group.into());
        self
    }

    /// Overrides the duration suggested by the request.
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Whether this effect keeps others in its group/targets from starting.
    pub fn blocks_others(mut self, blocks: bool) -> Self {
        self.blocks_others = blocks;
        self
    }

    /// Whether this effect refuses to start while another holds its keys.
    pub fn waits_for_others(mut self, waits: bool) -> Self {
        self.waits_for_others = waits;
        self
    }

    pub fn on_pause<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Request) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_pause = Some(Arc::new(hook));
        self
    }

    pub fn on_resume<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Request) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_resume = Some(Arc::new(hook));
        self
    }

    pub fn on_complete<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Request) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(hook));
        self
    }
}

#[derive(Debug, Default)]
struct Timing {
    started_at: Option<Instant>,
    remaining: Duration,
    paused: bool,
    claimed: bool,
    timer: Option<TimerHandle>,
    /// Bumped on every reschedule so a superseded timer cannot complete the effect.
    generation: u64,
}

struct Inner {
    request: Request,
    group: String,
    claim_keys: Vec<EffectKey>,
    blocking_keys: Vec<EffectKey>,
    original: Duration,
    blocks_others: bool,
    waits_for_others: bool,
    on_start: StartHandler,
    on_pause: Option<EffectHook>,
    on_resume: Option<EffectHook>,
    on_complete: Option<EffectHook>,
    slot: Arc<EffectSlot>,
    timing: Mutex<Timing>,
    table: Arc<ActiveEffects>,
    timer: TimerService,
    responder: Responder,
}

/// A running (or finished) timed effect.  Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TimedEffect {
    inner: Arc<Inner>,
}

impl fmt::Debug for TimedEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedEffect")
            .field("request_id", &self.inner.request.id())
            .field("group", &self.inner.group)
            .field("complete", &self.is_complete())
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}

impl TimedEffect {
    pub(crate) fn new(
        config: TimedEffectConfig,
        table: Arc<ActiveEffects>,
        timer: TimerService,
        responder: Responder,
    ) -> Result<Self, EffectError> {
        let request = config.request;
        let group = config
            .effect_group
            .or_else(|| request.effect().map(str::to_string))
            .unwrap_or_default();
        let original = config
            .duration
            .or(request.duration())
            .filter(|d| !d.is_zero())
            .ok_or_else(|| EffectError::MissingDuration(group.clone()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                claim_keys: EffectKey::claimed_by(&group, request.targets()),
                blocking_keys: EffectKey::blocking(&group, request.targets()),
                request,
                group,
                original,
                blocks_others: config.blocks_others,
                waits_for_others: config.waits_for_others,
                on_start: config.on_start,
                on_pause: config.on_pause,
                on_resume: config.on_resume,
                on_complete: config.on_complete,
                slot: Arc::new(EffectSlot::default()),
                timing: Mutex::new(Timing {
                    remaining: original,
                    ..Timing::default()
                }),
                table,
                timer,
                responder,
            }),
        })
    }

    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    pub fn targets(&self) -> &[Target] {
        self.inner.request.targets()
    }

    pub fn original_duration(&self) -> Duration {
        self.inner.original
    }

    pub fn is_complete(&self) -> bool {
        self.inner.slot.is_complete()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.timing.lock().paused
    }

    pub fn is_started(&self) -> bool {
        self.inner.timing.lock().started_at.is_some()
    }

    /// Time left before automatic completion, as of now.
    pub fn remaining(&self) -> Duration {
        let timing = self.inner.timing.lock();
        match (timing.started_at, timing.paused) {
            (Some(started), false) => timing.remaining.saturating_sub(started.elapsed()),
            _ => timing.remaining,
        }
    }

    /// Starts the effect unless another non-complete effect holds one of its
    /// keys, in which case RETRY is sent and the effect is marked complete.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::IllegalState`] if the effect was already queued,
    /// started or completed.
    pub fn queue(&self) -> Result<StartOutcome, EffectError> {
        self.claim(self.inner.waits_for_others, "queue")?;
        if self.claimed() {
            return Ok(self.begin());
        }

        debug!(group = %self.inner.group, request_id = self.inner.request.id(), "timed effect blocked");
        self.inner.slot.mark_complete();
        self.inner.responder.reply(
            &self.inner.request,
            ResultType::Retry,
            Some(ALREADY_RUNNING_MESSAGE),
        );
        Ok(StartOutcome::Rejected)
    }

    /// Starts the effect without checking exclusivity.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::IllegalState`] if the effect was already queued,
    /// started or completed.
    pub fn start(&self) -> Result<StartOutcome, EffectError> {
        self.claim(false, "start")?;
        Ok(self.begin())
    }

    fn claimed(&self) -> bool {
        self.inner.timing.lock().claimed
    }

    /// Checks (optionally) and claims the table keys in one critical section.
    fn claim(&self, check: bool, operation: &'static str) -> Result<(), EffectError> {
        let inner = &self.inner;
        let mut timing = inner.timing.lock();
        if inner.slot.is_complete() {
            return Err(EffectError::IllegalState { operation, state: "complete" });
        }
        if timing.started_at.is_some() || timing.claimed {
            return Err(EffectError::IllegalState { operation, state: "already started" });
        }

        let check_keys: &[EffectKey] = if check { &inner.blocking_keys } else { &[] };
        let claim_keys: &[EffectKey] = if inner.blocks_others { &inner.claim_keys } else { &[] };
        timing.claimed = inner.table.try_claim(check_keys, claim_keys, &inner.slot);
        if timing.claimed {
            timing.started_at = Some(Instant::now());
        }
        Ok(())
    }

    fn begin(&self) -> StartOutcome {
        let inner = &self.inner;
        let request = &inner.request;

        let result = catch_unwind(AssertUnwindSafe(|| (inner.on_start)(request)));
        let config = match result {
            Ok(Ok(config)) => config.unwrap_or_else(|| ResponseConfig::for_request(request, ResultType::Success)),
            Ok(Err(e)) => {
                warn!(group = %inner.group, request_id = request.id(), error = %e, "timed effect failed to start");
                self.roll_back();
                inner.responder.fail(request, &e.to_string());
                return StartOutcome::NotStarted;
            }
            Err(_) => {
                warn!(group = %inner.group, request_id = request.id(), "timed effect start callback panicked");
                self.roll_back();
                inner.responder.fail(request, "Effect start callback panicked");
                return StartOutcome::NotStarted;
            }
        };

        let config = ResponseConfig {
            id: request.id(),
            ..config
        };

        if config.result_type != Some(ResultType::Success) {
            self.roll_back();
            if let Err(e) = inner.responder.send_config(config) {
                warn!(request_id = request.id(), error = %e, "start callback returned an invalid response");
                inner.responder.fail(request, &format!("Invalid response: {e}"));
            }
            return StartOutcome::NotStarted;
        }

        let mut timing = inner.timing.lock();
        if inner.slot.is_complete() {
            // complete() ran while the start callback did; it already reported.
            return StartOutcome::NotStarted;
        }
        let remaining = timing.remaining;
        match config.with_time_remaining(remaining).build() {
            Ok(response) => inner.responder.send(response),
            Err(e) => {
                drop(timing);
                warn!(request_id = request.id(), error = %e, "start callback returned an invalid response");
                self.roll_back();
                inner.responder.fail(request, &format!("Invalid response: {e}"));
                return StartOutcome::NotStarted;
            }
        }
        self.schedule_completion(&mut timing, remaining);
        debug!(group = %inner.group, request_id = request.id(), ?remaining, "timed effect started");
        StartOutcome::Running
    }

    fn roll_back(&self) {
        self.inner.slot.mark_complete();
        self.inner.table.release(&self.inner.claim_keys, &self.inner.slot);
    }

    fn schedule_completion(&self, timing: &mut Timing, after: Duration) {
        timing.generation += 1;
        let generation = timing.generation;
        let effect = self.clone();
        timing.timer = Some(self.inner.timer.schedule(after, async move {
            effect.expire(generation);
        }));
    }

    /// Timer callback: completes the effect unless it was paused or
    /// rescheduled after this timer was armed.
    fn expire(&self, generation: u64) {
        {
            let mut timing = self.inner.timing.lock();
            if timing.paused || timing.generation != generation {
                return;
            }
            if !self.inner.slot.mark_complete() {
                return;
            }
            timing.timer = None;
        }
        self.finish(true);
    }

    /// Freezes the remaining time and sends PAUSED.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::IllegalState`] unless the effect is running.
    pub fn pause(&self) -> Result<(), EffectError> {
        let inner = &self.inner;
        let remaining = {
            let mut timing = inner.timing.lock();
            let started_at = match (timing.started_at, inner.slot.is_complete(), timing.paused) {
                (_, true, _) => {
                    return Err(EffectError::IllegalState { operation: "pause", state: "complete" })
                }
                (None, _, _) => {
                    return Err(EffectError::IllegalState { operation: "pause", state: "not started" })
                }
                (_, _, true) => {
                    return Err(EffectError::IllegalState { operation: "pause", state: "already paused" })
                }
                (Some(started_at), false, false) => started_at,
            };
            if let Some(handle) = timing.timer.take() {
                handle.cancel();
            }
            timing.remaining = timing.remaining.saturating_sub(started_at.elapsed());
            timing.paused = true;
            timing.remaining
        };

        run_hook(inner.on_pause.as_ref(), &inner.request, "pause");
        self.send_progress(ResultType::Paused, remaining);
        debug!(group = %inner.group, request_id = inner.request.id(), ?remaining, "timed effect paused");
        Ok(())
    }

    /// Restarts the clock from the frozen remaining time and sends RESUMED.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::IllegalState`] unless the effect is paused with
    /// time left.
    pub fn resume(&self) -> Result<(), EffectError> {
        let inner = &self.inner;
        let remaining = {
            let mut timing = inner.timing.lock();
            if inner.slot.is_complete() {
                return Err(EffectError::IllegalState { operation: "resume", state: "complete" });
            }
            if !timing.paused {
                return Err(EffectError::IllegalState { operation: "resume", state: "not paused" });
            }
            if timing.remaining.is_zero() {
                return Err(EffectError::IllegalState { operation: "resume", state: "out of time" });
            }
            timing.started_at = Some(Instant::now());
            timing.paused = false;
            let remaining = timing.remaining;
            self.schedule_completion(&mut timing, remaining);
            remaining
        };

        run_hook(inner.on_resume.as_ref(), &inner.request, "resume");
        self.send_progress(ResultType::Resumed, remaining);
        debug!(group = %inner.group, request_id = inner.request.id(), ?remaining, "timed effect resumed");
        Ok(())
    }

    /// Ends the effect: releases its keys, sends FINISHED and, if
    /// `run_callback`, runs the completion hook.
    ///
    /// Returns `false` (and does nothing) if the effect was already complete.
    pub fn complete(&self, run_callback: bool) -> bool {
        let inner = &self.inner;
        {
            let mut timing = inner.timing.lock();
            if !inner.slot.mark_complete() {
                return false;
            }
            if let Some(handle) = timing.timer.take() {
                handle.cancel();
            }
        }
        self.finish(run_callback);
        true
    }

    /// Releases the keys of an effect already marked complete and reports
    /// FINISHED.
    fn finish(&self, run_callback: bool) {
        let inner = &self.inner;
        inner.table.release(&inner.claim_keys, &inner.slot);
        inner
            .responder
            .reply(&inner.request, ResultType::Finished, None);
        debug!(group = %inner.group, request_id = inner.request.id(), "timed effect finished");

        if run_callback {
            run_hook(inner.on_complete.as_ref(), &inner.request, "complete");
        }
    }

    fn send_progress(&self, result: ResultType, remaining: Duration) {
        let mut config = ResponseConfig::for_request(&self.inner.request, result);
        if !remaining.is_zero() {
            config.time_remaining = Some(remaining);
        }
        if let Err(e) = self.inner.responder.send_config(config) {
            warn!(request_id = self.inner.request.id(), error = %e, "could not build progress response");
        }
    }
}

/// Runs an optional hook; faults are logged, never propagated.
fn run_hook(hook: Option<&EffectHook>, request: &Request, stage: &'static str) {
    let Some(hook) = hook else { return };
    match catch_unwind(AssertUnwindSafe(|| hook(request))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(stage, request_id = request.id(), error = %e, "timed effect hook failed");
        }
        Err(_) => {
            warn!(stage, request_id = request.id(), "timed effect hook panicked");
        }
    }
}
