//! Effect registry: maps effect names to the code that runs them.
//!
//! Two kinds of effect can be registered:
//!
//! - **instant** effects, an async closure that answers the request itself
//!   (or returns a [`DispatchOutcome`] for the session to send);
//! - **timed** effects, a synchronous start callback wrapped in a
//!   [`TimedEffect`].  The registry answers TEST with SUCCESS or RETRY
//!   depending on exclusivity, queues START through the shared
//!   [`EffectScheduler`], and force-completes running instances on STOP.
//!
//! Names are matched case-insensitively.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use effectlink_core::effects::{StartHandler, StartOutcome, TimedEffectConfig};
use effectlink_core::{
    DispatchOutcome, EffectDispatcher, EffectScheduler, Request, RequestType, Responder,
    ResponseConfig, ResultType, TimedEffect,
};

/// Message on the UNAVAILABLE sent for effect names nobody registered.
pub const UNKNOWN_EFFECT_MESSAGE: &str = "Unknown effect";

/// Message on the FAILURE sent for STOP when no instance is running.
pub const NOT_RUNNING_MESSAGE: &str = "Effect is not running";

type HandlerFuture = BoxFuture<'static, anyhow::Result<DispatchOutcome>>;
type EffectHandler = Arc<dyn Fn(EffectContext) -> HandlerFuture + Send + Sync>;
type NoticeHandler = Arc<dyn Fn(&Request) -> anyhow::Result<()> + Send + Sync>;

/// Everything an instant effect handler gets to work with.
#[derive(Debug, Clone)]
pub struct EffectContext {
    pub request: Request,
    pub responder: Responder,
    pub scheduler: EffectScheduler,
}

impl EffectContext {
    /// Shorthand for a plain result answering this context's request.
    pub fn outcome(&self, result: ResultType) -> DispatchOutcome {
        DispatchOutcome::Build(ResponseConfig::for_request(&self.request, result))
    }
}

/// Exclusivity and duration settings for a registered timed effect.
#[derive(Debug, Clone)]
pub struct TimedOptions {
    /// Group sharing the exclusivity key; defaults to the effect name.
    pub group: Option<String>,
    /// Fixed duration; when `None` the request's duration is used.
    pub duration: Option<Duration>,
    pub blocks_others: bool,
    pub waits_for_others: bool,
}

impl Default for TimedOptions {
    fn default() -> Self {
        Self {
            group: None,
            duration: None,
            blocks_others: true,
            waits_for_others: true,
        }
    }
}

struct TimedEntry {
    options: TimedOptions,
    on_start: StartHandler,
    running: Mutex<Vec<TimedEffect>>,
}

impl TimedEntry {
    fn group<'a>(&'a self, request: &'a Request) -> &'a str {
        self.options
            .group
            .as_deref()
            .or(request.effect())
            .unwrap_or_default()
    }

    /// Running instances, dropping the ones that have finished.
    fn live(&self) -> Vec<TimedEffect> {
        let mut running = self.running.lock();
        running.retain(|effect| !effect.is_complete());
        running.clone()
    }

    /// Records `effect` so STOP can find it, forgetting finished instances.
    fn track(&self, effect: TimedEffect) {
        let mut running = self.running.lock();
        running.retain(|held| !held.is_complete());
        running.push(effect);
    }

    fn prune(&self) {
        self.running.lock().retain(|effect| !effect.is_complete());
    }
}

enum Entry {
    Instant(EffectHandler),
    Timed(Arc<TimedEntry>),
}

/// Name → handler table implementing [`EffectDispatcher`].
pub struct EffectRegistry {
    effects: HashMap<String, Entry>,
    player_info: Option<NoticeHandler>,
    remote_function_result: Option<NoticeHandler>,
    scheduler: EffectScheduler,
}

impl Default for EffectRegistry {
    fn default() -> Self {
        Self::new(EffectScheduler::new())
    }
}

impl std::fmt::Debug for EffectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectRegistry")
            .field("effects", &self.names())
            .field("player_info", &self.player_info.is_some())
            .field("remote_function_result", &self.remote_function_result.is_some())
            .finish_non_exhaustive()
    }
}

impl EffectRegistry {
    pub fn new(scheduler: EffectScheduler) -> Self {
        Self {
            effects: HashMap::new(),
            player_info: None,
            remote_function_result: None,
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &EffectScheduler {
        &self.scheduler
    }

    /// Registers an instant effect, replacing any earlier registration of
    /// the same name.
    pub fn register<F, Fut>(&mut self, name: &str, handler: F) -> &mut Self
    where
        F: Fn(EffectContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<DispatchOutcome>> + Send + 'static,
    {
        let handler: EffectHandler = Arc::new(move |ctx| handler(ctx).boxed());
        self.insert(name, Entry::Instant(handler));
        self
    }

    /// Registers a timed effect.  `on_start` runs once the exclusivity check
    /// passes; `Ok(None)` means SUCCESS.
    pub fn register_timed<F>(
        &mut self,
        name: &str,
        options: TimedOptions,
        on_start: F,
    ) -> &mut Self
    where
        F: Fn(&Request) -> anyhow::Result<Option<ResponseConfig>> + Send + Sync + 'static,
    {
        let entry = TimedEntry {
            options,
            on_start: Arc::new(on_start),
            running: Mutex::new(Vec::new()),
        };
        self.insert(name, Entry::Timed(Arc::new(entry)));
        self
    }

    /// Handler for PLAYER_INFO notifications.
    pub fn on_player_info<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&Request) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.player_info = Some(Arc::new(handler));
        self
    }

    /// Handler for REMOTE_FUNCTION_RESULT notifications.
    pub fn on_remote_function_result<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&Request) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.remote_function_result = Some(Arc::new(handler));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.effects.contains_key(&name.to_lowercase())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.effects.keys().cloned().collect();
        names.sort();
        names
    }

    /// Pauses every running timed effect.  Returns how many were paused.
    pub fn pause_all(&self) -> usize {
        self.timed_instances()
            .filter(|effect| !effect.is_paused())
            .filter(|effect| effect.pause().is_ok())
            .count()
    }

    /// Resumes every paused timed effect.  Returns how many were resumed.
    pub fn resume_all(&self) -> usize {
        self.timed_instances()
            .filter(|effect| effect.is_paused())
            .filter(|effect| effect.resume().is_ok())
            .count()
    }

    fn timed_instances(&self) -> impl Iterator<Item = TimedEffect> + '_ {
        self.effects
            .values()
            .filter_map(|entry| match entry {
                Entry::Timed(timed) => Some(timed.live()),
                Entry::Instant(_) => None,
            })
            .flatten()
    }

    fn insert(&mut self, name: &str, entry: Entry) {
        let key = name.to_lowercase();
        if self.effects.insert(key.clone(), entry).is_some() {
            warn!(effect = %key, "effect registered twice; keeping the later handler");
        }
    }

    fn notify(
        &self,
        handler: Option<&NoticeHandler>,
        request: &Request,
    ) -> anyhow::Result<DispatchOutcome> {
        match handler {
            Some(handler) => handler(request)?,
            None => debug!(kind = request.request_type().name(), "no handler registered; ignoring"),
        }
        Ok(DispatchOutcome::Handled)
    }

    fn dispatch_timed(
        &self,
        timed: &Arc<TimedEntry>,
        request: Request,
        responder: Responder,
    ) -> anyhow::Result<DispatchOutcome> {
        match request.request_type() {
            RequestType::Test => {
                let group = timed.group(&request);
                let result = if self.scheduler.is_active(group, request.targets()) {
                    ResultType::Retry
                } else {
                    ResultType::Success
                };
                Ok(DispatchOutcome::Build(ResponseConfig::for_request(&request, result)))
            }
            RequestType::Stop => {
                let group = timed.group(&request).to_string();
                let stopped = timed
                    .live()
                    .into_iter()
                    .filter(|effect| effect.group() == group)
                    .filter(|effect| {
                        request.is_global()
                            || request.targets().iter().any(|wanted| {
                                effect.targets().iter().any(|held| held.rough_eq(wanted))
                            })
                    })
                    .filter(|effect| effect.complete(true))
                    .count();
                let config = if stopped > 0 {
                    info!(%group, stopped, "timed effect stopped on request");
                    ResponseConfig::for_request(&request, ResultType::Success)
                } else {
                    ResponseConfig::for_request(&request, ResultType::Failure)
                        .with_message(NOT_RUNNING_MESSAGE)
                };
                Ok(DispatchOutcome::Build(config))
            }
            _ => {
                let on_start = Arc::clone(&timed.on_start);
                let mut config = TimedEffectConfig::new(request, move |r: &Request| on_start(r))
                    .blocks_others(timed.options.blocks_others)
                    .waits_for_others(timed.options.waits_for_others);
                if let Some(group) = &timed.options.group {
                    config = config.group(group.clone());
                }
                if let Some(duration) = timed.options.duration {
                    config = config.duration(duration);
                }

                let effect = self.scheduler.timed(config, responder)?;
                timed.track(effect.clone());
                if effect.queue()? != StartOutcome::Running {
                    timed.prune();
                }
                Ok(DispatchOutcome::Handled)
            }
        }
    }
}

#[async_trait]
impl EffectDispatcher for EffectRegistry {
    async fn dispatch(
        &self,
        request: Request,
        responder: Responder,
    ) -> anyhow::Result<DispatchOutcome> {
        match request.request_type() {
            RequestType::PlayerInfo => return self.notify(self.player_info.as_ref(), &request),
            RequestType::RemoteFunctionResult => {
                return self.notify(self.remote_function_result.as_ref(), &request)
            }
            _ => {}
        }

        let Some(name) = request.effect().map(str::to_lowercase) else {
            warn!(kind = request.request_type().name(), "request without effect reached the registry");
            return Ok(DispatchOutcome::Handled);
        };
        let Some(entry) = self.effects.get(&name) else {
            debug!(effect = %name, request_id = request.id(), "unknown effect");
            return Ok(DispatchOutcome::Build(
                ResponseConfig::for_request(&request, ResultType::Unavailable)
                    .with_message(UNKNOWN_EFFECT_MESSAGE),
            ));
        };

        match entry {
            Entry::Instant(handler) => {
                let ctx = EffectContext {
                    request,
                    responder,
                    scheduler: self.scheduler.clone(),
                };
                handler(ctx).await
            }
            Entry::Timed(timed) => self.dispatch_timed(timed, request, responder),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use effectlink_core::dispatch::dispatch_guarded;
    use effectlink_core::{RequestConfig, Response, Target};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn request(kind: RequestType, effect: &str, id: u32) -> Request {
        Request::new(RequestConfig {
            id,
            duration: Some(Duration::from_secs(10)),
            ..RequestConfig::effect(kind, effect)
        })
        .unwrap()
    }

    fn targeted(kind: RequestType, effect: &str, id: u32, target: &str) -> Request {
        Request::new(RequestConfig {
            targets: vec![Target::with_id(target)],
            ..request(kind, effect, id).to_config()
        })
        .unwrap()
    }

    async fn run(registry: &EffectRegistry, request: Request) -> UnboundedReceiver<Response> {
        let (responder, rx) = Responder::channel();
        dispatch_guarded(registry, request, responder).await;
        rx
    }

    fn timed_registry() -> EffectRegistry {
        let mut registry = EffectRegistry::default();
        registry.register_timed("Freeze", TimedOptions::default(), |_| Ok(None));
        registry
    }

    fn tracked(registry: &EffectRegistry, name: &str) -> usize {
        match registry.effects.get(name) {
            Some(Entry::Timed(timed)) => timed.running.lock().len(),
            _ => 0,
        }
    }

    // ── Instant effects ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_instant_effect_is_matched_case_insensitively() {
        // Arrange
        let mut registry = EffectRegistry::default();
        registry.register("Heal", |ctx: EffectContext| async move {
            Ok::<_, anyhow::Error>(ctx.outcome(ResultType::Success))
        });

        // Act
        let mut rx = run(&registry, request(RequestType::Start, "HEAL", 1)).await;

        // Assert
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.id(), 1);
        assert_eq!(reply.result_type(), Some(ResultType::Success));
        assert!(registry.contains("heal"));
    }

    #[tokio::test]
    async fn test_unknown_effect_is_unavailable() {
        let registry = EffectRegistry::default();

        let mut rx = run(&registry, request(RequestType::Start, "missing", 2)).await;

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.result_type(), Some(ResultType::Unavailable));
        assert_eq!(reply.message(), Some(UNKNOWN_EFFECT_MESSAGE));
    }

    #[tokio::test]
    async fn test_failing_handler_becomes_failure() {
        let mut registry = EffectRegistry::default();
        registry.register("boom", |_ctx: EffectContext| async {
            Err::<DispatchOutcome, _>(anyhow::anyhow!("out of mana"))
        });

        let mut rx = run(&registry, request(RequestType::Start, "boom", 3)).await;

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.result_type(), Some(ResultType::Failure));
        assert_eq!(reply.message(), Some("out of mana"));
    }

    #[tokio::test]
    async fn test_notices_without_handler_are_silent() {
        let registry = EffectRegistry::default();
        let info = Request::new(RequestConfig {
            player: Some(Target::with_id("streamer")),
            ..RequestConfig::new(RequestType::PlayerInfo)
        })
        .unwrap();

        let mut rx = run(&registry, info).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_player_info_reaches_its_handler() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let mut registry = EffectRegistry::default();
        registry.on_player_info(move |request| {
            assert_eq!(request.player().and_then(|p| p.id.as_deref()), Some("streamer"));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let info = Request::new(RequestConfig {
            player: Some(Target::with_id("streamer")),
            ..RequestConfig::new(RequestType::PlayerInfo)
        })
        .unwrap();

        run(&registry, info).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    // ── Timed effects ────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_timed_start_then_conflicting_start_retries() {
        let registry = timed_registry();

        let mut first = run(&registry, request(RequestType::Start, "freeze", 1)).await;
        let mut second = run(&registry, request(RequestType::Start, "freeze", 2)).await;

        let started = first.recv().await.unwrap();
        assert_eq!(started.result_type(), Some(ResultType::Success));
        assert_eq!(started.time_remaining(), Some(Duration::from_secs(10)));
        assert_eq!(second.recv().await.unwrap().result_type(), Some(ResultType::Retry));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_starts_are_not_tracked() {
        // Arrange
        let registry = timed_registry();
        let mut held = run(&registry, request(RequestType::Start, "freeze", 1)).await;
        assert_eq!(held.recv().await.unwrap().result_type(), Some(ResultType::Success));

        // Act
        for id in 2..200 {
            let mut rejected = run(&registry, request(RequestType::Start, "freeze", id)).await;
            assert_eq!(rejected.recv().await.unwrap().result_type(), Some(ResultType::Retry));
        }

        // Assert
        assert_eq!(tracked(&registry, "freeze"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_instances_are_forgotten_on_next_start() {
        let registry = timed_registry();
        let mut first = run(&registry, request(RequestType::Start, "freeze", 1)).await;
        first.recv().await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(first.recv().await.unwrap().result_type(), Some(ResultType::Finished));

        let mut second = run(&registry, request(RequestType::Start, "freeze", 2)).await;

        assert_eq!(second.recv().await.unwrap().result_type(), Some(ResultType::Success));
        assert_eq!(tracked(&registry, "freeze"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_test_reports_exclusivity_without_starting() {
        let registry = timed_registry();

        let mut idle = run(&registry, request(RequestType::Test, "freeze", 1)).await;
        assert_eq!(idle.recv().await.unwrap().result_type(), Some(ResultType::Success));
        assert_eq!(registry.scheduler().active_keys(), 0);

        let _running = run(&registry, request(RequestType::Start, "freeze", 2)).await;
        let mut busy = run(&registry, request(RequestType::Test, "freeze", 3)).await;
        assert_eq!(busy.recv().await.unwrap().result_type(), Some(ResultType::Retry));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_effects_on_different_targets_run_together() {
        let registry = timed_registry();

        let mut a = run(&registry, targeted(RequestType::Start, "freeze", 1, "a")).await;
        let mut b = run(&registry, targeted(RequestType::Start, "freeze", 2, "b")).await;

        assert_eq!(a.recv().await.unwrap().result_type(), Some(ResultType::Success));
        assert_eq!(b.recv().await.unwrap().result_type(), Some(ResultType::Success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_finishes_the_running_instance() {
        let registry = timed_registry();
        let mut started = run(&registry, request(RequestType::Start, "freeze", 1)).await;
        started.recv().await.unwrap();

        let mut stop = run(&registry, request(RequestType::Stop, "freeze", 2)).await;

        assert_eq!(stop.recv().await.unwrap().result_type(), Some(ResultType::Success));
        let finished = started.recv().await.unwrap();
        assert_eq!(finished.id(), 1);
        assert_eq!(finished.result_type(), Some(ResultType::Finished));
        assert_eq!(registry.scheduler().active_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_running_instance_fails() {
        let registry = timed_registry();

        let mut stop = run(&registry, request(RequestType::Stop, "freeze", 1)).await;

        let reply = stop.recv().await.unwrap();
        assert_eq!(reply.result_type(), Some(ResultType::Failure));
        assert_eq!(reply.message(), Some(NOT_RUNNING_MESSAGE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_all_and_resume_all() {
        let registry = timed_registry();
        let mut started = run(&registry, request(RequestType::Start, "freeze", 1)).await;
        started.recv().await.unwrap();

        assert_eq!(registry.pause_all(), 1);
        assert_eq!(started.recv().await.unwrap().result_type(), Some(ResultType::Paused));
        assert_eq!(registry.pause_all(), 0);

        assert_eq!(registry.resume_all(), 1);
        assert_eq!(started.recv().await.unwrap().result_type(), Some(ResultType::Resumed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_effect_without_duration_fails() {
        let registry = timed_registry();
        let no_duration = Request::new(RequestConfig::effect(RequestType::Start, "freeze")).unwrap();

        let mut rx = run(&registry, no_duration).await;

        assert_eq!(rx.recv().await.unwrap().result_type(), Some(ResultType::Failure));
        assert_eq!(registry.scheduler().active_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_effect_finishes_after_its_duration() {
        let registry = timed_registry();
        let mut rx = run(&registry, request(RequestType::Start, "freeze", 1)).await;
        rx.recv().await.unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(rx.recv().await.unwrap().result_type(), Some(ResultType::Finished));
        assert_eq!(registry.scheduler().active_keys(), 0);
    }
}
