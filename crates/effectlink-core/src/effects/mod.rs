//! Effect exclusivity scheduler.
//!
//! At most one non-complete timed effect may hold a given
//! `(effect group, target)` key at a time.  An effect with no targets holds
//! the group's global key, which also blocks every targeted effect in that
//! group.
//!
//! An [`EffectScheduler`] owns one [`ActiveEffects`] table and one
//! [`TimerService`].  Independent schedulers never see each other's effects,
//! so each executor (and each test) gets its own.

pub mod table;
pub mod timed;

use std::sync::Arc;

pub use table::{ActiveEffects, EffectKey};
pub use timed::{
    EffectError, EffectHook, StartHandler, StartOutcome, TimedEffect, TimedEffectConfig,
    ALREADY_RUNNING_MESSAGE,
};

use crate::dispatch::Responder;
use crate::protocol::Target;
use crate::timer::TimerService;

/// Creates timed effects that share one active-effects table.
#[derive(Debug, Clone, Default)]
pub struct EffectScheduler {
    table: Arc<ActiveEffects>,
    timer: TimerService,
}

impl EffectScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses an existing timer service instead of a fresh one.
    pub fn with_timer(timer: TimerService) -> Self {
        Self {
            table: Arc::new(ActiveEffects::new()),
            timer,
        }
    }

    pub fn timer(&self) -> &TimerService {
        &self.timer
    }

    /// Builds a timed effect that reports through `responder`.
    ///
    /// The effect does nothing until [`TimedEffect::queue`] or
    /// [`TimedEffect::start`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`EffectError::MissingDuration`] when neither the config nor
    /// the request carries a positive duration.
    pub fn timed(
        &self,
        config: TimedEffectConfig,
        responder: Responder,
    ) -> Result<TimedEffect, EffectError> {
        TimedEffect::new(
            config,
            Arc::clone(&self.table),
            self.timer.clone(),
            responder,
        )
    }

    /// Returns `true` if a non-complete effect holds the global key of `group`
    /// or the key of any of `targets`.
    pub fn is_active(&self, group: &str, targets: &[Target]) -> bool {
        self.table.any_live(&EffectKey::blocking(group, targets))
    }

    /// Number of keys currently held by running effects.
    pub fn active_keys(&self) -> usize {
        self.table.live_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::protocol::{
        Request, RequestConfig, RequestType, Response, ResponseConfig, ResultType,
    };

    const D: Duration = Duration::from_secs(10);

    fn request(id: u32, targets: Vec<Target>) -> Request {
        Request::new(RequestConfig {
            id,
            targets,
            duration: Some(D),
            ..RequestConfig::effect(RequestType::Start, "freeze")
        })
        .unwrap()
    }

    fn plain(request: Request) -> TimedEffectConfig {
        TimedEffectConfig::new(request, |_| Ok(None)).group("g")
    }

    fn drain(rx: &mut UnboundedReceiver<Response>) -> Vec<Response> {
        let mut out = Vec::new();
        while let Ok(response) = rx.try_recv() {
            out.push(response);
        }
        out
    }

    fn target_t() -> Vec<Target> {
        vec![Target::with_id("T")]
    }

    // ── Exclusivity ──────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_second_effect_on_same_target_gets_retry() {
        // Arrange
        let scheduler = EffectScheduler::new();
        let (responder, mut rx) = Responder::channel();
        let e1 = scheduler.timed(plain(request(1, target_t())), responder.clone()).unwrap();
        let e2 = scheduler.timed(plain(request(2, target_t())), responder).unwrap();

        // Act
        assert_eq!(e1.queue().unwrap(), StartOutcome::Running);
        assert_eq!(e2.queue().unwrap(), StartOutcome::Rejected);

        // Assert
        let responses = drain(&mut rx);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].id(), 1);
        assert_eq!(responses[0].result_type(), Some(ResultType::Success));
        assert_eq!(responses[0].time_remaining(), Some(D));
        assert_eq!(responses[1].id(), 2);
        assert_eq!(responses[1].result_type(), Some(ResultType::Retry));
        assert_eq!(responses[1].time_remaining(), None);
        assert_eq!(responses[1].message(), Some(ALREADY_RUNNING_MESSAGE));
        assert!(e2.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_succeeds_again_after_forced_completion() {
        let scheduler = EffectScheduler::new();
        let (responder, mut rx) = Responder::channel();
        let e1 = scheduler.timed(plain(request(1, target_t())), responder.clone()).unwrap();
        e1.queue().unwrap();

        assert!(e1.complete(true));
        assert!(!e1.complete(true), "second completion is a no-op");

        let e3 = scheduler.timed(plain(request(3, target_t())), responder).unwrap();
        assert_eq!(e3.queue().unwrap(), StartOutcome::Running);

        let results: Vec<_> = drain(&mut rx).iter().map(|r| r.result_type()).collect();
        assert_eq!(
            results,
            vec![
                Some(ResultType::Success),
                Some(ResultType::Finished),
                Some(ResultType::Success)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_succeeds_again_after_natural_completion() {
        let scheduler = EffectScheduler::new();
        let (responder, mut rx) = Responder::channel();
        let e1 = scheduler.timed(plain(request(1, target_t())), responder.clone()).unwrap();
        e1.queue().unwrap();

        tokio::time::sleep(D + Duration::from_millis(1)).await;
        assert!(e1.is_complete());
        assert!(!scheduler.is_active("g", &target_t()));

        let e3 = scheduler.timed(plain(request(3, target_t())), responder).unwrap();
        assert_eq!(e3.queue().unwrap(), StartOutcome::Running);
        let last = drain(&mut rx).pop().unwrap();
        assert_eq!(last.id(), 3);
        assert_eq!(last.result_type(), Some(ResultType::Success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_effect_blocks_targeted_effect() {
        let scheduler = EffectScheduler::new();
        let (responder, _rx) = Responder::channel();
        let global = scheduler.timed(plain(request(1, vec![])), responder.clone()).unwrap();
        let targeted = scheduler.timed(plain(request(2, target_t())), responder).unwrap();

        global.queue().unwrap();

        assert!(scheduler.is_active("g", &target_t()));
        assert_eq!(targeted.queue().unwrap(), StartOutcome::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_effect_that_does_not_wait_starts_anyway() {
        let scheduler = EffectScheduler::new();
        let (responder, _rx) = Responder::channel();
        let first = scheduler.timed(plain(request(1, target_t())), responder.clone()).unwrap();
        let eager = scheduler
            .timed(plain(request(2, target_t())).waits_for_others(false), responder)
            .unwrap();

        first.queue().unwrap();

        assert_eq!(eager.queue().unwrap(), StartOutcome::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_blocking_effect_claims_nothing() {
        let scheduler = EffectScheduler::new();
        let (responder, _rx) = Responder::channel();
        let quiet = scheduler
            .timed(plain(request(1, target_t())).blocks_others(false), responder)
            .unwrap();

        quiet.queue().unwrap();

        assert!(!scheduler.is_active("g", &target_t()));
    }

    #[test]
    fn test_missing_duration_is_rejected() {
        let scheduler = EffectScheduler::new();
        let (responder, _rx) = Responder::channel();
        let request = Request::new(RequestConfig::effect(RequestType::Start, "x")).unwrap();

        let result = scheduler.timed(TimedEffectConfig::new(request, |_| Ok(None)), responder);

        assert!(matches!(result, Err(EffectError::MissingDuration(_))));
    }

    // ── Start callback outcomes ──────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_failing_start_rolls_back_and_sends_failure() {
        let scheduler = EffectScheduler::new();
        let (responder, mut rx) = Responder::channel();
        let effect = scheduler
            .timed(
                TimedEffectConfig::new(request(1, target_t()), |_| anyhow::bail!("no player"))
                    .group("g"),
                responder,
            )
            .unwrap();

        assert_eq!(effect.queue().unwrap(), StartOutcome::NotStarted);

        assert!(effect.is_complete());
        assert!(!scheduler.is_active("g", &target_t()));
        let responses = drain(&mut rx);
        assert_eq!(responses.len(), 1, "no FINISHED after a failed start");
        assert_eq!(responses[0].result_type(), Some(ResultType::Failure));
        assert_eq!(responses[0].message(), Some("no player"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_success_start_result_is_sent_as_is() {
        let scheduler = EffectScheduler::new();
        let (responder, mut rx) = Responder::channel();
        let effect = scheduler
            .timed(
                TimedEffectConfig::new(request(1, target_t()), |req| {
                    Ok(Some(
                        ResponseConfig::for_request(req, ResultType::Unavailable)
                            .with_message("not in this level"),
                    ))
                })
                .group("g"),
                responder,
            )
            .unwrap();

        assert_eq!(effect.queue().unwrap(), StartOutcome::NotStarted);

        assert!(!scheduler.is_active("g", &target_t()));
        let responses = drain(&mut rx);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].result_type(), Some(ResultType::Unavailable));
        assert_eq!(responses[0].time_remaining(), None);
    }

    // ── Pause / resume ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_pause_freezes_remaining_time() {
        let scheduler = EffectScheduler::new();
        let (responder, mut rx) = Responder::channel();
        let effect = scheduler.timed(plain(request(1, target_t())), responder).unwrap();
        effect.queue().unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        effect.pause().unwrap();
        let remaining = effect.remaining();

        assert_eq!(remaining + Duration::from_secs(4), D);

        // Time passing while paused does not consume the effect.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!effect.is_complete());
        assert_eq!(effect.remaining(), remaining);

        let paused = drain(&mut rx).pop().unwrap();
        assert_eq!(paused.result_type(), Some(ResultType::Paused));
        assert_eq!(paused.time_remaining(), Some(Duration::from_secs(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_then_immediate_pause_loses_no_time() {
        let scheduler = EffectScheduler::new();
        let (responder, _rx) = Responder::channel();
        let effect = scheduler.timed(plain(request(1, target_t())), responder).unwrap();
        effect.queue().unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        effect.pause().unwrap();
        let frozen = effect.remaining();

        effect.resume().unwrap();
        effect.pause().unwrap();

        assert_eq!(effect.remaining(), frozen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumed_effect_finishes_after_remaining_time() {
        let scheduler = EffectScheduler::new();
        let (responder, mut rx) = Responder::channel();
        let completions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completions);
        let effect = scheduler
            .timed(
                plain(request(1, target_t())).on_complete(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
                responder,
            )
            .unwrap();
        effect.queue().unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        effect.pause().unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        effect.resume().unwrap();

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(!effect.is_complete(), "8 s were left at pause time");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(effect.is_complete());
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        let results: Vec<_> = drain(&mut rx).iter().map(|r| r.result_type()).collect();
        assert_eq!(
            results,
            vec![
                Some(ResultType::Success),
                Some(ResultType::Paused),
                Some(ResultType::Resumed),
                Some(ResultType::Finished)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_illegal_pause_and_resume() {
        let scheduler = EffectScheduler::new();
        let (responder, _rx) = Responder::channel();
        let effect = scheduler.timed(plain(request(1, target_t())), responder).unwrap();

        assert!(matches!(effect.pause(), Err(EffectError::IllegalState { .. })));
        assert!(matches!(effect.resume(), Err(EffectError::IllegalState { .. })));

        effect.queue().unwrap();
        assert!(matches!(effect.resume(), Err(EffectError::IllegalState { .. })));
        effect.pause().unwrap();
        assert!(matches!(effect.pause(), Err(EffectError::IllegalState { .. })));

        effect.complete(false);
        assert!(matches!(effect.resume(), Err(EffectError::IllegalState { .. })));
        assert!(matches!(effect.queue(), Err(EffectError::IllegalState { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_faulty_hooks_are_contained() {
        let scheduler = EffectScheduler::new();
        let (responder, mut rx) = Responder::channel();
        let effect = scheduler
            .timed(
                plain(request(1, target_t()))
                    .on_pause(|_| anyhow::bail!("pause hook failed"))
                    .on_complete(|_| panic!("complete hook blew up")),
                responder,
            )
            .unwrap();
        effect.queue().unwrap();

        effect.pause().unwrap();
        assert!(effect.complete(true));

        let last = drain(&mut rx).pop().unwrap();
        assert_eq!(last.result_type(), Some(ResultType::Finished));
    }
}
