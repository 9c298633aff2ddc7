//! Request scheduler: one item from submission to a terminal result
//!
//! Per item: `Pending → Dispatching → {Succeeded, Retrying, Exhausted, Failed}`.
//!
//! - AuthFailure and RateLimited rotate to another credential immediately
//! - Transient errors back off exponentially, bounded by `max_attempts`
//! - PermanentContent fails the item without retry
//! - Every path is bounded by `max_dispatches`
//!
//! The only suspension points are the quiet-hours hold, the exhaustion wait
//! and the transient backoff. Each is computed once, then slept on together
//! with the cancellation token (and, for the exhaustion wait, the pool's
//! capacity-returned notification).

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use transport::{Document, Outcome, Transport};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::pool::{CredentialPool, Lease};
use crate::quiet::QuietHours;
use crate::stats::{Attempt, AttemptOutcome, StatsRecorder};
use crate::strategy::RotationStrategy;

/// Retry limits and transient backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Transient failures tolerated per item (the last one is terminal)
    pub max_attempts: u32,
    /// Dispatches per item across all outcome classes
    pub max_dispatches: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(4_000),
            max_delay: Duration::from_millis(10_000),
            max_attempts: 3,
            max_dispatches: 24,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th transient failure (1-indexed):
    /// `min(base * 2^(attempt-1), max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Successful extraction of one item.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub credential_id: String,
    pub alias: String,
    /// Dispatches spent on the item, including rotations and retries
    pub dispatches: u32,
    pub elapsed: Duration,
}

pub struct RequestScheduler {
    pool: Arc<CredentialPool>,
    strategy: Box<dyn RotationStrategy>,
    transport: Arc<dyn Transport>,
    recorder: Arc<StatsRecorder>,
    policy: RetryPolicy,
    clock: Clock,
    cancel: CancellationToken,
    quiet: Option<QuietHours>,
}

impl RequestScheduler {
    pub fn new(
        pool: Arc<CredentialPool>,
        strategy: Box<dyn RotationStrategy>,
        transport: Arc<dyn Transport>,
        recorder: Arc<StatsRecorder>,
        policy: RetryPolicy,
        clock: Clock,
        cancel: CancellationToken,
    ) -> Self {
        info!(
            strategy = strategy.name(),
            transport = transport.id(),
            max_attempts = policy.max_attempts,
            max_dispatches = policy.max_dispatches,
            "request scheduler ready"
        );
        Self {
            pool,
            strategy,
            transport,
            recorder,
            policy,
            clock,
            cancel,
            quiet: None,
        }
    }

    /// Hold every dispatch while the UTC clock is inside `quiet`.
    pub fn with_quiet_hours(mut self, quiet: QuietHours) -> Self {
        info!(
            start_hour = quiet.start_hour(),
            end_hour = quiet.end_hour(),
            "quiet hours enabled"
        );
        self.quiet = Some(quiet);
        self
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Process one item to a terminal result.
    ///
    /// `deadline` (unix millis) bounds waiting for an eligible credential: if
    /// the earliest reset lies beyond it, `Exhausted` is returned instead of
    /// waiting. Surfaces only `Exhausted`, `Failed`, `PermanentContent` and
    /// `Cancelled`.
    pub async fn submit(&self, document: &Document, deadline: Option<u64>) -> Result<Completion> {
        let started = Instant::now();
        let item = document.name.as_str();
        let mut dispatches = 0u32;
        let mut transient_failures = 0u32;
        let mut last_reason = String::from("dispatch limit reached");

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if dispatches >= self.policy.max_dispatches {
                warn!(item, dispatches, "dispatch limit reached");
                return Err(Error::Failed {
                    attempts: dispatches,
                    reason: last_reason,
                });
            }

            let lease = self.acquire_or_wait(item, deadline).await?;
            let retry = dispatches;
            dispatches += 1;
            debug!(
                item,
                credential_id = %lease.id,
                alias = %lease.alias,
                attempt = dispatches,
                "dispatching"
            );

            let outcome = self.transport.dispatch(&lease.secret, document).await;
            counter!("scheduler_dispatch_total", "outcome" => outcome.label()).increment(1);
            self.record(&lease, item, &outcome, retry).await;

            match outcome {
                Outcome::Success(extraction) => {
                    info!(
                        item,
                        credential_id = %lease.id,
                        alias = %lease.alias,
                        dispatches,
                        "item extracted"
                    );
                    return Ok(Completion {
                        text: extraction.text,
                        credential_id: lease.id,
                        alias: lease.alias,
                        dispatches,
                        elapsed: started.elapsed(),
                    });
                }
                Outcome::AuthFailure(reason) => {
                    warn!(item, credential_id = %lease.id, alias = %lease.alias, reason = %reason, "authentication rejected, rotating");
                    last_reason = reason;
                }
                Outcome::RateLimited { scope, message } => {
                    info!(item, credential_id = %lease.id, alias = %lease.alias, scope = ?scope, "rate limited by service, rotating");
                    last_reason = message;
                }
                Outcome::Transient(message) => {
                    transient_failures += 1;
                    if transient_failures >= self.policy.max_attempts {
                        warn!(item, credential_id = %lease.id, attempt = transient_failures, error = %message, "retries exhausted");
                        return Err(Error::Failed {
                            attempts: dispatches,
                            reason: message,
                        });
                    }
                    let delay = self.policy.backoff(transient_failures);
                    warn!(
                        item,
                        credential_id = %lease.id,
                        attempt = transient_failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "transient failure, backing off"
                    );
                    last_reason = message;
                    self.pause(delay).await?;
                }
                Outcome::PermanentContent(reason) => {
                    warn!(item, credential_id = %lease.id, reason = %reason, "item cannot be processed");
                    return Err(Error::PermanentContent {
                        item: item.to_string(),
                        reason,
                    });
                }
            }
        }
    }

    /// Acquire a credential, waiting out quiet hours first and then for the
    /// earliest window reset when the pool is exhausted.
    async fn acquire_or_wait(&self, item: &str, deadline: Option<u64>) -> Result<Lease> {
        loop {
            let now = self.clock.now_millis();
            if let Some(resume_at) = self.quiet.and_then(|q| q.window_end(now)) {
                if deadline.is_some_and(|d| resume_at > d) {
                    counter!("scheduler_exhausted_total").increment(1);
                    warn!(item, resume_at, "quiet hours extend past deadline");
                    return Err(Error::Exhausted {
                        retry_at: Some(resume_at),
                    });
                }
                info!(
                    item,
                    resume_at,
                    delay_ms = resume_at - now,
                    "inside quiet hours, holding dispatch"
                );
                let waiting = Instant::now();
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep_until(self.clock.instant_at(resume_at)) => {}
                }
                histogram!("scheduler_wait_seconds").record(waiting.elapsed().as_secs_f64());
                continue;
            }

            // Registered before the eligibility check so a rollback in between wakes us
            let notified = self.pool.capacity_returned();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = self.clock.now_millis();
            match self.pool.acquire(self.strategy.as_ref(), now).await {
                Ok(lease) => return Ok(lease),
                Err(Error::NoEligibleCredential) => {}
                Err(e) => return Err(e),
            }

            let Some(retry_at) = self.pool.next_reset_time(now).await else {
                counter!("scheduler_exhausted_total").increment(1);
                warn!(item, "every credential is disabled");
                return Err(Error::Exhausted { retry_at: None });
            };
            if deadline.is_some_and(|d| retry_at > d) {
                counter!("scheduler_exhausted_total").increment(1);
                warn!(item, retry_at, "credentials exhausted past deadline");
                return Err(Error::Exhausted {
                    retry_at: Some(retry_at),
                });
            }

            info!(
                item,
                retry_at,
                delay_ms = retry_at.saturating_sub(now),
                "no eligible credential, waiting for window reset"
            );
            let waiting = Instant::now();
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep_until(self.clock.instant_at(retry_at)) => {}
                _ = notified.as_mut() => debug!(item, "capacity returned before reset"),
            }
            histogram!("scheduler_wait_seconds").record(waiting.elapsed().as_secs_f64());
        }
    }

    async fn pause(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Apply and persist one dispatch. Persistence failures are logged, never
    /// fatal to the item.
    async fn record(&self, lease: &Lease, item: &str, outcome: &Outcome, retry: u32) {
        let attempt = Attempt::from_lease(
            lease,
            item,
            AttemptOutcome::from(outcome),
            self.clock.now_millis(),
            retry,
        );
        if let Err(e) = self.recorder.record(&self.pool, &attempt).await {
            warn!(item, credential_id = %lease.id, error = %e, "failed to record attempt");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{DAY_MILLIS, MINUTE_MILLIS};
    use crate::credential::test_support::{LIMITS, spec};
    use crate::stats::StatsFile;
    use crate::strategy::{LoadBalance, RoundRobin};
    use common::Secret;
    use std::collections::{HashMap, VecDeque};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use transport::{Extraction, QuotaScope};

    /// 2026-10-17T10:15:30Z
    const NOW: u64 = 1_792_232_130_000;

    /// Replays scripted outcomes per secret, then succeeds.
    #[derive(Default)]
    struct ScriptedTransport {
        scripts: Mutex<HashMap<String, VecDeque<Outcome>>>,
        calls: Mutex<Vec<(String, Instant)>>,
        latency: Duration,
    }

    impl ScriptedTransport {
        fn script(self, alias: &str, outcomes: Vec<Outcome>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert(format!("secret-{alias}"), outcomes.into());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(s, _)| s.trim_start_matches("secret-").to_string())
                .collect()
        }

        fn call_times(&self) -> Vec<(String, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Transport for ScriptedTransport {
        fn id(&self) -> &str {
            "scripted"
        }

        fn dispatch<'a>(
            &'a self,
            key: &'a Secret<String>,
            document: &'a Document,
        ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
            Box::pin(async move {
                let secret = key.expose().clone();
                self.calls
                    .lock()
                    .unwrap()
                    .push((secret.clone(), Instant::now()));
                if !self.latency.is_zero() {
                    tokio::time::sleep(self.latency).await;
                }
                let scripted = self
                    .scripts
                    .lock()
                    .unwrap()
                    .get_mut(&secret)
                    .and_then(VecDeque::pop_front);
                scripted.unwrap_or_else(|| {
                    Outcome::Success(Extraction {
                        text: format!("text of {}", document.name),
                    })
                })
            })
        }

        fn probe<'a>(
            &'a self,
            _key: &'a Secret<String>,
        ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
            Box::pin(async {
                Outcome::Success(Extraction {
                    text: String::new(),
                })
            })
        }
    }

    struct Harness {
        scheduler: RequestScheduler,
        transport: Arc<ScriptedTransport>,
        cancel: CancellationToken,
        _dir: tempfile::TempDir,
    }

    fn harness(
        aliases: &[&str],
        transport: ScriptedTransport,
        strategy: Box<dyn RotationStrategy>,
        policy: RetryPolicy,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let specs = aliases.iter().map(|a| spec(a)).collect();
        let pool = Arc::new(CredentialPool::load(specs, &StatsFile::default(), LIMITS, NOW).unwrap());
        let recorder = Arc::new(StatsRecorder::new(dir.path().join("stats.json"), None));
        let transport = Arc::new(transport);
        let cancel = CancellationToken::new();
        let scheduler = RequestScheduler::new(
            pool,
            strategy,
            transport.clone(),
            recorder,
            policy,
            Clock::starting_at(NOW),
            cancel.clone(),
        );
        Harness {
            scheduler,
            transport,
            cancel,
            _dir: dir,
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            max_attempts: 3,
            max_dispatches: 24,
        }
    }

    fn doc(name: &str) -> Document {
        Document::new(name, "image/png", vec![0u8; 4])
    }

    fn transient() -> Outcome {
        Outcome::Transient("status 503: overloaded".into())
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = fast_policy();
        let delays: Vec<u64> = (1..=6).map(|n| policy.backoff(n).as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 8, 8, 8]);
        assert_eq!(policy.backoff(200), Duration::from_secs(8));
    }

    #[test]
    fn default_policy_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(4));
        assert_eq!(policy.backoff(2), Duration::from_secs(8));
        assert_eq!(policy.backoff(3), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn success_returns_text_and_commits() {
        let h = harness(&["a"], ScriptedTransport::default(), Box::new(RoundRobin::default()), fast_policy());
        let done = h.scheduler.submit(&doc("p1.png"), None).await.unwrap();
        assert_eq!(done.text, "text of p1.png");
        assert_eq!(done.alias, "a");
        assert_eq!(done.dispatches, 1);

        let statuses = h.scheduler.pool().statuses(NOW).await;
        let status = &statuses[0];
        assert_eq!(status.total_success, 1);
        assert_eq!(status.requests_today, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_hours_hold_dispatch_until_they_end() {
        let mut h = harness(&["a"], ScriptedTransport::default(), Box::new(RoundRobin::default()), fast_policy());
        h.scheduler = h.scheduler.with_quiet_hours(QuietHours::new(10, 11).unwrap());
        let start = Instant::now();

        let done = h.scheduler.submit(&doc("p1"), None).await.unwrap();
        assert_eq!(done.alias, "a");
        // 10:15:30 to 11:00:00
        assert_eq!(start.elapsed(), Duration::from_secs(2_670));
        assert_eq!(h.transport.call_times()[0].1, start + Duration::from_secs(2_670));

        // Outside the range dispatch is immediate
        let later = Instant::now();
        h.scheduler.submit(&doc("p2"), None).await.unwrap();
        assert_eq!(later.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_hours_past_deadline_are_exhausted() {
        let mut h = harness(&["a"], ScriptedTransport::default(), Box::new(RoundRobin::default()), fast_policy());
        h.scheduler = h.scheduler.with_quiet_hours(QuietHours::new(22, 11).unwrap());

        let result = h.scheduler.submit(&doc("p1"), Some(NOW + 90_000)).await;
        let eleven = NOW - NOW % DAY_MILLIS + 11 * 3_600_000;
        assert!(matches!(
            result,
            Err(Error::Exhausted { retry_at: Some(t) }) if t == eleven
        ));
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_quiet_hours() {
        let mut h = harness(&["a"], ScriptedTransport::default(), Box::new(RoundRobin::default()), fast_policy());
        h.scheduler = h.scheduler.with_quiet_hours(QuietHours::new(10, 11).unwrap());
        let cancel = h.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        });

        let result = h.scheduler.submit(&doc("p1"), None).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn round_robin_spreads_items() {
        let h = harness(&["a", "b", "c"], ScriptedTransport::default(), Box::new(RoundRobin::default()), fast_policy());
        for i in 0..6 {
            h.scheduler.submit(&doc(&format!("p{i}")), None).await.unwrap();
        }
        assert_eq!(h.transport.calls(), ["a", "b", "c", "a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_disables_and_rotates_without_backoff() {
        let transport = ScriptedTransport::default().script("a", vec![Outcome::AuthFailure("status 401".into())]);
        let h = harness(&["a", "b"], transport, Box::new(RoundRobin::default()), fast_policy());
        let start = Instant::now();

        let done = h.scheduler.submit(&doc("p1"), None).await.unwrap();
        assert_eq!(done.alias, "b");
        assert_eq!(done.dispatches, 2);
        assert_eq!(start.elapsed(), Duration::ZERO);

        let statuses = h.scheduler.pool().statuses(NOW).await;
        assert!(!statuses[0].enabled);
        assert_eq!(statuses[0].requests_today, 0);
        assert!(statuses[1].enabled);
        assert_eq!(statuses[1].requests_today, 1);

        // Later items never touch the disabled key
        h.scheduler.submit(&doc("p2"), None).await.unwrap();
        assert_eq!(h.transport.calls(), ["a", "b", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_saturates_and_rotates() {
        let transport = ScriptedTransport::default().script(
            "a",
            vec![Outcome::RateLimited {
                scope: QuotaScope::Minute,
                message: "429".into(),
            }],
        );
        let h = harness(&["a", "b"], transport, Box::new(LoadBalance), fast_policy());
        let done = h.scheduler.submit(&doc("p1"), None).await.unwrap();
        assert_eq!(done.alias, "b");

        let statuses = h.scheduler.pool().statuses(NOW).await;
        assert_eq!(statuses[0].requests_this_minute, LIMITS.requests_per_minute);
        assert_eq!(statuses[0].requests_today, 0);
        assert_eq!(statuses[0].rate_limit_hits, 1);
        assert_eq!(statuses[0].total_failure, 0);
        assert!(!statuses[0].eligible);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_then_fail() {
        let transport = ScriptedTransport::default().script("a", vec![transient(), transient(), transient()]);
        let h = harness(&["a"], transport, Box::new(RoundRobin::default()), fast_policy());
        let start = Instant::now();

        let err = h.scheduler.submit(&doc("p1"), None).await.unwrap_err();
        match err {
            Error::Failed { attempts, reason } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("503"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        // Backoffs of 1s and 2s between the three dispatches
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));

        let statuses = h.scheduler.pool().statuses(NOW).await;
        let status = &statuses[0];
        assert_eq!(status.consecutive_failures, 3);
        assert_eq!(status.total_failure, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_then_success_recovers() {
        let transport = ScriptedTransport::default().script("a", vec![transient()]);
        let h = harness(&["a"], transport, Box::new(RoundRobin::default()), fast_policy());
        let done = h.scheduler.submit(&doc("p1"), None).await.unwrap();
        assert_eq!(done.dispatches, 2);
        let statuses = h.scheduler.pool().statuses(NOW).await;
        let status = &statuses[0];
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.total_failure, 1);
        assert_eq!(status.total_success, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_content_fails_immediately() {
        let transport = ScriptedTransport::default().script("a", vec![Outcome::PermanentContent("blocked".into())]);
        let h = harness(&["a", "b"], transport, Box::new(RoundRobin::default()), fast_policy());
        let err = h.scheduler.submit(&doc("bad.png"), None).await.unwrap_err();
        assert!(matches!(err, Error::PermanentContent { ref item, .. } if item == "bad.png"));
        assert_eq!(h.transport.calls(), ["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_with_immediate_deadline() {
        let transport = ScriptedTransport::default()
            .script("a", vec![Outcome::RateLimited { scope: QuotaScope::Day, message: "day".into() }])
            .script("b", vec![Outcome::RateLimited { scope: QuotaScope::Day, message: "day".into() }]);
        let h = harness(&["a", "b"], transport, Box::new(RoundRobin::default()), fast_policy());

        let err = h.scheduler.submit(&doc("p1"), Some(NOW)).await.unwrap_err();
        let midnight = NOW - NOW % DAY_MILLIS + DAY_MILLIS;
        assert!(matches!(err, Error::Exhausted { retry_at: Some(t) } if t == midnight));
        assert_eq!(h.transport.calls().len(), 2);

        // Both at daily limit: no dispatch at all and no time spent
        let start = Instant::now();
        let err = h.scheduler.submit(&doc("p2"), Some(h.scheduler.clock().now_millis())).await.unwrap_err();
        assert!(matches!(err, Error::Exhausted { .. }));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(h.transport.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn all_disabled_is_exhausted_without_retry_time() {
        let transport = ScriptedTransport::default().script("a", vec![Outcome::AuthFailure("401".into())]);
        let h = harness(&["a"], transport, Box::new(RoundRobin::default()), fast_policy());
        let err = h.scheduler.submit(&doc("p1"), None).await.unwrap_err();
        assert!(matches!(err, Error::Exhausted { retry_at: None }));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_minute_reset() {
        let h = harness(&["a"], ScriptedTransport::default(), Box::new(RoundRobin::default()), fast_policy());
        for i in 0..LIMITS.requests_per_minute {
            h.scheduler.submit(&doc(&format!("p{i}")), None).await.unwrap();
        }
        let boundary = NOW - NOW % MINUTE_MILLIS + MINUTE_MILLIS;

        let done = h.scheduler.submit(&doc("late"), None).await.unwrap();
        assert_eq!(done.alias, "a");
        assert!(h.scheduler.clock().now_millis() >= boundary);

        let statuses = h.scheduler.pool().statuses(h.scheduler.clock().now_millis()).await;
        let status = &statuses[0];
        assert_eq!(status.requests_this_minute, 1);
        assert_eq!(status.requests_today, LIMITS.requests_per_minute + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_beyond_reset_still_waits() {
        let h = harness(&["a"], ScriptedTransport::default(), Box::new(RoundRobin::default()), fast_policy());
        for i in 0..LIMITS.requests_per_minute {
            h.scheduler.submit(&doc(&format!("p{i}")), None).await.unwrap();
        }
        let deadline = NOW + 90_000;
        assert!(h.scheduler.submit(&doc("late"), Some(deadline)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_wait() {
        let h = harness(&["a"], ScriptedTransport::default(), Box::new(RoundRobin::default()), fast_policy());
        for i in 0..LIMITS.requests_per_minute {
            h.scheduler.submit(&doc(&format!("p{i}")), None).await.unwrap();
        }
        let cancel = h.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
        let start = Instant::now();
        let err = h.scheduler.submit(&doc("late"), None).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_backoff() {
        let transport = ScriptedTransport::default().script("a", vec![transient()]);
        let h = harness(&["a"], transport, Box::new(RoundRobin::default()), RetryPolicy {
            base_delay: Duration::from_secs(30),
            ..fast_policy()
        });
        let cancel = h.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            cancel.cancel();
        });
        let err = h.scheduler.submit(&doc("p1"), None).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_limit_bounds_rotation() {
        let limited = || Outcome::RateLimited {
            scope: QuotaScope::Minute,
            message: "429".into(),
        };
        let transport = ScriptedTransport::default().script("a", (0..10).map(|_| limited()).collect());
        let h = harness(&["a"], transport, Box::new(RoundRobin::default()), RetryPolicy {
            max_dispatches: 3,
            ..fast_policy()
        });
        let err = h.scheduler.submit(&doc("p1"), None).await.unwrap_err();
        assert!(matches!(err, Error::Failed { attempts: 3, .. }));
        assert_eq!(h.transport.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_submits_respect_limits() {
        let transport = ScriptedTransport {
            latency: Duration::from_millis(700),
            ..Default::default()
        };
        let h = harness(&["a", "b"], transport, Box::new(LoadBalance), fast_policy());
        let start = Instant::now();
        let scheduler = Arc::new(h.scheduler);

        let mut handles = Vec::new();
        for i in 0..24 {
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move {
                scheduler.submit(&doc(&format!("p{i}")), None).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // No credential ever dispatched more than its per-minute cap in any minute
        let calls = h.transport.call_times();
        assert_eq!(calls.len(), 24);
        let mut per_minute: HashMap<(String, u64), u32> = HashMap::new();
        for (secret, at) in calls {
            let millis = NOW + (at - start).as_millis() as u64;
            *per_minute.entry((secret, millis / MINUTE_MILLIS)).or_default() += 1;
        }
        assert!(per_minute.values().all(|&n| n <= LIMITS.requests_per_minute));

        let statuses = scheduler.pool().statuses(scheduler.clock().now_millis()).await;
        for status in &statuses {
            assert!(status.requests_today <= LIMITS.requests_per_day);
            assert!(status.requests_this_minute <= LIMITS.requests_per_minute);
        }
        assert_eq!(statuses.iter().map(|s| s.total_success).sum::<u64>(), 24);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_outcomes_are_counted() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let transport = ScriptedTransport::default().script("a", vec![transient()]);
        let h = harness(&["a"], transport, Box::new(RoundRobin::default()), fast_policy());
        h.scheduler.submit(&doc("p1"), None).await.unwrap();

        let output = handle.render();
        assert!(output.contains("scheduler_dispatch_total{outcome=\"transient\"} 1"));
        assert!(output.contains("scheduler_dispatch_total{outcome=\"success\"} 1"));
    }
}
