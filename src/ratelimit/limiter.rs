//! Admission-control limiter.
//!
//! A [`Limiter`] runs scheduled futures one admission at a time, enforcing a
//! concurrency cap, a minimum spacing between admissions, an optional token
//! reservoir and an optional bound on the number of queued units. Units are
//! admitted in submission order.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::reservoir::Reservoir;
use crate::config::{LimiterConfig, Strategy};
use crate::error::AdmissionError;

/// A single admission-control instance.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct Limiter {
    /// Name used in log output
    name: String,
    /// Limits enforced by this instance
    config: LimiterConfig,
    /// Queue and budget state
    state: Mutex<LimiterState>,
    /// Wakes queued units whenever the state changes
    wakeup: Notify,
    /// Limiter that must also admit every unit after this one has
    next: Option<Arc<Limiter>>,
}

struct LimiterState {
    /// Queued unit ids, oldest first
    queue: VecDeque<u64>,
    /// Ids evicted from the queue by the leak strategy
    dropped: HashSet<u64>,
    next_id: u64,
    /// Admitted units that have not finished yet
    running: usize,
    /// Earliest instant the next unit may be admitted
    next_admission: Instant,
    reservoir: Option<Reservoir>,
    last_activity: Instant,
}

impl LimiterState {
    fn new(config: &LimiterConfig, now: Instant) -> Self {
        Self {
            queue: VecDeque::new(),
            dropped: HashSet::new(),
            next_id: 0,
            running: 0,
            next_admission: now,
            reservoir: config.reservoir.as_ref().map(|r| Reservoir::new(r, now)),
            last_activity: now,
        }
    }

    fn at_capacity(&self, config: &LimiterConfig) -> bool {
        config
            .max_concurrent
            .map_or(false, |max| self.running >= max)
    }

    fn can_admit(&mut self, config: &LimiterConfig, now: Instant) -> bool {
        if self.at_capacity(config) || now < self.next_admission {
            return false;
        }
        match self.reservoir.as_mut() {
            Some(reservoir) => reservoir.remaining(now) > 0,
            None => true,
        }
    }

    fn admit(&mut self, config: &LimiterConfig, now: Instant) {
        self.running += 1;
        self.next_admission = now + config.min_time();
        if let Some(reservoir) = self.reservoir.as_mut() {
            reservoir.try_take(now);
        }
        self.last_activity = now;
    }

    /// How long the head of the queue has to wait before it can be admitted.
    ///
    /// `None` means only a finishing unit can unblock it.
    fn wait_hint(&mut self, config: &LimiterConfig, now: Instant) -> Option<Duration> {
        if self.at_capacity(config) {
            return None;
        }
        let mut wait = self.next_admission.saturating_duration_since(now);
        if let Some(reservoir) = self.reservoir.as_mut() {
            if reservoir.remaining(now) == 0 {
                wait = wait.max(reservoir.until_refresh(now));
            }
        }
        Some(wait)
    }
}

impl Limiter {
    /// Create a new limiter.
    pub fn new(name: impl Into<String>, config: LimiterConfig) -> Self {
        let now = Instant::now();
        Self {
            name: name.into(),
            state: Mutex::new(LimiterState::new(&config, now)),
            config,
            wakeup: Notify::new(),
            next: None,
        }
    }

    /// Route every unit admitted here through `next` as well.
    ///
    /// The unit holds its slot on this limiter while it waits for `next`, so
    /// this limiter's pacing always applies first.
    pub fn chained(mut self, next: Arc<Limiter>) -> Self {
        self.next = Some(next);
        self
    }

    /// Run `task` once it has been admitted by this limiter and every limiter
    /// chained behind it.
    ///
    /// The task's own output, including any error it returns, is passed back
    /// untouched inside `Ok`.
    pub async fn schedule<F, T>(&self, task: F) -> Result<T, AdmissionError>
    where
        F: Future<Output = T>,
    {
        self.schedule_cancellable(task, None).await
    }

    /// Like [`Limiter::schedule`], but gives up with
    /// [`AdmissionError::Cancelled`] if `cancel` fires before admission.
    pub async fn schedule_cancellable<F, T>(
        &self,
        task: F,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, AdmissionError>
    where
        F: Future<Output = T>,
    {
        let mut permits = Vec::new();
        let mut tier = Some(self);
        while let Some(limiter) = tier {
            permits.push(limiter.acquire(cancel).await?);
            tier = limiter.next.as_deref();
        }

        Ok(task.await)
    }

    async fn acquire(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<Permit<'_>, AdmissionError> {
        let id = {
            let mut state = self.state.lock();
            let now = Instant::now();
            state.last_activity = now;

            if state.queue.is_empty() && state.can_admit(&self.config, now) {
                state.admit(&self.config, now);
                trace!(limiter = %self.name, running = state.running, "Admitted");
                return Ok(Permit { limiter: self });
            }

            if let Some(high_water) = self.config.high_water {
                if state.queue.len() >= high_water {
                    match self.config.strategy {
                        Strategy::Overflow => {
                            debug!(limiter = %self.name, queued = state.queue.len(), "Queue full, rejecting job");
                            return Err(AdmissionError::Overflow);
                        }
                        Strategy::Leak => match state.queue.pop_front() {
                            Some(oldest) => {
                                debug!(limiter = %self.name, queued = state.queue.len(), "Queue full, dropping oldest job");
                                state.dropped.insert(oldest);
                                self.wakeup.notify_waiters();
                            }
                            None => return Err(AdmissionError::Dropped),
                        },
                    }
                }
            }

            let id = state.next_id;
            state.next_id += 1;
            state.queue.push_back(id);
            id
        };

        let mut ticket = Ticket {
            limiter: self,
            id,
            settled: false,
        };

        loop {
            // Registered before the state check so no wakeup is missed.
            let notified = self.wakeup.notified();
            tokio::pin!(notified);

            let wait = {
                let mut state = self.state.lock();
                if state.dropped.remove(&id) {
                    ticket.settled = true;
                    return Err(AdmissionError::Dropped);
                }

                let now = Instant::now();
                if state.queue.front() != Some(&id) {
                    None
                } else if state.can_admit(&self.config, now) {
                    state.queue.pop_front();
                    state.admit(&self.config, now);
                    ticket.settled = true;
                    trace!(limiter = %self.name, running = state.running, queued = state.queue.len(), "Admitted");
                    self.wakeup.notify_waiters();
                    return Ok(Permit { limiter: self });
                } else {
                    state.wait_hint(&self.config, now)
                }
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_for(wait) => {}
                _ = cancelled(cancel) => {
                    debug!(limiter = %self.name, "Queued job cancelled");
                    return Err(AdmissionError::Cancelled);
                }
            }
        }
    }

    /// Name used in log output.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Limits enforced by this instance.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Whether units admitted here also pass through another limiter.
    pub fn is_chained(&self) -> bool {
        self.next.is_some()
    }

    /// Number of admitted units that have not finished.
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    /// Number of units waiting for admission.
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether nothing is queued or running and nothing has happened for at
    /// least `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        let state = self.state.lock();
        state.queue.is_empty()
            && state.running == 0
            && Instant::now().saturating_duration_since(state.last_activity) >= timeout
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("chained", &self.is_chained())
            .finish()
    }
}

/// Slot held by an admitted unit; frees it on drop.
struct Permit<'a> {
    limiter: &'a Limiter,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.limiter.state.lock();
            state.running = state.running.saturating_sub(1);
            state.last_activity = Instant::now();
        }
        self.limiter.wakeup.notify_waiters();
    }
}

/// Place in the queue; withdraws it on drop unless it was settled.
struct Ticket<'a> {
    limiter: &'a Limiter,
    id: u64,
    settled: bool,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        {
            let mut state = self.limiter.state.lock();
            state.queue.retain(|queued| *queued != self.id);
            state.dropped.remove(&self.id);
        }
        self.limiter.wakeup.notify_waiters();
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(duration) => sleep(duration).await,
        None => std::future::pending().await,
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReservoirConfig;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio_test::assert_ok;

    fn spaced(min_time_ms: u64) -> LimiterConfig {
        LimiterConfig {
            min_time_ms,
            ..LimiterConfig::default()
        }
    }

    fn assert_spacing(times: &[Instant], min: Duration) {
        for pair in times.windows(2) {
            assert!(
                pair[1] - pair[0] >= min,
                "admissions {:?} apart, expected at least {:?}",
                pair[1] - pair[0],
                min
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_time_spacing() {
        let limiter = Limiter::new("test", spaced(100));

        let times = join_all((0..5).map(|_| limiter.schedule(async { Instant::now() }))).await;
        let times: Vec<Instant> = times.into_iter().map(Result::unwrap).collect();

        assert_spacing(&times, Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_concurrent() {
        let limiter = Limiter::new(
            "test",
            LimiterConfig {
                max_concurrent: Some(2),
                ..LimiterConfig::default()
            },
        );
        let current = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        join_all((0..6).map(|_| {
            limiter.schedule(async {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            })
        }))
        .await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(limiter.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reservoir_within_budget() {
        let limiter = Limiter::new("egress", LimiterConfig::egress_defaults());
        let start = Instant::now();

        let times = join_all((0..25).map(|_| limiter.schedule(async { Instant::now() }))).await;
        let times: Vec<Instant> = times.into_iter().map(Result::unwrap).collect();

        assert_spacing(&times, Duration::from_millis(25));
        assert!(times.iter().all(|t| *t - start < Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reservoir_exhaustion_waits_for_refresh() {
        let limiter = Limiter::new("egress", LimiterConfig::egress_defaults());
        let start = Instant::now();

        let times = join_all((0..40).map(|_| limiter.schedule(async { Instant::now() }))).await;
        let times: Vec<Instant> = times.into_iter().map(Result::unwrap).collect();

        assert_spacing(&times, Duration::from_millis(25));
        assert!(times[..30].iter().all(|t| *t - start < Duration::from_secs(1)));
        assert!(times[30..].iter().all(|t| *t - start >= Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_rejects_new_job() {
        let limiter = Limiter::new(
            "test",
            LimiterConfig {
                max_concurrent: Some(1),
                high_water: Some(1),
                strategy: Strategy::Overflow,
                ..LimiterConfig::default()
            },
        );
        let slow = || async { sleep(Duration::from_millis(100)).await };

        let (first, second, third) = tokio::join!(
            limiter.schedule(slow()),
            limiter.schedule(slow()),
            limiter.schedule(slow()),
        );

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(third, Err(AdmissionError::Overflow));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leak_drops_oldest_queued_job() {
        let limiter = Limiter::new(
            "test",
            LimiterConfig {
                max_concurrent: Some(1),
                high_water: Some(1),
                strategy: Strategy::Leak,
                ..LimiterConfig::default()
            },
        );
        let ran_second = AtomicBool::new(false);

        let (first, second, third) = tokio::join!(
            limiter.schedule(sleep(Duration::from_millis(100))),
            limiter.schedule(async { ran_second.store(true, Ordering::SeqCst) }),
            limiter.schedule(async { 3 }),
        );

        assert_ok!(first);
        assert_eq!(second, Err(AdmissionError::Dropped));
        assert_eq!(third, Ok(3));
        assert!(!ran_second.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_high_water_drops_jobs_that_must_wait() {
        let limiter = Limiter::new(
            "test",
            LimiterConfig {
                high_water: Some(0),
                min_time_ms: 100,
                ..LimiterConfig::default()
            },
        );

        assert_eq!(limiter.schedule(async { 1 }).await, Ok(1));
        assert_eq!(limiter.schedule(async { 2 }).await, Err(AdmissionError::Dropped));
    }

    #[tokio::test]
    async fn test_task_error_is_not_a_rejection() {
        let limiter = Limiter::new("test", LimiterConfig::default());

        let result = limiter.schedule(async { Err::<(), _>("remote failure") }).await;

        assert_eq!(result, Ok(Err("remote failure")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_job_never_runs() {
        let limiter = Limiter::new(
            "test",
            LimiterConfig {
                max_concurrent: Some(1),
                ..LimiterConfig::default()
            },
        );
        let token = CancellationToken::new();
        let ran = AtomicBool::new(false);

        let (first, second, _) = tokio::join!(
            limiter.schedule(sleep(Duration::from_millis(100))),
            limiter.schedule_cancellable(async { ran.store(true, Ordering::SeqCst) }, Some(&token)),
            async {
                sleep(Duration::from_millis(10)).await;
                token.cancel();
            },
        );

        assert!(first.is_ok());
        assert_eq!(second, Err(AdmissionError::Cancelled));
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(limiter.queued(), 0);
        assert_eq!(limiter.schedule(async { 5 }).await, Ok(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_future_leaves_queue() {
        let limiter = Limiter::new(
            "test",
            LimiterConfig {
                max_concurrent: Some(1),
                ..LimiterConfig::default()
            },
        );

        let (_, timed_out) = tokio::join!(
            limiter.schedule(sleep(Duration::from_millis(100))),
            tokio::time::timeout(Duration::from_millis(10), limiter.schedule(async {})),
        );

        assert!(timed_out.is_err());
        assert_eq!(limiter.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_admits_through_both_tiers() {
        let egress = Arc::new(Limiter::new(
            "egress",
            LimiterConfig {
                reservoir: Some(ReservoirConfig::new(2, Duration::from_secs(1))),
                ..LimiterConfig::default()
            },
        ));
        let group = Limiter::new("group", LimiterConfig::default()).chained(egress.clone());
        let start = Instant::now();

        let times = join_all((0..4).map(|_| group.schedule(async { Instant::now() }))).await;
        let times: Vec<Instant> = times.into_iter().map(Result::unwrap).collect();

        assert!(group.is_chained());
        assert!(times[..2].iter().all(|t| *t - start < Duration::from_secs(1)));
        assert!(times[2..].iter().all(|t| *t - start >= Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_order_own_tier_first() {
        let egress = Arc::new(Limiter::new(
            "egress",
            LimiterConfig {
                max_concurrent: Some(1),
                ..LimiterConfig::default()
            },
        ));
        let group = Limiter::new(
            "group",
            LimiterConfig {
                max_concurrent: Some(1),
                ..LimiterConfig::default()
            },
        )
        .chained(egress.clone());

        tokio::join!(
            egress.schedule(sleep(Duration::from_millis(100))),
            group.schedule(async {}),
            async {
                sleep(Duration::from_millis(10)).await;
                // admitted by the group tier, now waiting on the egress tier
                assert_eq!(group.running(), 1);
                assert_eq!(egress.queued(), 1);
            },
        );

        assert_eq!(group.running(), 0);
        assert_eq!(egress.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_detection() {
        let limiter = Limiter::new("test", LimiterConfig::default());
        limiter.schedule(async {}).await.unwrap();

        assert!(!limiter.is_idle(Duration::from_secs(60)));
        sleep(Duration::from_secs(61)).await;
        assert!(limiter.is_idle(Duration::from_secs(60)));
    }
}
