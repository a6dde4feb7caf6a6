//! The scheduler proper: lanes, session buckets, admission, cancellation.
//!
//! # Model
//!
//! Each lane owns a bounded mpsc queue and `maxConcurrent` worker tasks.
//! A job starts iff a lane worker is free and its session is below the
//! session's effective concurrency, which is the minimum of the submission
//! override, the configured ceiling, and the adaptive throttle.
//!
//! A worker that dequeues a job for a saturated session parks it in the
//! session bucket and moves on; the run that frees the slot picks the
//! parked job up as its continuation. Parking and completion are linearized
//! under one mutex, so a freed slot can never miss a parked job.
//!
//! # Cancellation
//!
//! Every job carries a `CancellationToken` derived from the scheduler's
//! shutdown token. `cancel_one_session` fires the oldest running job's
//! token; `cancel_session` fires all of them and fails the session's parked
//! jobs. The token is handed to the run callback, which must propagate it
//! into provider calls.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use anyhow::anyhow;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ferrogate_core::config::SchedulerConfig;
use ferrogate_core::run::{Outcome, RunCancelled, RunRequest, RunResult};

use crate::throttle::throttle_cap;

/// Canonical lane names.
pub const LANE_MAIN: &str = "main";
pub const LANE_SUBAGENT: &str = "subagent";
pub const LANE_DELEGATE: &str = "delegate";
pub const LANE_CRON: &str = "cron";

const CANONICAL_LANES: &[&str] = &[LANE_MAIN, LANE_SUBAGENT, LANE_DELEGATE, LANE_CRON];

/// Per-session concurrency when the submission carries no override.
const DEFAULT_SESSION_CONCURRENT: usize = 1;

/// Boxed future returned by the run callback.
pub type RunFuture = Pin<Box<dyn Future<Output = anyhow::Result<RunResult>> + Send>>;

/// The injected run executor. Receives the job's cancellation token and the
/// request; resolves with the run's outcome.
pub type RunFn = Arc<dyn Fn(CancellationToken, RunRequest) -> RunFuture + Send + Sync>;

/// Token estimator: `session_key → (estimated_tokens, context_window)`.
/// Must not call back into the scheduler.
pub type TokenEstimateFn = Arc<dyn Fn(&str) -> Option<(u64, u64)> + Send + Sync>;

/// Submission-time errors, delivered as the job's outcome.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("lane '{lane}' queue is full")]
    QueueFull { lane: String },
    #[error("unknown lane '{lane}'")]
    UnknownLane { lane: String },
    #[error("scheduler is stopped")]
    Stopped,
    #[error("no run executor installed")]
    NoRunner,
}

/// Per-submission options.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScheduleOpts {
    /// Override for the session's concurrent-run cap (groups allow more
    /// than DMs).
    pub max_concurrent: Option<usize>,
}

struct Job {
    session_key: String,
    request: RunRequest,
    lane: String,
    out: oneshot::Sender<Outcome>,
    cancel: CancellationToken,
    opts: ScheduleOpts,
    enqueued_at: Instant,
}

struct RunningJob {
    run_id: String,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SessionBucket {
    /// Admission-ordered running jobs (oldest first).
    running: Vec<RunningJob>,
    /// Jobs parked because the session was at capacity, enqueue order.
    pending: VecDeque<Job>,
}

struct Lane {
    tx: mpsc::Sender<Job>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
}

struct Inner {
    lanes: HashMap<String, Lane>,
    sessions: Mutex<HashMap<String, SessionBucket>>,
    runner: RwLock<Option<RunFn>>,
    estimator: RwLock<Option<TokenEstimateFn>>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
}

/// Lane-based run scheduler. Cheap to share via `Arc`.
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create the scheduler and start its lane workers.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let mut lanes = HashMap::new();
        let mut worker_plans = Vec::new();

        for &name in CANONICAL_LANES {
            let lane_cfg = config.lane(name);
            let (tx, rx) = mpsc::channel(lane_cfg.queue_capacity.max(1));
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            lanes.insert(
                name.to_string(),
                Lane {
                    tx,
                    rx: rx.clone(),
                },
            );
            worker_plans.push((name.to_string(), rx, lane_cfg.max_concurrent.max(1)));
        }

        let inner = Arc::new(Inner {
            lanes,
            sessions: Mutex::new(HashMap::new()),
            runner: RwLock::new(None),
            estimator: RwLock::new(None),
            config,
            shutdown,
        });

        for (lane, rx, workers) in worker_plans {
            for worker in 0..workers {
                let inner = inner.clone();
                let rx = rx.clone();
                let lane = lane.clone();
                tokio::spawn(async move {
                    worker_loop(inner, lane, worker, rx).await;
                });
            }
        }

        Arc::new(Self { inner })
    }

    /// Install the run executor. Injected after construction so the agent
    /// router can depend on the scheduler without a cycle.
    pub fn set_runner(&self, runner: RunFn) {
        *self.inner.runner.write().unwrap() = Some(runner);
    }

    /// Register the token estimator consulted by the adaptive throttle.
    pub fn set_token_estimate_fn(&self, estimator: TokenEstimateFn) {
        *self.inner.estimator.write().unwrap() = Some(estimator);
    }

    /// Schedule a run on a lane with default options.
    pub fn schedule(&self, lane: &str, request: RunRequest) -> oneshot::Receiver<Outcome> {
        self.schedule_with_opts(lane, request, ScheduleOpts::default())
    }

    /// Schedule a run on a lane. The returned channel receives the outcome
    /// exactly once. Submitting to a full lane queue fails synchronously
    /// (the error arrives on the channel immediately); the caller is never
    /// blocked.
    pub fn schedule_with_opts(
        &self,
        lane: &str,
        request: RunRequest,
        opts: ScheduleOpts,
    ) -> oneshot::Receiver<Outcome> {
        let (out, rx) = oneshot::channel();

        if self.inner.shutdown.is_cancelled() {
            let _ = out.send(Err(anyhow!(ScheduleError::Stopped)));
            return rx;
        }

        let Some(lane_handle) = self.inner.lanes.get(lane) else {
            warn!(lane = %lane, "schedule on unknown lane");
            let _ = out.send(Err(anyhow!(ScheduleError::UnknownLane {
                lane: lane.to_string(),
            })));
            return rx;
        };

        let job = Job {
            session_key: request.session_key.clone(),
            request,
            lane: lane.to_string(),
            out,
            cancel: self.inner.shutdown.child_token(),
            opts,
            enqueued_at: Instant::now(),
        };

        debug!(
            lane = %lane,
            session_key = %job.session_key,
            run_id = %job.request.run_id,
            "job enqueued"
        );

        if let Err(e) = lane_handle.tx.try_send(job) {
            let job = match e {
                mpsc::error::TrySendError::Full(job) => {
                    warn!(lane = %lane, "lane queue full, rejecting job");
                    job
                }
                mpsc::error::TrySendError::Closed(job) => job,
            };
            let _ = job.out.send(Err(anyhow!(ScheduleError::QueueFull {
                lane: lane.to_string(),
            })));
        }

        rx
    }

    /// Cancel the oldest active run for a session. Returns whether a run
    /// was cancelled.
    pub fn cancel_one_session(&self, session_key: &str) -> bool {
        let sessions = self.inner.sessions.lock().unwrap();
        let Some(bucket) = sessions.get(session_key) else {
            return false;
        };
        match bucket.running.first() {
            Some(job) => {
                info!(session_key = %session_key, run_id = %job.run_id, "cancelling oldest run");
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel all active runs for a session and fail its queued jobs.
    /// Returns whether anything was cancelled.
    pub fn cancel_session(&self, session_key: &str) -> bool {
        let drained = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            let Some(bucket) = sessions.get_mut(session_key) else {
                return false;
            };
            for job in &bucket.running {
                job.cancel.cancel();
            }
            let had_any = !bucket.running.is_empty() || !bucket.pending.is_empty();
            let drained: Vec<Job> = bucket.pending.drain(..).collect();
            if !had_any {
                return false;
            }
            info!(
                session_key = %session_key,
                running = bucket.running.len(),
                queued = drained.len(),
                "cancelling session"
            );
            drained
        };

        for job in drained {
            let _ = job.out.send(Err(anyhow!(RunCancelled)));
        }
        true
    }

    /// Number of running jobs for a session (diagnostics and tests).
    pub fn running_count(&self, session_key: &str) -> usize {
        let sessions = self.inner.sessions.lock().unwrap();
        sessions
            .get(session_key)
            .map(|b| b.running.len())
            .unwrap_or(0)
    }

    /// Drain all lanes and terminate workers. Queued jobs receive a
    /// `Stopped` outcome.
    pub async fn stop(&self) {
        info!("scheduler stopping");
        self.inner.shutdown.cancel();

        // Fail everything still sitting in lane queues.
        for lane in self.inner.lanes.values() {
            let mut rx = lane.rx.lock().await;
            while let Ok(job) = rx.try_recv() {
                let _ = job.out.send(Err(anyhow!(ScheduleError::Stopped)));
            }
        }

        // Fail parked jobs.
        let parked: Vec<Job> = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            sessions
                .values_mut()
                .flat_map(|b| b.pending.drain(..))
                .collect()
        };
        for job in parked {
            let _ = job.out.send(Err(anyhow!(ScheduleError::Stopped)));
        }
    }
}

// ─────────────────────────────────────────────
// Worker internals
// ─────────────────────────────────────────────

async fn worker_loop(
    inner: Arc<Inner>,
    lane: String,
    worker: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
) {
    debug!(lane = %lane, worker = worker, "lane worker started");
    loop {
        let job = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            job = async {
                let mut rx = rx.lock().await;
                rx.recv().await
            } => match job {
                Some(job) => job,
                None => break,
            },
        };
        inner.process(job).await;
    }
    debug!(lane = %lane, worker = worker, "lane worker exiting");
}

impl Inner {
    fn estimate_for(&self, session_key: &str) -> Option<(u64, u64)> {
        let estimator = self.estimator.read().unwrap().clone();
        estimator.and_then(|f| f(session_key))
    }

    /// Effective concurrency base for a job: override or default, capped by
    /// the configured ceiling.
    fn session_base(&self, opts: &ScheduleOpts) -> usize {
        opts.max_concurrent
            .unwrap_or(DEFAULT_SESSION_CONCURRENT)
            .clamp(1, self.config.session_ceiling.max(1))
    }

    async fn process(self: &Arc<Self>, job: Job) {
        let mut next = self.admit_or_park(job).await;
        while let Some(job) = next.take() {
            let outcome = self.execute(&job).await;
            let session_key = job.session_key.clone();
            let run_id = job.request.run_id.clone();
            let _ = job.out.send(outcome);
            next = self.complete(&session_key, &run_id);
        }
    }

    /// Admit the job into its session bucket, or park it if the session is
    /// at capacity. Returns the job if it was admitted.
    async fn admit_or_park(&self, job: Job) -> Option<Job> {
        if job.cancel.is_cancelled() {
            let _ = job.out.send(Err(anyhow!(RunCancelled)));
            return None;
        }

        let base = self.session_base(&job.opts);
        let decision = throttle_cap(base, self.estimate_for(&job.session_key));

        if let Some(delay) = decision.backoff {
            debug!(
                session_key = %job.session_key,
                delay_ms = delay.as_millis() as u64,
                "throttle back-off before admission"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = job.cancel.cancelled() => {
                    let _ = job.out.send(Err(anyhow!(RunCancelled)));
                    return None;
                }
            }
        }

        let mut sessions = self.sessions.lock().unwrap();
        let bucket = sessions.entry(job.session_key.clone()).or_default();
        if bucket.running.len() < decision.cap.max(1) {
            bucket.running.push(RunningJob {
                run_id: job.request.run_id.clone(),
                cancel: job.cancel.clone(),
            });
            Some(job)
        } else {
            debug!(
                session_key = %job.session_key,
                running = bucket.running.len(),
                "session at capacity, parking job"
            );
            bucket.pending.push_back(job);
            None
        }
    }

    /// Run the job through the injected executor, converting panics into
    /// error outcomes.
    async fn execute(&self, job: &Job) -> Outcome {
        let runner = self.runner.read().unwrap().clone();
        let Some(runner) = runner else {
            return Err(anyhow!(ScheduleError::NoRunner));
        };

        debug!(
            lane = %job.lane,
            session_key = %job.session_key,
            run_id = %job.request.run_id,
            queued_ms = job.enqueued_at.elapsed().as_millis() as u64,
            "job admitted"
        );

        let fut = runner(job.cancel.clone(), job.request.clone());
        match tokio::spawn(fut).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                error!(
                    run_id = %job.request.run_id,
                    session_key = %job.session_key,
                    "agent run panicked"
                );
                Err(anyhow!("agent run panicked"))
            }
            Err(_) => Err(anyhow!(RunCancelled)),
        }
    }

    /// Remove a finished run from its bucket, and admit the session's next
    /// parked job into the freed slot, if any. Done under one lock so a
    /// concurrent park cannot miss the free slot.
    fn complete(&self, session_key: &str, run_id: &str) -> Option<Job> {
        let estimate = self.estimate_for(session_key);
        let mut sessions = self.sessions.lock().unwrap();
        let bucket = sessions.get_mut(session_key)?;
        bucket.running.retain(|r| r.run_id != run_id);

        let parked_opts = bucket.pending.front().map(|job| job.opts);
        let next = match parked_opts {
            Some(opts) => {
                let cap = throttle_cap(self.session_base(&opts), estimate).cap.max(1);
                if bucket.running.len() < cap {
                    let job = bucket.pending.pop_front().unwrap();
                    bucket.running.push(RunningJob {
                        run_id: job.request.run_id.clone(),
                        cancel: job.cancel.clone(),
                    });
                    Some(job)
                } else {
                    None
                }
            }
            None => None,
        };

        if bucket.running.is_empty() && bucket.pending.is_empty() {
            sessions.remove(session_key);
        }
        next
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use ferrogate_core::config::LaneConfig;
    use ferrogate_core::run::is_cancelled;

    fn test_config() -> SchedulerConfig {
        let mut config = SchedulerConfig::default();
        config.lanes.insert(
            LANE_MAIN.to_string(),
            LaneConfig {
                max_concurrent: 4,
                queue_capacity: 16,
            },
        );
        config
    }

    fn request(session: &str, message: &str) -> RunRequest {
        RunRequest::new(session, message, "test", "chat-1")
    }

    /// Runner that sleeps `delay_ms`, honouring cancellation, and tracks
    /// concurrency high-water marks.
    fn tracking_runner(
        delay_ms: u64,
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        order: Arc<Mutex<Vec<String>>>,
    ) -> RunFn {
        Arc::new(move |cancel, req| {
            let current = current.clone();
            let peak = peak.clone();
            let order = order.clone();
            Box::pin(async move {
                order.lock().unwrap().push(req.message.clone());
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);

                let result = tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
                        Ok(RunResult {
                            content: format!("done: {}", req.message),
                            run_id: req.run_id.clone(),
                            ..Default::default()
                        })
                    }
                    _ = cancel.cancelled() => Err(anyhow!(RunCancelled)),
                };
                current.fetch_sub(1, Ordering::SeqCst);
                result
            })
        })
    }

    fn instant_runner() -> RunFn {
        Arc::new(|_cancel, req| {
            Box::pin(async move {
                Ok(RunResult {
                    content: format!("done: {}", req.message),
                    run_id: req.run_id,
                    ..Default::default()
                })
            })
        })
    }

    #[tokio::test]
    async fn test_schedule_executes_and_delivers_outcome() {
        let scheduler = Scheduler::new(test_config());
        scheduler.set_runner(instant_runner());

        let rx = scheduler.schedule(LANE_MAIN, request("agent:a:t:direct:1", "hello"));
        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome.content, "done: hello");
    }

    #[tokio::test]
    async fn test_no_runner_installed_errors() {
        let scheduler = Scheduler::new(test_config());
        let rx = scheduler.schedule(LANE_MAIN, request("agent:a:t:direct:1", "x"));
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScheduleError>(),
            Some(ScheduleError::NoRunner)
        ));
    }

    #[tokio::test]
    async fn test_unknown_lane_errors() {
        let scheduler = Scheduler::new(test_config());
        scheduler.set_runner(instant_runner());
        let rx = scheduler.schedule("bogus", request("agent:a:t:direct:1", "x"));
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScheduleError>(),
            Some(ScheduleError::UnknownLane { .. })
        ));
    }

    #[tokio::test]
    async fn test_session_serialized_by_default() {
        let scheduler = Scheduler::new(test_config());
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        scheduler.set_runner(tracking_runner(30, current, peak.clone(), order.clone()));

        let session = "agent:a:t:direct:1";
        let rxs: Vec<_> = (0..3)
            .map(|i| scheduler.schedule(LANE_MAIN, request(session, &format!("m{i}"))))
            .collect();
        for rx in rxs {
            rx.await.unwrap().unwrap();
        }

        // Default session concurrency is 1: never more than one at a time,
        // and enqueue order is preserved.
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(
            order.lock().unwrap().clone(),
            vec!["m0".to_string(), "m1".to_string(), "m2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_group_override_allows_parallel_runs() {
        let scheduler = Scheduler::new(test_config());
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        scheduler.set_runner(tracking_runner(50, current, peak.clone(), order));

        let session = "agent:a:discord:group:g1";
        let opts = ScheduleOpts {
            max_concurrent: Some(3),
        };
        let rxs: Vec<_> = (0..3)
            .map(|i| {
                scheduler.schedule_with_opts(LANE_MAIN, request(session, &format!("m{i}")), opts)
            })
            .collect();
        for rx in rxs {
            rx.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) > 1, "group runs should overlap");
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_distinct_sessions_run_in_parallel() {
        let scheduler = Scheduler::new(test_config());
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        scheduler.set_runner(tracking_runner(50, current, peak.clone(), order));

        let rxs: Vec<_> = (0..3)
            .map(|i| {
                scheduler.schedule(
                    LANE_MAIN,
                    request(&format!("agent:a:t:direct:{i}"), &format!("m{i}")),
                )
            })
            .collect();
        for rx in rxs {
            rx.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_queue_full_rejects_synchronously() {
        let mut config = SchedulerConfig::default();
        config.lanes.insert(
            LANE_MAIN.to_string(),
            LaneConfig {
                max_concurrent: 1,
                queue_capacity: 1,
            },
        );
        let scheduler = Scheduler::new(config);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        scheduler.set_runner(tracking_runner(200, current, peak, order));

        // Fill the single worker and the single queue slot, then overflow.
        let session = "agent:a:t:direct:1";
        let _r1 = scheduler.schedule(LANE_MAIN, request(session, "running"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _r2 = scheduler.schedule(LANE_MAIN, request(session, "queued"));
        let r3 = scheduler.schedule(LANE_MAIN, request(session, "rejected"));

        let err = r3.await.unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScheduleError>(),
            Some(ScheduleError::QueueFull { .. })
        ));
    }

    #[tokio::test]
    async fn test_lanes_are_bulkheads() {
        let mut config = SchedulerConfig::default();
        config.lanes.insert(
            LANE_CRON.to_string(),
            LaneConfig {
                max_concurrent: 1,
                queue_capacity: 4,
            },
        );
        let scheduler = Scheduler::new(config);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        scheduler.set_runner(tracking_runner(100, current, peak, order));

        // Saturate cron with a long job...
        let _cron = scheduler.schedule(LANE_CRON, request("agent:a:cron:j1", "slow"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        // ...main still executes promptly.
        let started = Instant::now();
        let rx = scheduler.schedule(LANE_MAIN, request("agent:a:t:direct:1", "fast"));
        rx.await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_cancel_one_session_cancels_oldest() {
        let scheduler = Scheduler::new(test_config());
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        scheduler.set_runner(tracking_runner(10_000, current, peak, order));

        let session = "agent:a:t:direct:1";
        let rx = scheduler.schedule(LANE_MAIN, request(session, "long"));
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(scheduler.cancel_one_session(session));
        let err = rx.await.unwrap().unwrap_err();
        assert!(is_cancelled(&err));

        // Nothing left to cancel.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!scheduler.cancel_one_session(session));
    }

    #[tokio::test]
    async fn test_cancel_session_drains_queued_jobs() {
        let scheduler = Scheduler::new(test_config());
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        scheduler.set_runner(tracking_runner(10_000, current, peak, order.clone()));

        let session = "agent:a:t:direct:1";
        let r1 = scheduler.schedule(LANE_MAIN, request(session, "running"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        let r2 = scheduler.schedule(LANE_MAIN, request(session, "parked-1"));
        let r3 = scheduler.schedule(LANE_MAIN, request(session, "parked-2"));
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(scheduler.cancel_session(session));

        for rx in [r1, r2, r3] {
            let err = rx.await.unwrap().unwrap_err();
            assert!(is_cancelled(&err));
        }
        // Only the first job ever started.
        assert_eq!(order.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_session_without_jobs_is_false() {
        let scheduler = Scheduler::new(test_config());
        scheduler.set_runner(instant_runner());
        assert!(!scheduler.cancel_session("agent:a:t:direct:nope"));
    }

    #[tokio::test]
    async fn test_panicking_runner_becomes_error_outcome() {
        let scheduler = Scheduler::new(test_config());
        scheduler.set_runner(Arc::new(|_cancel, req| {
            Box::pin(async move {
                if req.message == "boom" {
                    panic!("tool exploded");
                }
                Ok(RunResult::default())
            })
        }));

        let rx = scheduler.schedule(LANE_MAIN, request("agent:a:t:direct:1", "boom"));
        let err = rx.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("panicked"));

        // The scheduler survives and keeps executing.
        let rx = scheduler.schedule(LANE_MAIN, request("agent:a:t:direct:1", "ok"));
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_throttle_serializes_near_full_context() {
        let scheduler = Scheduler::new(test_config());
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        scheduler.set_runner(tracking_runner(40, current, peak.clone(), order));
        scheduler.set_token_estimate_fn(Arc::new(|_key| Some((70_000, 100_000))));

        // Group override would allow 3, but the throttle caps at 1.
        let session = "agent:a:discord:group:g1";
        let opts = ScheduleOpts {
            max_concurrent: Some(3),
        };
        let rxs: Vec<_> = (0..3)
            .map(|i| {
                scheduler.schedule_with_opts(LANE_MAIN, request(session, &format!("m{i}")), opts)
            })
            .collect();
        for rx in rxs {
            rx.await.unwrap().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_fails_queued_jobs() {
        let mut config = SchedulerConfig::default();
        config.lanes.insert(
            LANE_MAIN.to_string(),
            LaneConfig {
                max_concurrent: 1,
                queue_capacity: 8,
            },
        );
        let scheduler = Scheduler::new(config);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        scheduler.set_runner(tracking_runner(10_000, current, peak, order));

        let session = "agent:a:t:direct:1";
        let _running = scheduler.schedule(LANE_MAIN, request(session, "running"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let queued = scheduler.schedule(LANE_MAIN, request(session, "queued"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        scheduler.stop().await;

        let err = queued.await.unwrap().unwrap_err();
        // The job was either still in the lane queue (Stopped) or already
        // parked and cancelled by the shutdown token.
        let stopped = matches!(
            err.downcast_ref::<ScheduleError>(),
            Some(ScheduleError::Stopped)
        );
        assert!(stopped || is_cancelled(&err));

        // New submissions are rejected.
        let rx = scheduler.schedule(LANE_MAIN, request(session, "late"));
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScheduleError>(),
            Some(ScheduleError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_running_count_tracks_admissions() {
        let scheduler = Scheduler::new(test_config());
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        scheduler.set_runner(tracking_runner(100, current, peak, order));

        let session = "agent:a:t:direct:1";
        assert_eq!(scheduler.running_count(session), 0);
        let rx = scheduler.schedule(LANE_MAIN, request(session, "m"));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(scheduler.running_count(session), 1);
        rx.await.unwrap().unwrap();
        assert_eq!(scheduler.running_count(session), 0);
    }
}
