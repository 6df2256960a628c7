// Background scheduler
//
// Singleton orchestrator for named heavy jobs. Jobs run one at a time on a
// dedicated thread (a serial chain); each run waits for the idle window,
// takes the named lock, then executes. Concurrent requests for the same
// job name attach to the in-flight run instead of queueing a duplicate.

pub mod idle;

pub use idle::{BusyReason, IdleMonitor};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::constants::{DB_STATS_SAMPLE_INTERVAL_MS, IDLE_CHECK_INTERVAL_MS, IDLE_MAX_WAIT_MS};
use crate::db::{CatalogStore, Db};
use crate::error::{Result, ShoeboxError};
use crate::kv::JobLock;

/// Observable job lifecycle, reported through `job_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    WaitingIdle,
    Locking,
    Running,
    Retrying,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub start_delay: Duration,
    pub retry_interval: Duration,
    pub idle_check_interval: Duration,
    pub max_idle_wait: Duration,
    pub lock_ttl: Duration,
    pub category: &'static str,
    /// Retry budget for failed runs; the loop gives up after this many.
    pub max_attempts: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            start_delay: Duration::from_secs(0),
            retry_interval: Duration::from_secs(30),
            idle_check_interval: Duration::from_millis(IDLE_CHECK_INTERVAL_MS),
            max_idle_wait: Duration::from_millis(IDLE_MAX_WAIT_MS),
            lock_ttl: Duration::from_secs(3_600),
            category: "maintenance",
            max_attempts: 5,
        }
    }
}

type JobFn = Box<dyn FnMut() -> Result<()> + Send>;

struct JobRequest {
    name: String,
    f: JobFn,
    opts: JobOptions,
}

/// Completion handle for a scheduled job.
pub struct JobTicket {
    rx: Receiver<Result<()>>,
}

impl JobTicket {
    /// Block until the job finishes (or the scheduler drops it).
    pub fn wait(self) -> Result<()> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(ShoeboxError::Worker("scheduler stopped".into())))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        self.rx.recv_timeout(timeout).ok()
    }
}

struct SchedulerInner {
    tx: Sender<JobRequest>,
    // name -> waiters attached to the queued/running instance
    pending: Mutex<HashMap<String, Vec<Sender<Result<()>>>>>,
    states: Mutex<HashMap<String, JobState>>,
    cancels: Mutex<HashMap<String, Arc<AtomicBool>>>,
    idle: Arc<IdleMonitor>,
    locks: JobLock,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(idle: Arc<IdleMonitor>, locks: JobLock) -> Self {
        let (tx, rx) = unbounded::<JobRequest>();
        let inner = Arc::new(SchedulerInner {
            tx,
            pending: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
            idle,
            locks,
        });

        let loop_inner = Arc::clone(&inner);
        std::thread::Builder::new()
            .name("job-scheduler".into())
            .spawn(move || scheduler_loop(rx, loop_inner))
            .expect("Failed to spawn scheduler thread");

        Self { inner }
    }

    /// Schedule a named job for the next idle window. A second request for
    /// the same name while it is queued or running attaches to that run.
    pub fn run_when_idle(
        &self,
        name: &str,
        f: impl FnMut() -> Result<()> + Send + 'static,
        opts: JobOptions,
    ) -> JobTicket {
        let (done_tx, done_rx) = unbounded();

        let mut pending = self.inner.pending.lock().unwrap();
        if let Some(waiters) = pending.get_mut(name) {
            debug!("Job '{}' already scheduled, attaching waiter", name);
            waiters.push(done_tx);
            return JobTicket { rx: done_rx };
        }
        pending.insert(name.to_string(), vec![done_tx]);
        drop(pending);

        self.set_state(name, JobState::Queued);
        self.inner
            .cancels
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(AtomicBool::new(false)));

        let _ = self.inner.tx.send(JobRequest {
            name: name.to_string(),
            f: Box::new(f),
            opts,
        });

        JobTicket { rx: done_rx }
    }

    /// Ask a queued or retrying job to stop before its next attempt.
    pub fn cancel(&self, name: &str) -> bool {
        match self.inner.cancels.lock().unwrap().get(name) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Wait for the idle window (bounded); returns whether it opened.
    pub fn gate(&self, kind: &str, max_wait: Duration) -> bool {
        self.inner.idle.gate(
            kind,
            max_wait,
            Duration::from_millis(IDLE_CHECK_INTERVAL_MS),
        )
    }

    /// Admission control for non-job callers: wait for idle, then run.
    pub fn with_admission<T>(
        &self,
        kind: &str,
        max_wait: Duration,
        f: impl FnOnce() -> T,
    ) -> T {
        self.gate(kind, max_wait);
        f()
    }

    pub fn job_state(&self, name: &str) -> Option<JobState> {
        self.inner.states.lock().unwrap().get(name).copied()
    }

    pub fn idle_monitor(&self) -> &Arc<IdleMonitor> {
        &self.inner.idle
    }

    fn set_state(&self, name: &str, state: JobState) {
        self.inner
            .states
            .lock()
            .unwrap()
            .insert(name.to_string(), state);
    }

    /// Register the recurring DB-maintenance job: WAL checkpoint + ANALYZE
    /// per database, spaced by a fixed step, plus periodic telemetry
    /// sampling.
    pub fn start(&self, store: Arc<CatalogStore>, cfg: SchedulerConfig) {
        let scheduler = self.clone();
        std::thread::Builder::new()
            .name("db-maintenance".into())
            .spawn(move || {
                std::thread::sleep(cfg.maint_initial_delay);
                let mut last_sample = std::time::Instant::now();
                loop {
                    let store_for_job = Arc::clone(&store);
                    let step = cfg.maint_db_delay_step;
                    let ticket = scheduler.run_when_idle(
                        "db-maintenance",
                        move || {
                            for db in Db::ALL {
                                store_for_job.checkpoint_and_analyze(db)?;
                                debug!("Maintenance done on {}", db.label());
                                std::thread::sleep(step);
                            }
                            Ok(())
                        },
                        JobOptions {
                            retry_interval: cfg.maint_retry,
                            category: "maintenance",
                            ..JobOptions::default()
                        },
                    );
                    match ticket.wait() {
                        Ok(()) => info!("DB maintenance pass complete"),
                        Err(e) => warn!("DB maintenance pass failed: {}", e),
                    }

                    last_sample = store.sample_telemetry(
                        last_sample,
                        Duration::from_millis(DB_STATS_SAMPLE_INTERVAL_MS),
                    );
                    std::thread::sleep(cfg.maint_interval);
                }
            })
            .expect("Failed to spawn db maintenance thread");
    }
}

/// The serial chain: one job at a time, in arrival order.
fn scheduler_loop(rx: Receiver<JobRequest>, inner: Arc<SchedulerInner>) {
    for mut request in rx.iter() {
        let name = request.name.clone();
        let outcome = run_job(&inner, &name, &mut request.f, &request.opts);

        let waiters = inner.pending.lock().unwrap().remove(&name);
        inner.cancels.lock().unwrap().remove(&name);
        inner.states.lock().unwrap().insert(
            name.clone(),
            if outcome.is_ok() {
                JobState::Done
            } else {
                JobState::Failed
            },
        );

        if let Some(waiters) = waiters {
            for waiter in waiters {
                let _ = waiter.send(clone_outcome(&outcome));
            }
        }
    }
}

fn clone_outcome(outcome: &Result<()>) -> Result<()> {
    match outcome {
        Ok(()) => Ok(()),
        Err(e) => Err(ShoeboxError::Other(e.to_string())),
    }
}

/// One job's lifecycle: start delay, then loop over wait-idle -> lock ->
/// run until success, cancellation, or the attempt budget runs out.
fn run_job(
    inner: &Arc<SchedulerInner>,
    name: &str,
    f: &mut JobFn,
    opts: &JobOptions,
) -> Result<()> {
    let set_state = |state: JobState| {
        inner.states.lock().unwrap().insert(name.to_string(), state);
    };
    let cancelled = || {
        inner
            .cancels
            .lock()
            .unwrap()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(false)
    };

    if !opts.start_delay.is_zero() {
        std::thread::sleep(opts.start_delay);
    }

    let mut attempts = 0u32;
    loop {
        if cancelled() {
            info!("Job '{}' cancelled", name);
            return Err(ShoeboxError::Worker(format!("job {} cancelled", name)));
        }

        set_state(JobState::WaitingIdle);
        if !inner
            .idle
            .gate(name, opts.max_idle_wait, opts.idle_check_interval)
        {
            // Window never opened inside the budget: proceed anyway, per
            // the gate contract, so starved jobs still make progress.
            debug!("Job '{}' proceeding without idle window", name);
        }

        set_state(JobState::Locking);
        let guard = match inner.locks.try_acquire(name, opts.lock_ttl) {
            Some(g) => g,
            None => {
                debug!("Job '{}' lock unavailable, retrying", name);
                set_state(JobState::Retrying);
                std::thread::sleep(opts.retry_interval);
                continue;
            }
        };

        set_state(JobState::Running);
        info!("Job '{}' running ({})", name, opts.category);
        let result = f();
        drop(guard);

        match result {
            Ok(()) => {
                info!("Job '{}' complete", name);
                return Ok(());
            }
            Err(e) => {
                attempts += 1;
                error!("Job '{}' failed (attempt {}): {}", name, attempts, e);
                if attempts >= opts.max_attempts {
                    return Err(e);
                }
                set_state(JobState::Retrying);
                std::thread::sleep(opts.retry_interval);
            }
        }
    }
}
