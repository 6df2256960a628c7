// Indexing subsystem
//
// The indexing worker runs on its own thread and is the sole writer of
// `items`, `items_fts`, `thumb_status`, and `album_covers`. The main side
// talks to it over tagged messages: requests go in with a trace id, and
// `result` / `log` / `error` events come back on an event channel that a
// dispatcher routes to completion tickets and the logging sink.

pub mod backfill;
pub mod changes;
pub mod rebuild;
pub mod tokenize;
pub mod walk;
pub mod worker;
pub mod writer;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::IndexConfig;
use crate::constants::{INDEXING_FLAG_KEY, INDEXING_FLAG_TTL_SEC};
use crate::db::{CatalogStore, RetryPolicy};
use crate::error::{Result, ShoeboxError};
use crate::kv::Kv;
use crate::media::DimensionCache;
use crate::scheduler::IdleMonitor;
use crate::tags::TagInvalidator;

// --- Change set -------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Add,
    Unlink,
    AddDir,
    UnlinkDir,
    Update,
}

impl ChangeType {
    pub fn is_delete(&self) -> bool {
        matches!(self, ChangeType::Unlink | ChangeType::UnlinkDir)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, ChangeType::AddDir | ChangeType::UnlinkDir)
    }
}

/// One consolidated filesystem change, by absolute path.
#[derive(Debug, Clone)]
pub struct PendingChange {
    pub change_type: ChangeType,
    pub file_path: PathBuf,
}

// --- Worker protocol --------------------------------------------------------

#[derive(Debug, Clone)]
pub enum WorkerRequest {
    RebuildIndex {
        photos_dir: PathBuf,
        sync_thumbnails: bool,
    },
    ProcessChanges {
        changes: Vec<PendingChange>,
        photos_dir: PathBuf,
    },
    BackfillMissingDimensions {
        photos_dir: PathBuf,
    },
    BackfillMissingMtime {
        photos_dir: PathBuf,
    },
    PostIndexBackfill {
        photos_dir: PathBuf,
    },
    GetAllMediaItems,
}

impl WorkerRequest {
    /// Critical tasks are mutually exclusive: at most one full rebuild or
    /// incremental change application is in flight process-wide.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            WorkerRequest::RebuildIndex { .. } | WorkerRequest::ProcessChanges { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            WorkerRequest::RebuildIndex { .. } => "rebuild_index",
            WorkerRequest::ProcessChanges { .. } => "process_changes",
            WorkerRequest::BackfillMissingDimensions { .. } => "backfill_missing_dimensions",
            WorkerRequest::BackfillMissingMtime { .. } => "backfill_missing_mtime",
            WorkerRequest::PostIndexBackfill { .. } => "post_index_backfill",
            WorkerRequest::GetAllMediaItems => "get_all_media_items",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaItemRow {
    pub path: String,
    pub kind: String,
    pub mtime: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum TaskResult {
    RebuildComplete {
        count: u64,
    },
    ProcessChangesComplete {
        video_paths: Vec<String>,
        needs_maintenance: bool,
    },
    BackfillDimensionsComplete {
        updated: u64,
    },
    BackfillMtimeComplete {
        updated: u64,
    },
    PostIndexBackfillComplete,
    AllMediaItemsResult {
        payload: Vec<MediaItemRow>,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

/// Outbound message from the worker. Every message carries the trace id of
/// the request it belongs to.
#[derive(Debug)]
pub enum WorkerEvent {
    Result(TaskResult),
    Log { level: LogLevel, message: String },
    Error { message: String },
}

struct RequestEnvelope {
    seq: u64,
    trace_id: String,
    request: WorkerRequest,
}

struct EventEnvelope {
    seq: u64,
    trace_id: String,
    critical: bool,
    event: WorkerEvent,
}

// --- Advisory indexing flag -------------------------------------------------

/// The `indexing_in_progress` flag: a short-TTL KV key other processes
/// respect, mirrored in a process-local bool for hot-path checks (the
/// watcher consults it per event).
pub struct IndexingFlag {
    kv: Arc<Kv>,
    local: AtomicBool,
}

impl IndexingFlag {
    pub fn new(kv: Arc<Kv>) -> Arc<Self> {
        Arc::new(Self {
            kv,
            local: AtomicBool::new(false),
        })
    }

    pub fn set(&self) {
        self.local.store(true, Ordering::Relaxed);
        self.refresh();
    }

    /// Re-arm the TTL; called between batches of a long rebuild.
    pub fn refresh(&self) {
        if let Err(e) = self.kv.set_ttl(
            INDEXING_FLAG_KEY,
            "1",
            Duration::from_secs(INDEXING_FLAG_TTL_SEC),
        ) {
            debug!("indexing_in_progress refresh failed: {}", e);
        }
    }

    pub fn clear(&self) {
        self.local.store(false, Ordering::Relaxed);
        if let Err(e) = self.kv.del(INDEXING_FLAG_KEY) {
            debug!("indexing_in_progress clear failed: {}", e);
        }
    }

    /// Hot-path check, no KV round trip.
    pub fn is_set_local(&self) -> bool {
        self.local.load(Ordering::Relaxed)
    }

    /// Cross-process check via the KV.
    pub fn is_set(&self) -> bool {
        if self.is_set_local() {
            return true;
        }
        matches!(self.kv.get(INDEXING_FLAG_KEY), Ok(Some(_)))
    }
}

// --- Indexer handle ---------------------------------------------------------

pub struct IndexerDeps {
    pub store: Arc<CatalogStore>,
    pub kv: Arc<Kv>,
    pub dims: Arc<DimensionCache>,
    pub idle: Arc<IdleMonitor>,
    pub flag: Arc<IndexingFlag>,
    pub cfg: IndexConfig,
}

struct WorkerLink {
    tx: Sender<RequestEnvelope>,
    generation: u64,
}

struct IndexerShared {
    deps: IndexerDeps,
    link: Mutex<WorkerLink>,
    pending: Arc<Mutex<HashMap<u64, Sender<Result<TaskResult>>>>>,
    critical_in_flight: Arc<AtomicBool>,
    criticals_running: Arc<AtomicU64>,
    alive: Arc<AtomicBool>,
    seq: AtomicU64,
}

/// Handle to the indexing worker thread.
pub struct Indexer {
    shared: Arc<IndexerShared>,
}

/// Completion handle for one submitted task.
pub struct TaskTicket {
    rx: Receiver<Result<TaskResult>>,
    seq: u64,
}

impl TaskTicket {
    pub fn wait(self) -> Result<TaskResult> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(ShoeboxError::Worker("indexing worker gone".into())))
    }
}

impl Indexer {
    pub fn spawn(deps: IndexerDeps) -> Self {
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let critical_in_flight = Arc::new(AtomicBool::new(false));
        let criticals_running = Arc::new(AtomicU64::new(0));
        let alive = Arc::new(AtomicBool::new(true));

        let tx = spawn_worker_threads(
            &deps,
            Arc::clone(&pending),
            Arc::clone(&critical_in_flight),
            Arc::clone(&criticals_running),
            Arc::clone(&alive),
        );

        Self {
            shared: Arc::new(IndexerShared {
                deps,
                link: Mutex::new(WorkerLink { tx, generation: 0 }),
                pending,
                critical_in_flight,
                criticals_running,
                alive,
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Submit a task. Critical tasks are rejected with `Conflict` while
    /// another critical is in flight.
    pub fn submit(&self, request: WorkerRequest) -> Result<TaskTicket> {
        let critical = request.is_critical();
        if critical
            && self
                .shared
                .critical_in_flight
                .swap(true, Ordering::SeqCst)
        {
            return Err(ShoeboxError::Conflict(format!(
                "critical indexing task already in flight, rejecting {}",
                request.label()
            )));
        }

        let seq = self.shared.seq.fetch_add(1, Ordering::SeqCst);
        let trace_id = Uuid::new_v4().to_string();
        let (done_tx, done_rx) = bounded(1);
        self.shared.pending.lock().unwrap().insert(seq, done_tx);

        debug!("Submitting {} (trace {})", request.label(), trace_id);
        let link = self.shared.link.lock().unwrap();
        let sent = link.tx.send(RequestEnvelope {
            seq,
            trace_id,
            request,
        });
        drop(link);

        if sent.is_err() {
            self.shared.pending.lock().unwrap().remove(&seq);
            if critical {
                self.shared
                    .critical_in_flight
                    .store(false, Ordering::SeqCst);
            }
            return Err(ShoeboxError::Worker("indexing worker unavailable".into()));
        }

        Ok(TaskTicket { rx: done_rx, seq })
    }

    /// Submit and wait with a deadline. On timeout the worker is abandoned
    /// and a fresh one is spawned; the job driver releases its lock when
    /// this error propagates.
    pub fn run_with_timeout(
        &self,
        request: WorkerRequest,
        timeout: Duration,
    ) -> Result<TaskResult> {
        let label = request.label();
        let critical = request.is_critical();
        let ticket = self.submit(request)?;

        match ticket.rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(
                    "Task {} exceeded {} ms, terminating worker",
                    label,
                    timeout.as_millis()
                );
                self.shared.pending.lock().unwrap().remove(&ticket.seq);
                if critical {
                    self.shared
                        .critical_in_flight
                        .store(false, Ordering::SeqCst);
                }
                self.respawn();
                Err(ShoeboxError::Timeout(format!(
                    "{} exceeded {} ms",
                    label,
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Replace the worker thread. The old thread finishes (or hangs on) its
    /// current task in the background and exits when its request channel
    /// drops; its late events are discarded.
    fn respawn(&self) {
        let deps = IndexerDeps {
            store: Arc::clone(&self.shared.deps.store),
            kv: Arc::clone(&self.shared.deps.kv),
            dims: Arc::clone(&self.shared.deps.dims),
            idle: Arc::clone(&self.shared.deps.idle),
            flag: Arc::clone(&self.shared.deps.flag),
            cfg: self.shared.deps.cfg.clone(),
        };

        // Stale state from the abandoned task must not wedge the new worker.
        self.shared.deps.flag.clear();

        let tx = spawn_worker_threads(
            &deps,
            Arc::clone(&self.shared.pending),
            Arc::clone(&self.shared.critical_in_flight),
            Arc::clone(&self.shared.criticals_running),
            Arc::clone(&self.shared.alive),
        );

        let mut link = self.shared.link.lock().unwrap();
        link.tx = tx;
        link.generation += 1;
        warn!("Indexing worker respawned (generation {})", link.generation);
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Relaxed)
    }

    /// Instrumentation: how many critical tasks are executing right now.
    pub fn criticals_in_flight(&self) -> u64 {
        self.shared.criticals_running.load(Ordering::SeqCst)
    }
}

/// Spawn a worker/dispatcher pair and return the request sender.
fn spawn_worker_threads(
    deps: &IndexerDeps,
    pending: Arc<Mutex<HashMap<u64, Sender<Result<TaskResult>>>>>,
    critical_in_flight: Arc<AtomicBool>,
    criticals_running: Arc<AtomicU64>,
    alive: Arc<AtomicBool>,
) -> Sender<RequestEnvelope> {
    let (req_tx, req_rx) = unbounded::<RequestEnvelope>();
    let (event_tx, event_rx) = unbounded::<EventEnvelope>();

    let ctx = worker::WorkerContext {
        store: Arc::clone(&deps.store),
        kv: Arc::clone(&deps.kv),
        dims: Arc::clone(&deps.dims),
        idle: Arc::clone(&deps.idle),
        flag: Arc::clone(&deps.flag),
        tags: TagInvalidator::new(Arc::clone(&deps.kv)),
        retry: RetryPolicy::default(),
        cfg: deps.cfg.clone(),
        criticals_running,
    };

    let worker_alive = Arc::clone(&alive);
    std::thread::Builder::new()
        .name("index-worker".into())
        .spawn(move || {
            worker::worker_loop(req_rx, event_tx, ctx);
            worker_alive.store(false, Ordering::Relaxed);
        })
        .expect("Failed to spawn indexing worker thread");

    std::thread::Builder::new()
        .name("index-dispatch".into())
        .spawn(move || dispatcher_loop(event_rx, pending, critical_in_flight))
        .expect("Failed to spawn indexing dispatcher thread");

    req_tx
}

/// Route worker events: forward logs to the sink, restore the trace context
/// in the message, resolve tickets on result/error, and clear the critical
/// latch when a critical task ends.
fn dispatcher_loop(
    rx: Receiver<EventEnvelope>,
    pending: Arc<Mutex<HashMap<u64, Sender<Result<TaskResult>>>>>,
    critical_in_flight: Arc<AtomicBool>,
) {
    for envelope in rx.iter() {
        match envelope.event {
            WorkerEvent::Log { level, message } => match level {
                LogLevel::Debug => debug!("[index {}] {}", envelope.trace_id, message),
                LogLevel::Info => info!("[index {}] {}", envelope.trace_id, message),
                LogLevel::Warn => warn!("[index {}] {}", envelope.trace_id, message),
            },
            WorkerEvent::Result(result) => {
                // Only a still-pending task may clear the critical latch; a
                // late event from an abandoned worker must not release a
                // latch that now belongs to a newer task.
                if let Some(tx) = pending.lock().unwrap().remove(&envelope.seq) {
                    if envelope.critical {
                        critical_in_flight.store(false, Ordering::SeqCst);
                    }
                    let _ = tx.send(Ok(result));
                }
            }
            WorkerEvent::Error { message } => {
                error!("[index {}] {}", envelope.trace_id, message);
                if let Some(tx) = pending.lock().unwrap().remove(&envelope.seq) {
                    if envelope.critical {
                        critical_in_flight.store(false, Ordering::SeqCst);
                    }
                    let _ = tx.send(Err(ShoeboxError::Worker(message)));
                }
            }
        }
    }
}
