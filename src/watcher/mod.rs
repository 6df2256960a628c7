// Filesystem watcher
//
// Watches the photo root, classifies and filters raw notify events into
// pending per-path event lists, and drains them on an adaptive debounce
// into one consolidated change set. The watcher suspends itself while a
// rebuild owns the tree and closes down after a long quiet spell.

pub mod consolidate;
pub mod fingerprint;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::WatchConfig;
use crate::constants::{
    DEBOUNCE_TIER_HUGE, DEBOUNCE_TIER_HUGE_MS, DEBOUNCE_TIER_LARGE, DEBOUNCE_TIER_LARGE_MS,
    DEBOUNCE_TIER_MEDIUM, DEBOUNCE_TIER_MEDIUM_MS, IGNORED_DIRS, WATCHER_SKIP_LOG_SAMPLE,
    WATCHER_TICK_MS,
};
use crate::error::{Result, ShoeboxError};
use crate::index::{ChangeType, IndexingFlag, PendingChange};
use crate::media::{classify_file, is_rejected_file};
use crate::paths;
use crate::tags::TagInvalidator;
use consolidate::{consolidate, PendingEvent};

/// Where drained change sets go. The index service implements this.
pub trait ChangeSink: Send + Sync {
    fn submit_changes(&self, changes: Vec<PendingChange>);
    fn request_rebuild(&self);
    /// True while any index job is queued or running; gates idle auto-stop.
    fn index_active(&self) -> bool;
}

struct WatcherShared {
    photos_dir: PathBuf,
    cfg: WatchConfig,
    sink: Arc<dyn ChangeSink>,
    tags: TagInvalidator,
    flag: Arc<IndexingFlag>,
    pending: Mutex<HashMap<PathBuf, Vec<PendingEvent>>>,
    deadline: Mutex<Option<Instant>>,
    last_event: Mutex<Instant>,
    suspended: AtomicBool,
    stopped: AtomicBool,
    skipped: AtomicU64,
}

pub struct LibraryWatcher {
    shared: Arc<WatcherShared>,
    // Kept alive for the watcher's lifetime; dropped on stop.
    backend: Mutex<Option<Box<dyn Watcher + Send>>>,
}

impl LibraryWatcher {
    pub fn start(
        photos_dir: &Path,
        cfg: WatchConfig,
        sink: Arc<dyn ChangeSink>,
        tags: TagInvalidator,
        flag: Arc<IndexingFlag>,
    ) -> Result<Arc<Self>> {
        let shared = Arc::new(WatcherShared {
            photos_dir: photos_dir.to_path_buf(),
            cfg,
            sink,
            tags,
            flag,
            pending: Mutex::new(HashMap::new()),
            deadline: Mutex::new(None),
            last_event: Mutex::new(Instant::now()),
            suspended: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            skipped: AtomicU64::new(0),
        });

        let handler_shared = Arc::clone(&shared);
        let handler = move |result: notify::Result<Event>| match result {
            Ok(event) => handle_event(&handler_shared, event),
            Err(e) => warn!("Watcher error: {}", e),
        };

        let notify_cfg = notify::Config::default().with_poll_interval(shared.cfg.poll_interval);
        let mut backend: Box<dyn Watcher + Send> = if shared.cfg.use_polling {
            Box::new(
                PollWatcher::new(handler, notify_cfg)
                    .map_err(|e| ShoeboxError::Other(format!("poll watcher: {}", e)))?,
            )
        } else {
            Box::new(
                RecommendedWatcher::new(handler, notify_cfg)
                    .map_err(|e| ShoeboxError::Other(format!("watcher: {}", e)))?,
            )
        };
        backend
            .watch(photos_dir, RecursiveMode::Recursive)
            .map_err(|e| ShoeboxError::Other(format!("watch {}: {}", photos_dir.display(), e)))?;

        let watcher = Arc::new(Self {
            shared,
            backend: Mutex::new(Some(backend)),
        });

        let tick_watcher = Arc::clone(&watcher);
        std::thread::Builder::new()
            .name("watcher-drain".into())
            .spawn(move || tick_loop(tick_watcher))
            .expect("Failed to spawn watcher drain thread");

        info!("Watching {}", photos_dir.display());
        Ok(watcher)
    }

    /// Paused for the duration of a full rebuild.
    pub fn suspend(&self) {
        self.shared.suspended.store(true, Ordering::Relaxed);
        debug!("Watcher suspended");
    }

    pub fn resume(&self) {
        self.shared.suspended.store(false, Ordering::Relaxed);
        *self.shared.last_event.lock().unwrap() = Instant::now();
        debug!("Watcher resumed");
    }

    pub fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::Relaxed) {
            *self.backend.lock().unwrap() = None;
            info!("Watcher stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Relaxed)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    /// Test/inspection hook: force an immediate drain.
    pub fn drain_now(&self) {
        drain(&self.shared);
    }
}

// --- Event intake -----------------------------------------------------------

fn handle_event(shared: &Arc<WatcherShared>, event: Event) {
    if shared.stopped.load(Ordering::Relaxed) {
        return;
    }

    // While a rebuild owns the tree, raw events are skipped; the rebuild
    // will see the files anyway. Sampled logging keeps the noise down.
    if shared.suspended.load(Ordering::Relaxed) || shared.flag.is_set_local() {
        let skipped = shared.skipped.fetch_add(1, Ordering::Relaxed);
        if skipped % WATCHER_SKIP_LOG_SAMPLE == 0 {
            debug!("Skipping watcher events during indexing ({} so far)", skipped + 1);
        }
        return;
    }

    match event.kind {
        EventKind::Create(kind) => {
            for path in &event.paths {
                let is_dir = match kind {
                    CreateKind::Folder => true,
                    CreateKind::File => false,
                    _ => path.is_dir(),
                };
                enqueue_classified(shared, path, is_dir, false);
            }
        }
        EventKind::Remove(kind) => {
            for path in &event.paths {
                let is_dir = match kind {
                    RemoveKind::Folder => true,
                    RemoveKind::File => false,
                    // The entry is gone; a media extension means it was a
                    // file, anything else is treated as a directory.
                    _ => classify_file(path).is_none(),
                };
                enqueue_classified(shared, path, is_dir, true);
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => {
                for path in &event.paths {
                    enqueue_classified(shared, path, classify_file(path).is_none(), true);
                }
            }
            RenameMode::To => {
                for path in &event.paths {
                    enqueue_classified(shared, path, path.is_dir(), false);
                }
            }
            _ => {
                // Both/other: first path is the source, last the target.
                if let Some(from) = event.paths.first() {
                    enqueue_classified(shared, from, classify_file(from).is_none(), true);
                }
                if event.paths.len() > 1 {
                    if let Some(to) = event.paths.last() {
                        enqueue_classified(shared, to, to.is_dir(), false);
                    }
                }
            }
        },
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            for path in &event.paths {
                if path.is_file() {
                    if accepts_file(shared, path) {
                        enqueue(shared, path, PendingEvent::new(ChangeType::Update));
                    }
                }
            }
        }
        _ => {}
    }
}

fn enqueue_classified(shared: &Arc<WatcherShared>, path: &Path, is_dir: bool, removal: bool) {
    if !accepts_path(shared, path, is_dir) {
        return;
    }

    let event = match (is_dir, removal) {
        (true, false) => PendingEvent::new(ChangeType::AddDir),
        (true, true) => PendingEvent::new(ChangeType::UnlinkDir),
        (false, true) => PendingEvent::new(ChangeType::Unlink),
        (false, false) => PendingEvent::with_fingerprint(
            ChangeType::Add,
            fingerprint::fingerprint_for_add(
                path,
                shared.cfg.hash_size_threshold,
                shared.cfg.hash_sample_bytes,
            ),
        ),
    };
    enqueue(shared, path, event);
}

/// Directory events are accepted unconditionally (modulo hidden/system
/// filtering); file events only for supported media extensions.
fn accepts_path(shared: &Arc<WatcherShared>, path: &Path, is_dir: bool) -> bool {
    let Ok(rel) = paths::normalize_rel(&shared.photos_dir, path) else {
        return false;
    };

    let parts: Vec<&str> = rel.split('/').collect();
    if parts.len() > shared.cfg.depth {
        return false;
    }
    for part in &parts {
        if part.starts_with('.') || IGNORED_DIRS.contains(part) {
            return false;
        }
    }

    if is_dir {
        true
    } else {
        !is_rejected_file(path) && classify_file(path).is_some()
    }
}

fn accepts_file(shared: &Arc<WatcherShared>, path: &Path) -> bool {
    accepts_path(shared, path, false)
}

fn enqueue(shared: &Arc<WatcherShared>, path: &Path, event: PendingEvent) {
    let pending_count = {
        let mut pending = shared.pending.lock().unwrap();
        pending.entry(path.to_path_buf()).or_default().push(event);
        pending.len()
    };

    *shared.last_event.lock().unwrap() = Instant::now();

    // Every enqueue resets the debounce; the delay stretches with the
    // backlog so a mass copy coalesces into few drains.
    let delay = debounce_delay(&shared.cfg, pending_count);
    *shared.deadline.lock().unwrap() = Some(Instant::now() + delay);
}

fn debounce_delay(cfg: &WatchConfig, pending_count: usize) -> Duration {
    let base = if pending_count >= DEBOUNCE_TIER_HUGE {
        Duration::from_millis(DEBOUNCE_TIER_HUGE_MS)
    } else if pending_count >= DEBOUNCE_TIER_LARGE {
        Duration::from_millis(DEBOUNCE_TIER_LARGE_MS)
    } else if pending_count >= DEBOUNCE_TIER_MEDIUM {
        Duration::from_millis(DEBOUNCE_TIER_MEDIUM_MS)
    } else {
        cfg.stabilize_delay
    };
    base.max(cfg.stability_threshold)
}

// --- Drain loop -------------------------------------------------------------

fn tick_loop(watcher: Arc<LibraryWatcher>) {
    let shared = &watcher.shared;
    loop {
        std::thread::sleep(Duration::from_millis(WATCHER_TICK_MS));
        if shared.stopped.load(Ordering::Relaxed) {
            return;
        }

        let due = shared
            .deadline
            .lock()
            .unwrap()
            .map(|d| d <= Instant::now())
            .unwrap_or(false);

        if due && !shared.suspended.load(Ordering::Relaxed) && !shared.flag.is_set_local() {
            *shared.deadline.lock().unwrap() = None;
            drain(shared);
        }

        // Idle auto-stop: a long quiet spell with nothing queued and no
        // index job active means nobody needs live events.
        let quiet_for = shared.last_event.lock().unwrap().elapsed();
        if quiet_for >= shared.cfg.idle_stop
            && shared.pending.lock().unwrap().is_empty()
            && !shared.sink.index_active()
        {
            info!("Watcher idle for {:?}, closing", quiet_for);
            watcher.stop();
            return;
        }
    }
}

fn drain(shared: &Arc<WatcherShared>) {
    let drained: HashMap<PathBuf, Vec<PendingEvent>> =
        std::mem::take(&mut *shared.pending.lock().unwrap());
    if drained.is_empty() {
        return;
    }
    let pending_count = drained.len();

    let mut changes: Vec<PendingChange> = Vec::new();
    let mut tags: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();

    for (path, events) in drained {
        let Some(event) = consolidate(&events) else {
            continue;
        };
        if let Ok(rel) = paths::normalize_rel(&shared.photos_dir, &path) {
            tags.extend(paths::album_tag_chain(&rel));
        }
        changes.push(PendingChange {
            change_type: event.change_type,
            file_path: path,
        });
    }

    // Everything cancelled out: no writes, no invalidation, no job.
    if changes.is_empty() {
        debug!("Drain consolidated to empty set");
        return;
    }

    shared.tags.invalidate(&tags, pending_count);

    if changes.len() > shared.cfg.escalation_threshold {
        warn!(
            "Change set of {} exceeds escalation threshold {}, requesting full rebuild",
            changes.len(),
            shared.cfg.escalation_threshold
        );
        shared.sink.request_rebuild();
    } else {
        info!("Submitting {} consolidated changes", changes.len());
        shared.sink.submit_changes(changes);
    }
}
