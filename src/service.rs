// Index service
//
// Glue between the watcher, the orchestrator, and the indexing worker:
// drained change sets are admitted and applied, rebuilds are scheduled as
// named jobs (with the watcher suspended for their duration), and task
// completions fan out into video handoff and post-index maintenance.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};

use crate::config::Config;
use crate::constants::WATCHER_RESTART_DELAY_MS;
use crate::db::CatalogStore;
use crate::error::{Result, ShoeboxError};
use crate::index::{
    rebuild, Indexer, PendingChange, TaskResult, WorkerRequest,
};
use crate::scheduler::{JobOptions, Scheduler};
use crate::video::{sanitize_video_paths, VideoPipeline};
use crate::watcher::{ChangeSink, LibraryWatcher};

pub const REBUILD_JOB: &str = "rebuild-index";
pub const POST_BACKFILL_JOB: &str = "post-index-backfill";
pub const STARTUP_BACKFILL_JOB: &str = "startup-backfill";

pub struct IndexService {
    store: Arc<CatalogStore>,
    indexer: Indexer,
    scheduler: Scheduler,
    video: Arc<dyn VideoPipeline>,
    cfg: Config,
    watcher: Mutex<Option<Arc<LibraryWatcher>>>,
    inflight_submissions: AtomicU64,
}

impl IndexService {
    pub fn new(
        store: Arc<CatalogStore>,
        indexer: Indexer,
        scheduler: Scheduler,
        video: Arc<dyn VideoPipeline>,
        cfg: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            indexer,
            scheduler,
            video,
            cfg,
            watcher: Mutex::new(None),
            inflight_submissions: AtomicU64::new(0),
        })
    }

    /// Wire the watcher in after it starts (it needs this service as its
    /// sink first).
    pub fn attach_watcher(&self, watcher: Arc<LibraryWatcher>) {
        *self.watcher.lock().unwrap() = Some(watcher);
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Schedule a full rebuild as the named singleton job. `immediate`
    /// skips the start delay and idle wait (cold start).
    pub fn schedule_rebuild(self: &Arc<Self>, immediate: bool) {
        let service = Arc::clone(self);
        let opts = if immediate {
            JobOptions {
                start_delay: Duration::ZERO,
                max_idle_wait: Duration::ZERO,
                lock_ttl: Duration::from_secs(self.cfg.index.lock_ttl_sec),
                retry_interval: self.cfg.index.retry_interval,
                category: "indexing",
                ..JobOptions::default()
            }
        } else {
            JobOptions {
                start_delay: self.cfg.index.start_delay,
                retry_interval: self.cfg.index.retry_interval,
                lock_ttl: Duration::from_secs(self.cfg.index.lock_ttl_sec),
                category: "indexing",
                ..JobOptions::default()
            }
        };

        self.scheduler
            .run_when_idle(REBUILD_JOB, move || service.run_rebuild(), opts);
    }

    /// The rebuild job body: watcher off, rebuild with a deadline, watcher
    /// back on after a short settle delay.
    fn run_rebuild(self: &Arc<Self>) -> Result<()> {
        let watcher = self.watcher.lock().unwrap().clone();
        if let Some(ref w) = watcher {
            w.suspend();
        }

        let outcome = self.indexer.run_with_timeout(
            WorkerRequest::RebuildIndex {
                photos_dir: self.cfg.photos_dir.clone(),
                sync_thumbnails: false,
            },
            self.cfg.index.timeout,
        );

        if let Some(ref w) = watcher {
            std::thread::sleep(Duration::from_millis(WATCHER_RESTART_DELAY_MS));
            w.resume();
        }

        match outcome {
            Ok(TaskResult::RebuildComplete { count }) => {
                info!("Rebuild finished with {} items", count);
                self.schedule_post_index_backfill();
                Ok(())
            }
            Ok(other) => Err(ShoeboxError::Worker(format!(
                "unexpected rebuild result: {:?}",
                other
            ))),
            Err(e) => Err(e),
        }
    }

    pub fn schedule_post_index_backfill(self: &Arc<Self>) {
        let service = Arc::clone(self);
        let opts = JobOptions {
            start_delay: self.cfg.scheduler.post_backfill_delay,
            retry_interval: self.cfg.scheduler.post_backfill_retry,
            category: "maintenance",
            ..JobOptions::default()
        };
        self.scheduler.run_when_idle(
            POST_BACKFILL_JOB,
            move || {
                let result = service.indexer.run_with_timeout(
                    WorkerRequest::PostIndexBackfill {
                        photos_dir: service.cfg.photos_dir.clone(),
                    },
                    service.cfg.scheduler.post_backfill_timeout,
                )?;
                if let TaskResult::PostIndexBackfillComplete = result {
                    Ok(())
                } else {
                    Err(ShoeboxError::Worker(format!(
                        "unexpected backfill result: {:?}",
                        result
                    )))
                }
            },
            opts,
        );
    }

    /// Startup maintenance: dimension backfill then mtime backfill, behind
    /// the idle gate like every background job.
    pub fn schedule_startup_backfill(self: &Arc<Self>) {
        let service = Arc::clone(self);
        let opts = JobOptions {
            start_delay: self.cfg.scheduler.post_backfill_delay,
            retry_interval: self.cfg.scheduler.post_backfill_retry,
            category: "maintenance",
            ..JobOptions::default()
        };
        self.scheduler.run_when_idle(
            STARTUP_BACKFILL_JOB,
            move || {
                service.indexer.run_with_timeout(
                    WorkerRequest::PostIndexBackfill {
                        photos_dir: service.cfg.photos_dir.clone(),
                    },
                    service.cfg.scheduler.post_backfill_timeout,
                )?;
                Ok(())
            },
            opts,
        );
    }

    /// Cold start / resume decisions from the startup sequence.
    pub fn schedule_startup_index(self: &Arc<Self>) -> Result<()> {
        if self.cfg.index.disable_startup_index {
            info!("Startup indexing disabled by configuration");
            return Ok(());
        }

        let item_count = self
            .store
            .get(
                crate::db::Db::Main,
                "SELECT COUNT(*) FROM items",
                &[],
                |r| r.get::<_, i64>(0),
            )?
            .unwrap_or(0);
        let cursor = rebuild::read_cursor(&self.store)?;

        if item_count == 0 {
            info!("Catalog empty, triggering immediate rebuild");
            self.schedule_rebuild(true);
        } else if cursor.is_some() {
            info!("Resume cursor present, scheduling rebuild continuation");
            rebuild::set_status(&self.store, "pending")?;
            self.schedule_rebuild(false);
        } else {
            self.schedule_startup_backfill();
        }
        Ok(())
    }

    fn handle_changes_result(self: &Arc<Self>, result: TaskResult) {
        if let TaskResult::ProcessChangesComplete {
            video_paths,
            needs_maintenance,
        } = result
        {
            if !video_paths.is_empty() {
                let clean = sanitize_video_paths(&self.cfg.photos_dir, &video_paths);
                self.video.enqueue(clean, &self.cfg.thumbs_dir);
            }
            if needs_maintenance {
                self.schedule_post_index_backfill();
            }
        }
    }
}

impl ChangeSink for Arc<IndexService> {
    /// Apply one drained change set: admission first, then the worker.
    fn submit_changes(&self, changes: Vec<PendingChange>) {
        self.inflight_submissions.fetch_add(1, Ordering::SeqCst);
        let _guard = DecrementOnDrop(&self.inflight_submissions);

        // Yield to interactive traffic, bounded so changes never starve.
        self.scheduler
            .gate("incremental-index", self.cfg.scheduler.idle_max_wait);

        match self.indexer.run_with_timeout(
            WorkerRequest::ProcessChanges {
                changes,
                photos_dir: self.cfg.photos_dir.clone(),
            },
            self.cfg.index.timeout,
        ) {
            Ok(result) => self.handle_changes_result(result),
            Err(ShoeboxError::Conflict(msg)) => {
                // A rebuild owns the catalog right now; it will pick these
                // files up itself.
                warn!("Change set dropped: {}", msg);
            }
            Err(e) => error!("Incremental indexing failed: {}", e),
        }
    }

    fn request_rebuild(&self) {
        self.schedule_rebuild(false);
    }

    fn index_active(&self) -> bool {
        self.inflight_submissions.load(Ordering::SeqCst) > 0
            || self.indexer.criticals_in_flight() > 0
            || matches!(
                self.scheduler.job_state(REBUILD_JOB),
                Some(
                    crate::scheduler::JobState::Queued
                        | crate::scheduler::JobState::WaitingIdle
                        | crate::scheduler::JobState::Locking
                        | crate::scheduler::JobState::Running
                        | crate::scheduler::JobState::Retrying
                )
            )
    }
}

struct DecrementOnDrop<'a>(&'a AtomicU64);

impl Drop for DecrementOnDrop<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Convenience for tests and callers that need the photo root the service
/// was built for.
impl IndexService {
    pub fn photos_dir(&self) -> &PathBuf {
        &self.cfg.photos_dir
    }
}
