// Indexing worker thread
//
// Executes one request at a time off the request channel. Criticals set the
// advisory indexing flag for their duration; panics are caught so a bad
// file never kills the worker (the teacher for every long-lived worker
// thread in this codebase).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use super::{
    backfill, changes, rebuild, EventEnvelope, IndexingFlag, LogLevel, MediaItemRow,
    RequestEnvelope, TaskResult, WorkerEvent, WorkerRequest,
};
use crate::config::IndexConfig;
use crate::db::{CatalogStore, Db, RetryPolicy};
use crate::error::Result;
use crate::kv::Kv;
use crate::media::DimensionCache;
use crate::scheduler::IdleMonitor;
use crate::tags::TagInvalidator;

pub struct WorkerContext {
    pub store: Arc<CatalogStore>,
    pub kv: Arc<Kv>,
    pub dims: Arc<DimensionCache>,
    pub idle: Arc<IdleMonitor>,
    pub flag: Arc<IndexingFlag>,
    pub tags: TagInvalidator,
    pub retry: RetryPolicy,
    pub cfg: IndexConfig,
    pub criticals_running: Arc<AtomicU64>,
}

/// Event emitter bound to one request; carries the trace context into
/// every outgoing message.
pub struct Emitter<'a> {
    tx: &'a Sender<EventEnvelope>,
    seq: u64,
    trace_id: &'a str,
    critical: bool,
}

impl Emitter<'_> {
    pub fn log(&self, level: LogLevel, message: String) {
        let _ = self.tx.send(EventEnvelope {
            seq: self.seq,
            trace_id: self.trace_id.to_string(),
            critical: self.critical,
            event: WorkerEvent::Log { level, message },
        });
    }

    pub fn info(&self, message: String) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: String) {
        self.log(LogLevel::Warn, message);
    }

    pub fn debug(&self, message: String) {
        self.log(LogLevel::Debug, message);
    }

    fn finish(&self, outcome: WorkerEvent) {
        let _ = self.tx.send(EventEnvelope {
            seq: self.seq,
            trace_id: self.trace_id.to_string(),
            critical: self.critical,
            event: outcome,
        });
    }
}

pub(super) fn worker_loop(
    rx: Receiver<RequestEnvelope>,
    event_tx: Sender<EventEnvelope>,
    ctx: WorkerContext,
) {
    for envelope in rx.iter() {
        let critical = envelope.request.is_critical();
        let emitter = Emitter {
            tx: &event_tx,
            seq: envelope.seq,
            trace_id: &envelope.trace_id,
            critical,
        };

        if critical {
            ctx.criticals_running.fetch_add(1, Ordering::SeqCst);
            ctx.flag.set();
        }

        let label = envelope.request.label();
        let request = envelope.request.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| dispatch(&ctx, &emitter, request)));

        if critical {
            ctx.flag.clear();
            ctx.criticals_running.fetch_sub(1, Ordering::SeqCst);
        }

        match outcome {
            Ok(Ok(result)) => emitter.finish(WorkerEvent::Result(result)),
            Ok(Err(e)) => emitter.finish(WorkerEvent::Error {
                message: format!("{} failed: {}", label, e),
            }),
            Err(_) => emitter.finish(WorkerEvent::Error {
                message: format!("{} panicked (recovered)", label),
            }),
        }
    }
}

fn dispatch(ctx: &WorkerContext, emitter: &Emitter<'_>, request: WorkerRequest) -> Result<TaskResult> {
    match request {
        WorkerRequest::RebuildIndex {
            photos_dir,
            sync_thumbnails,
        } => rebuild::rebuild_index(ctx, emitter, &photos_dir, sync_thumbnails),
        WorkerRequest::ProcessChanges {
            changes: change_set,
            photos_dir,
        } => changes::process_changes(ctx, emitter, change_set, &photos_dir),
        WorkerRequest::BackfillMissingDimensions { photos_dir } => {
            backfill::backfill_missing_dimensions(ctx, emitter, &photos_dir)
        }
        WorkerRequest::BackfillMissingMtime { photos_dir } => {
            backfill::backfill_missing_mtime(ctx, emitter, &photos_dir)
        }
        WorkerRequest::PostIndexBackfill { photos_dir } => {
            backfill::post_index_backfill(ctx, emitter, &photos_dir)
        }
        WorkerRequest::GetAllMediaItems => get_all_media_items(ctx),
    }
}

/// Snapshot of all media rows; the thumbnail generator's bulk sync feed.
fn get_all_media_items(ctx: &WorkerContext) -> Result<TaskResult> {
    let payload = ctx.store.all(
        Db::Main,
        "SELECT path, type, mtime, width, height FROM items
         WHERE type IN ('photo', 'video') ORDER BY path",
        &[],
        |r| {
            Ok(MediaItemRow {
                path: r.get(0)?,
                kind: r.get(1)?,
                mtime: r.get(2)?,
                width: r.get(3)?,
                height: r.get(4)?,
            })
        },
    )?;
    Ok(TaskResult::AllMediaItemsResult { payload })
}
