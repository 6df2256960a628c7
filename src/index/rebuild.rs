// Full catalog rebuild
//
// Streams the photo tree into the catalog in batches. A resume cursor
// (`last_processed_path`) is written after every committed batch, so a
// killed rebuild continues where it stopped instead of starting over; the
// truncate only happens on a fresh pass. INSERT OR IGNORE protects rows
// that survived a partial pass, and the FTS row is always REPLACEd so the
// pair stays consistent on resume.

use std::cmp::Ordering;
use std::path::Path;

use chrono::Utc;

use super::walk::{prescan_count, walk_media, WalkEntry};
use super::worker::{Emitter, WorkerContext};
use super::writer::{rebuild_album_covers, resolve_dimensions, write_batch, ThumbSync};
use super::TaskResult;
use crate::db::{Db, TxMode};
use crate::error::Result;
use crate::paths;

pub const RESUME_CURSOR_KEY: &str = "last_processed_path";

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// --- index_status / index_progress helpers ---------------------------------

pub fn read_status(store: &crate::db::CatalogStore) -> Result<Option<String>> {
    store.get(
        Db::Index,
        "SELECT status FROM index_status WHERE id = 1",
        &[],
        |r| r.get(0),
    )
}

pub fn read_cursor(store: &crate::db::CatalogStore) -> Result<Option<String>> {
    store.get(
        Db::Index,
        "SELECT value FROM index_progress WHERE key = ?1",
        &[&RESUME_CURSOR_KEY],
        |r| r.get(0),
    )
}

pub fn write_cursor(store: &crate::db::CatalogStore, value: &str) -> Result<()> {
    store.run(
        Db::Index,
        "INSERT INTO index_progress (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        &[&RESUME_CURSOR_KEY, &value],
    )?;
    Ok(())
}

pub fn clear_cursor(store: &crate::db::CatalogStore) -> Result<()> {
    store.run(
        Db::Index,
        "DELETE FROM index_progress WHERE key = ?1",
        &[&RESUME_CURSOR_KEY],
    )?;
    Ok(())
}

pub fn set_status(store: &crate::db::CatalogStore, status: &str) -> Result<()> {
    store.run(
        Db::Index,
        "UPDATE index_status SET status = ?1, last_updated = ?2 WHERE id = 1",
        &[&status, &now_ms()],
    )?;
    Ok(())
}

fn set_progress(store: &crate::db::CatalogStore, processed: u64, total: Option<u64>) -> Result<()> {
    match total {
        Some(total) => store.run(
            Db::Index,
            "UPDATE index_status SET processed_files = ?1, total_files = ?2, last_updated = ?3
             WHERE id = 1",
            &[&(processed as i64), &(total as i64), &now_ms()],
        )?,
        None => store.run(
            Db::Index,
            "UPDATE index_status SET processed_files = ?1, last_updated = ?2 WHERE id = 1",
            &[&(processed as i64), &now_ms()],
        )?,
    };
    Ok(())
}

fn read_processed(store: &crate::db::CatalogStore) -> Result<u64> {
    Ok(store
        .get(
            Db::Index,
            "SELECT processed_files FROM index_status WHERE id = 1",
            &[],
            |r| r.get::<_, i64>(0),
        )?
        .unwrap_or(0)
        .max(0) as u64)
}

// --- Rebuild ----------------------------------------------------------------

pub fn rebuild_index(
    ctx: &WorkerContext,
    emitter: &Emitter<'_>,
    photos_dir: &Path,
    sync_thumbnails: bool,
) -> Result<TaskResult> {
    let resume = read_cursor(&ctx.store)?;
    let mut processed;

    match resume {
        Some(ref cursor) => {
            // Continue a killed pass: keep the counters, skip to the cursor.
            emitter.info(format!("Resuming rebuild after {}", cursor));
            processed = read_processed(&ctx.store)?;
            set_status(&ctx.store, "building")?;
        }
        None => {
            let total = prescan_count(photos_dir);
            emitter.info(format!("Starting full rebuild of {} entries", total));

            ctx.store.with_transaction(Db::Main, TxMode::Immediate, |db| {
                db.run("DELETE FROM items", &[])?;
                db.run("DELETE FROM items_fts", &[])?;
                Ok(())
            })?;

            set_status(&ctx.store, "building")?;
            set_progress(&ctx.store, 0, Some(total))?;
            processed = 0;
        }
    }
    ctx.idle.invalidate();

    let thumb_sync = if sync_thumbnails {
        ThumbSync::Force
    } else {
        ThumbSync::IfChanged
    };

    let mut batch: Vec<WalkEntry> = Vec::with_capacity(ctx.cfg.batch_size);
    for entry in walk_media(photos_dir) {
        if let Some(ref cursor) = resume {
            if paths::walk_order_cmp(&entry.rel, cursor) != Ordering::Greater {
                continue;
            }
        }

        batch.push(entry);
        if batch.len() >= ctx.cfg.batch_size {
            flush_batch(ctx, emitter, &mut batch, thumb_sync, &mut processed)?;
        }
    }
    if !batch.is_empty() {
        flush_batch(ctx, emitter, &mut batch, thumb_sync, &mut processed)?;
    }

    // Completion: cursor gone, status complete, covers recomputed.
    clear_cursor(&ctx.store)?;
    set_status(&ctx.store, "complete")?;
    set_progress(&ctx.store, processed, None)?;
    ctx.idle.invalidate();

    let covers = ctx.retry.run(ctx.store.telemetry(), false, || {
        ctx.store
            .with_transaction(Db::Main, TxMode::Immediate, rebuild_album_covers)
    })?;
    emitter.info(format!(
        "Rebuild complete: {} items, {} album covers",
        processed, covers
    ));

    Ok(TaskResult::RebuildComplete { count: processed })
}

/// Commit one batch and advance the cursor. Ordering matters: the catalog
/// commit lands before the cursor moves, so a crash between the two only
/// re-scans rows that INSERT OR IGNORE will skip.
fn flush_batch(
    ctx: &WorkerContext,
    emitter: &Emitter<'_>,
    batch: &mut Vec<WalkEntry>,
    thumb_sync: ThumbSync,
    processed: &mut u64,
) -> Result<()> {
    let entries = std::mem::take(batch);
    let Some(last_rel) = entries.last().map(|e| e.rel.clone()) else {
        return Ok(());
    };

    let resolved = resolve_dimensions(entries, &ctx.dims, ctx.cfg.concurrency);
    let sentinels = resolved.iter().filter(|r| r.used_sentinel()).count();
    if sentinels > 0 {
        emitter.warn(format!("{} probe failures in batch, using sentinels", sentinels));
    }

    let written = ctx.retry.run(ctx.store.telemetry(), false, || {
        ctx.store
            .with_transaction(Db::Main, TxMode::Immediate, |db| {
                write_batch(db, &resolved, thumb_sync, false)
            })
    })?;

    *processed += written as u64;
    write_cursor(&ctx.store, &last_rel)?;
    set_progress(&ctx.store, *processed, None)?;
    ctx.flag.refresh();

    emitter.debug(format!("Committed batch of {}, at {}", written, last_rel));
    Ok(())
}
