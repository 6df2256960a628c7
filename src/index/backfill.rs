// Backfill passes
//
// Repair loops for rows the fast path left incomplete: sentinel or missing
// dimensions, and zero mtimes. Both run in small batches with a sleep in
// between and pass through the admission gate so interactive load wins.

use std::path::Path;

use super::walk::mtime_ms_of;
use super::worker::{Emitter, WorkerContext};
use super::TaskResult;
use crate::constants::SENTINEL_DIMENSION;
use crate::db::{BatchOptions, Db};
use crate::error::Result;
use crate::media::ItemKind;
use crate::paths;

/// Gate kind shared by all backfill batches.
const GATE_KIND: &str = "index-batch";

pub fn backfill_missing_dimensions(
    ctx: &WorkerContext,
    emitter: &Emitter<'_>,
    photos_dir: &Path,
) -> Result<TaskResult> {
    let mut updated = 0u64;
    let mut cursor = String::new();

    loop {
        ctx.idle.gate(
            GATE_KIND,
            ctx.cfg.retry_interval,
            std::time::Duration::from_millis(500),
        );

        // Cursor pagination: rows that still fail to probe are passed over
        // instead of being re-selected forever.
        let rows = ctx.store.all(
            Db::Main,
            "SELECT path, type, mtime FROM items
             WHERE type IN ('photo', 'video')
               AND (width IS NULL OR height IS NULL OR width <= ?1 OR height <= ?1)
               AND path > ?2
             ORDER BY path LIMIT ?3",
            &[
                &SENTINEL_DIMENSION,
                &cursor,
                &(ctx.cfg.dim_backfill_batch as i64),
            ],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                ))
            },
        )?;

        let Some((last, _, _)) = rows.last().cloned() else {
            break;
        };
        cursor = last;

        let mut updates: Vec<Vec<rusqlite::types::Value>> = Vec::new();
        for (rel, kind, mtime) in &rows {
            let Some(kind) = ItemKind::from_str(kind) else {
                continue;
            };
            let abs = paths::rel_to_abs(photos_dir, rel);
            let dims = ctx.dims.get_or_probe(&abs, *mtime, kind);
            if dims.is_sentinel() {
                continue;
            }
            updates.push(vec![
                rusqlite::types::Value::from(dims.width),
                rusqlite::types::Value::from(dims.height),
                rusqlite::types::Value::from(rel.clone()),
            ]);
        }

        if !updates.is_empty() {
            let n = ctx.retry.run(ctx.store.telemetry(), ctx.flag.is_set(), || {
                ctx.store.batch(
                    Db::Main,
                    "UPDATE items SET width = ?1, height = ?2 WHERE path = ?3",
                    &updates,
                    BatchOptions::default(),
                )
            })?;
            updated += n as u64;
            emitter.debug(format!("Dimension backfill batch: {} rows", n));
        }

        std::thread::sleep(ctx.cfg.dim_backfill_sleep);
    }

    emitter.info(format!("Dimension backfill done: {} updated", updated));
    Ok(TaskResult::BackfillDimensionsComplete { updated })
}

pub fn backfill_missing_mtime(
    ctx: &WorkerContext,
    emitter: &Emitter<'_>,
    photos_dir: &Path,
) -> Result<TaskResult> {
    let mut updated = 0u64;
    let mut cursor = String::new();

    loop {
        ctx.idle.gate(
            GATE_KIND,
            ctx.cfg.retry_interval,
            std::time::Duration::from_millis(500),
        );

        let rows = ctx.store.all(
            Db::Main,
            "SELECT path FROM items WHERE mtime <= 0 AND path > ?1 ORDER BY path LIMIT ?2",
            &[&cursor, &(ctx.cfg.mtime_backfill_batch as i64)],
            |r| r.get::<_, String>(0),
        )?;

        let Some(last) = rows.last().cloned() else {
            break;
        };
        cursor = last;

        let mut updates: Vec<Vec<rusqlite::types::Value>> = Vec::new();
        for rel in &rows {
            let abs = paths::rel_to_abs(photos_dir, rel);
            // Files gone from disk are left for the next incremental pass.
            if !abs.exists() {
                continue;
            }
            let mtime = mtime_ms_of(&abs);
            if mtime <= 0 {
                continue;
            }
            updates.push(vec![
                rusqlite::types::Value::from(mtime),
                rusqlite::types::Value::from(rel.clone()),
            ]);
        }

        if !updates.is_empty() {
            let n = ctx.retry.run(ctx.store.telemetry(), ctx.flag.is_set(), || {
                ctx.store.batch(
                    Db::Main,
                    "UPDATE items SET mtime = ?1 WHERE path = ?2",
                    &updates,
                    BatchOptions::default(),
                )
            })?;
            updated += n as u64;
        }

        std::thread::sleep(ctx.cfg.mtime_backfill_sleep);
    }

    emitter.info(format!("Mtime backfill done: {} updated", updated));
    Ok(TaskResult::BackfillMtimeComplete { updated })
}

/// Post-index maintenance: dimensions first, then mtimes.
pub fn post_index_backfill(
    ctx: &WorkerContext,
    emitter: &Emitter<'_>,
    photos_dir: &Path,
) -> Result<TaskResult> {
    backfill_missing_dimensions(ctx, emitter, photos_dir)?;
    backfill_missing_mtime(ctx, emitter, photos_dir)?;
    Ok(TaskResult::PostIndexBackfillComplete)
}
