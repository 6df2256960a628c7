// Shared item write pipeline
//
// Both the full rebuild and incremental change application funnel through
// this: resolve dimensions with bounded concurrency, then for every entry
// INSERT-OR-IGNORE into items, REPLACE the FTS row, and UPSERT thumb
// status. items and items_fts are always mutated in the same transaction;
// callers hold it open across the batch.

use super::tokenize::tokenize_name;
use super::walk::WalkEntry;
use crate::db::DbConn;
use crate::error::Result;
use crate::media::{DimensionCache, Dimensions};
use crate::paths;

#[derive(Debug, Clone)]
pub struct ResolvedEntry {
    pub entry: WalkEntry,
    pub dims: Option<Dimensions>,
}

impl ResolvedEntry {
    pub fn used_sentinel(&self) -> bool {
        self.dims.map(|d| d.is_sentinel()).unwrap_or(false)
    }
}

/// Probe dimensions for a batch with bounded concurrency. Albums pass
/// through untouched; per-file failures fall back to the sentinel inside
/// the cache so one broken file never stalls a batch.
pub fn resolve_dimensions(
    entries: Vec<WalkEntry>,
    dims: &DimensionCache,
    concurrency: usize,
) -> Vec<ResolvedEntry> {
    if entries.is_empty() {
        return Vec::new();
    }
    let chunk = entries.len().div_ceil(concurrency.max(1));

    std::thread::scope(|scope| {
        let handles: Vec<_> = entries
            .chunks(chunk)
            .map(|slice| {
                scope.spawn(move || {
                    slice
                        .iter()
                        .map(|entry| ResolvedEntry {
                            dims: if entry.kind.is_media() {
                                Some(dims.get_or_probe(&entry.abs, entry.mtime_ms, entry.kind))
                            } else {
                                None
                            },
                            entry: entry.clone(),
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|h| h.join().expect("dimension probe thread panicked"))
            .collect()
    })
}

/// How thumb rows react to a write: `IfChanged` resets to pending only when
/// the mtime moved; `Force` is the rebuild-with-sync path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbSync {
    IfChanged,
    Force,
}

/// Write one resolved batch. The caller has the transaction open; rowids
/// come from the insert or, for pre-existing rows, a lookup.
pub fn write_batch(
    db: &mut DbConn,
    batch: &[ResolvedEntry],
    thumb_sync: ThumbSync,
    refresh_existing: bool,
) -> Result<usize> {
    let mut written = 0usize;

    for resolved in batch {
        let entry = &resolved.entry;
        let name = paths::basename(&entry.rel);
        let (width, height) = match resolved.dims {
            Some(d) => (Some(d.width), Some(d.height)),
            None => (None, None),
        };

        let inserted = db.run(
            "INSERT OR IGNORE INTO items (path, name, type, mtime, width, height)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            &[
                &entry.rel,
                &name,
                &entry.kind.as_str(),
                &entry.mtime_ms,
                &width,
                &height,
            ],
        )?;

        let id: i64 = if inserted > 0 {
            db.last_insert_rowid()
        } else {
            if refresh_existing {
                db.run(
                    "UPDATE items SET mtime = ?1, width = ?2, height = ?3 WHERE path = ?4",
                    &[&entry.mtime_ms, &width, &height, &entry.rel],
                )?;
            }
            db.get(
                "SELECT id FROM items WHERE path = ?1",
                &[&entry.rel],
                |r| r.get(0),
            )?
            .ok_or_else(|| {
                crate::error::ShoeboxError::NotFound(format!("item row for {}", entry.rel))
            })?
        };

        db.run(
            "INSERT OR REPLACE INTO items_fts (rowid, name) VALUES (?1, ?2)",
            &[&id, &tokenize_name(&entry.rel, entry.kind)],
        )?;

        if entry.kind.is_media() {
            upsert_thumb_status(db, &entry.rel, entry.mtime_ms, thumb_sync)?;
        }

        written += 1;
    }

    Ok(written)
}

fn upsert_thumb_status(
    db: &mut DbConn,
    rel: &str,
    mtime_ms: i64,
    sync: ThumbSync,
) -> Result<()> {
    let sql = match sync {
        // Reset to pending only when the file actually changed; a rebuild
        // over an unchanged tree leaves generated thumbnails alone.
        ThumbSync::IfChanged => {
            "INSERT INTO thumb_status (path, mtime, status) VALUES (?1, ?2, 'pending')
             ON CONFLICT(path) DO UPDATE SET
                 mtime = excluded.mtime, status = 'pending', last_checked = NULL
             WHERE thumb_status.mtime <> excluded.mtime"
        }
        ThumbSync::Force => {
            "INSERT INTO thumb_status (path, mtime, status) VALUES (?1, ?2, 'pending')
             ON CONFLICT(path) DO UPDATE SET
                 mtime = excluded.mtime, status = 'pending', last_checked = NULL"
        }
    };
    db.run(sql, &[&rel, &mtime_ms])?;
    Ok(())
}

/// Recompute one album's cover as its newest descendant media; delete the
/// cover row when nothing is left underneath.
pub fn refresh_album_cover(db: &mut DbConn, album: &str) -> Result<()> {
    let like = format!("{}/%", paths::escape_like(album));
    let newest = db.get(
        "SELECT path, width, height, mtime FROM items
         WHERE type IN ('photo', 'video') AND path LIKE ?1 ESCAPE '\\'
         ORDER BY mtime DESC, path LIMIT 1",
        &[&like],
        |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<i64>>(1)?,
                r.get::<_, Option<i64>>(2)?,
                r.get::<_, i64>(3)?,
            ))
        },
    )?;

    match newest {
        Some((cover_path, width, height, mtime)) => {
            db.run(
                "INSERT INTO album_covers (album_path, cover_path, width, height, mtime)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(album_path) DO UPDATE SET
                     cover_path = excluded.cover_path, width = excluded.width,
                     height = excluded.height, mtime = excluded.mtime",
                &[&album, &cover_path, &width, &height, &mtime],
            )?;
        }
        None => {
            db.run(
                "DELETE FROM album_covers WHERE album_path = ?1",
                &[&album],
            )?;
        }
    }
    Ok(())
}

/// Full cover rebuild from items, used at the end of a rebuild pass.
pub fn rebuild_album_covers(db: &mut DbConn) -> Result<usize> {
    db.run("DELETE FROM album_covers", &[])?;
    let albums = db.all(
        "SELECT path FROM items WHERE type = 'album' ORDER BY path",
        &[],
        |r| r.get::<_, String>(0),
    )?;

    let mut rebuilt = 0usize;
    for album in &albums {
        refresh_album_cover(db, album)?;
        rebuilt += 1;
    }
    Ok(rebuilt)
}
