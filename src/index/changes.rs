// Incremental change application
//
// Applies one consolidated change set inside a single IMMEDIATE
// transaction: subtree-cascading deletes, adds through the same write
// pipeline as the rebuild, cover recomputation and mtime bumps for the
// affected album chain. Tag invalidation happens after the commit.

use std::collections::BTreeSet;
use std::path::Path;

use super::rebuild::now_ms;
use super::walk::{mtime_ms_of, WalkEntry};
use super::worker::{Emitter, WorkerContext};
use super::writer::{refresh_album_cover, resolve_dimensions, write_batch, ResolvedEntry, ThumbSync};
use super::{ChangeType, PendingChange, TaskResult};
use crate::db::{in_clause, Db, DbConn, TxMode};
use crate::error::Result;
use crate::media::{classify_file, ItemKind};
use crate::paths;

const DELETE_CHUNK: usize = 200;

pub fn process_changes(
    ctx: &WorkerContext,
    emitter: &Emitter<'_>,
    change_set: Vec<PendingChange>,
    photos_dir: &Path,
) -> Result<TaskResult> {
    let pending_count = change_set.len();
    let mut tags: BTreeSet<String> = BTreeSet::new();
    let mut affected_albums: BTreeSet<String> = BTreeSet::new();
    let mut deletes: Vec<String> = Vec::new();
    let mut add_entries: Vec<WalkEntry> = Vec::new();
    let mut video_paths: Vec<String> = Vec::new();

    for change in &change_set {
        // Bounds and extension validation; bad paths are rejected here, not
        // deeper in the pipeline.
        let rel = match paths::normalize_rel(photos_dir, &change.file_path) {
            Ok(rel) => rel,
            Err(e) => {
                emitter.warn(format!("Rejected change: {}", e));
                continue;
            }
        };

        let file_kind = if change.change_type.is_dir() {
            None
        } else {
            match classify_file(Path::new(&rel)) {
                Some(kind) => Some(kind),
                None => {
                    emitter.debug(format!("Skipping unsupported file {}", rel));
                    continue;
                }
            }
        };

        tags.extend(paths::album_tag_chain(&rel));
        affected_albums.extend(paths::parent_albums(&rel));

        match change.change_type {
            ChangeType::Unlink | ChangeType::UnlinkDir => {
                deletes.push(rel);
            }
            ChangeType::AddDir => {
                if !change.file_path.is_dir() {
                    emitter.debug(format!("Skipping vanished directory {}", rel));
                    continue;
                }
                // The new album needs a cover pass of its own.
                affected_albums.insert(rel.clone());
                add_entries.push(WalkEntry {
                    mtime_ms: mtime_ms_of(&change.file_path),
                    abs: change.file_path.clone(),
                    kind: ItemKind::Album,
                    rel,
                });
            }
            ChangeType::Add | ChangeType::Update => {
                if !change.file_path.is_file() {
                    emitter.debug(format!("Skipping vanished file {}", rel));
                    continue;
                }
                let kind = file_kind.expect("file change with no kind");
                if kind == ItemKind::Video {
                    video_paths.push(rel.clone());
                }
                add_entries.push(WalkEntry {
                    mtime_ms: mtime_ms_of(&change.file_path),
                    abs: change.file_path.clone(),
                    kind,
                    rel,
                });
            }
        }
    }

    add_ancestor_albums(photos_dir, &mut add_entries);

    if deletes.is_empty() && add_entries.is_empty() {
        emitter.info("Change set empty after validation".to_string());
        return Ok(TaskResult::ProcessChangesComplete {
            video_paths: Vec::new(),
            needs_maintenance: false,
        });
    }

    // Probe outside the transaction; only the writes hold the lock.
    let resolved = resolve_dimensions(add_entries, &ctx.dims, ctx.cfg.concurrency);
    let sentinels = resolved.iter().filter(|r| r.used_sentinel()).count();
    let adds = resolved.len();
    let removed = deletes.len();

    ctx.retry.run(ctx.store.telemetry(), false, || {
        ctx.store
            .with_transaction(Db::Main, TxMode::Immediate, |db| {
                apply_in_transaction(db, &deletes, &resolved, &affected_albums)
            })
    })?;

    // Post-commit side effect: browse cache invalidation for the chain.
    ctx.tags.invalidate(&tags, pending_count);

    let needs_maintenance =
        sentinels > 0 || resolved.iter().any(|r| r.entry.mtime_ms <= 0);
    emitter.info(format!(
        "Applied changes: {} adds, {} deletes, {} albums touched",
        adds,
        removed,
        affected_albums.len()
    ));

    Ok(TaskResult::ProcessChangesComplete {
        video_paths,
        needs_maintenance,
    })
}

/// Incremental adds may arrive before their parent directories were ever
/// indexed (a whole new subtree copied in). Materialize missing ancestor
/// album entries so invariants hold without waiting for a rebuild.
fn add_ancestor_albums(photos_dir: &Path, add_entries: &mut Vec<WalkEntry>) {
    let present: BTreeSet<String> = add_entries.iter().map(|e| e.rel.clone()).collect();
    let mut ancestors: BTreeSet<String> = BTreeSet::new();
    for entry in add_entries.iter() {
        for anc in paths::parent_albums(&entry.rel) {
            if !present.contains(&anc) {
                ancestors.insert(anc);
            }
        }
    }

    for anc in ancestors {
        let abs = paths::rel_to_abs(photos_dir, &anc);
        if abs.is_dir() {
            add_entries.push(WalkEntry {
                mtime_ms: mtime_ms_of(&abs),
                abs,
                kind: ItemKind::Album,
                rel: anc,
            });
        }
    }
}

fn apply_in_transaction(
    db: &mut DbConn,
    deletes: &[String],
    resolved: &[ResolvedEntry],
    affected_albums: &BTreeSet<String>,
) -> Result<()> {
    delete_paths(db, deletes)?;
    write_batch(db, resolved, ThumbSync::IfChanged, true)?;

    // Covers and recency for the album chain, inside the same transaction
    // as the item writes that induced them.
    let now = now_ms();
    for album in affected_albums {
        let exists = db
            .get(
                "SELECT 1 FROM items WHERE path = ?1 AND type = 'album'",
                &[album],
                |_| Ok(()),
            )?
            .is_some();

        if exists {
            refresh_album_cover(db, album)?;
            db.run(
                "UPDATE items SET mtime = ?1 WHERE path = ?2",
                &[&now, album],
            )?;
        } else {
            db.run(
                "DELETE FROM album_covers WHERE album_path = ?1",
                &[album],
            )?;
        }
    }
    Ok(())
}

/// Chunked subtree-cascading delete. Each chunk's statement is
/// `path IN (...) OR path LIKE <p>/% ...` with the LIKE parameters built
/// from that same chunk, keeping placeholders and values aligned.
fn delete_paths(db: &mut DbConn, deletes: &[String]) -> Result<()> {
    for chunk in deletes.chunks(DELETE_CHUNK) {
        let in_list = in_clause(chunk.len());
        let like_list = chunk
            .iter()
            .map(|_| "path LIKE ? ESCAPE '\\'")
            .collect::<Vec<_>>()
            .join(" OR ");
        let cover_like_list = like_list.replace("path LIKE", "album_path LIKE");

        let patterns: Vec<String> = chunk
            .iter()
            .map(|p| format!("{}/%", paths::escape_like(p)))
            .collect();
        let params: Vec<&dyn rusqlite::ToSql> = chunk
            .iter()
            .map(|p| p as &dyn rusqlite::ToSql)
            .chain(patterns.iter().map(|p| p as &dyn rusqlite::ToSql))
            .collect();

        // FTS rows first, while the item rows still exist to resolve ids.
        db.run(
            &format!(
                "DELETE FROM items_fts WHERE rowid IN
                 (SELECT id FROM items WHERE path IN ({}) OR {})",
                in_list, like_list
            ),
            &params,
        )?;
        db.run(
            &format!(
                "DELETE FROM items WHERE path IN ({}) OR {}",
                in_list, like_list
            ),
            &params,
        )?;
        db.run(
            &format!(
                "DELETE FROM thumb_status WHERE path IN ({}) OR {}",
                in_list, like_list
            ),
            &params,
        )?;
        db.run(
            &format!(
                "DELETE FROM album_covers WHERE album_path IN ({}) OR {}",
                in_list, cover_like_list
            ),
            &params,
        )?;
    }
    Ok(())
}
