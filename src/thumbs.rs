// Thumbnail state and demand
//
// The generator itself lives elsewhere; this module owns its contract with
// the catalog: the `thumb_status` lifecycle rows, the mirrored output
// layout, the crash-recovery and self-heal resets, and the foreground
// demand gauge the idle predicate consumes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};

use crate::constants::{
    THUMB_IMAGE_EXT, THUMB_SELF_HEAL_EXISTS_THRESHOLD, THUMB_SELF_HEAL_SAMPLE, THUMB_VIDEO_EXT,
};
use crate::db::{CatalogStore, Db};
use crate::error::Result;
use crate::media::ItemKind;
use crate::paths;

/// Thumbnail output path for a media item: the photo tree mirrored under
/// the thumbnail root, `.webp` for images and `.jpg` for video posters.
pub fn thumb_path_for(thumbs_dir: &Path, rel: &str, kind: ItemKind) -> PathBuf {
    let ext = match kind {
        ItemKind::Video => THUMB_VIDEO_EXT,
        _ => THUMB_IMAGE_EXT,
    };
    let abs = paths::rel_to_abs(thumbs_dir, rel);
    abs.with_extension(ext)
}

// --- Lifecycle transitions used by the generator ---------------------------

/// Claim one pending row for generation, moving it to `processing`.
pub fn claim_next_pending(store: &CatalogStore) -> Result<Option<String>> {
    store.with_conn(Db::Main, |db| {
        let path = db.get(
            "SELECT path FROM thumb_status WHERE status = 'pending' ORDER BY path LIMIT 1",
            &[],
            |r| r.get::<_, String>(0),
        )?;
        if let Some(ref path) = path {
            db.run(
                "UPDATE thumb_status SET status = 'processing', last_checked = ?1 WHERE path = ?2",
                &[&now_ms(), path],
            )?;
        }
        Ok(path)
    })
}

/// Record a generation outcome.
pub fn mark_status(store: &CatalogStore, rel: &str, status: &str) -> Result<()> {
    store.run(
        Db::Main,
        "UPDATE thumb_status SET status = ?1, last_checked = ?2 WHERE path = ?3",
        &[&status, &now_ms(), &rel],
    )?;
    Ok(())
}

/// A changed mtime invalidates the existing thumbnail.
pub fn reset_for_mtime(store: &CatalogStore, rel: &str, mtime_ms: i64) -> Result<()> {
    store.run(
        Db::Main,
        "UPDATE thumb_status SET status = 'pending', mtime = ?1, last_checked = NULL
         WHERE path = ?2 AND mtime <> ?1",
        &[&mtime_ms, &rel],
    )?;
    Ok(())
}

// --- Startup recovery -------------------------------------------------------

/// Crash recovery: rows stuck in `processing` belong to a generator that
/// died mid-run.
pub fn reset_processing(store: &CatalogStore) -> Result<usize> {
    let n = store.run(
        Db::Main,
        "UPDATE thumb_status SET status = 'pending' WHERE status = 'processing'",
        &[],
    )?;
    if n > 0 {
        info!("Reset {} thumbnails from processing to pending", n);
    }
    Ok(n)
}

/// Consistency self-heal: when the catalog claims many thumbnails exist but
/// the thumbnail tree is effectively empty (wiped volume, moved mount),
/// reset everything to pending with mtime=0 so the generator resyncs.
pub fn self_heal_missing_thumbs(store: &CatalogStore, thumbs_dir: &Path) -> Result<usize> {
    let exists_count = store
        .get(
            Db::Main,
            "SELECT COUNT(*) FROM thumb_status WHERE status = 'exists'",
            &[],
            |r| r.get::<_, i64>(0),
        )?
        .unwrap_or(0);

    if exists_count < THUMB_SELF_HEAL_EXISTS_THRESHOLD {
        return Ok(0);
    }

    // Sample rows against the filesystem instead of statting all of them.
    let sample = store.all(
        Db::Main,
        "SELECT t.path, i.type FROM thumb_status t
         JOIN items i ON i.path = t.path
         WHERE t.status = 'exists' ORDER BY t.path LIMIT ?1",
        &[&(THUMB_SELF_HEAL_SAMPLE as i64)],
        |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
    )?;

    let any_on_disk = sample.iter().any(|(rel, kind)| {
        let kind = ItemKind::from_str(kind).unwrap_or(ItemKind::Photo);
        thumb_path_for(thumbs_dir, rel, kind).exists()
    });

    if any_on_disk || sample.is_empty() {
        return Ok(0);
    }

    warn!(
        "Thumbnail root looks empty but {} rows claim exists; resetting all to pending",
        exists_count
    );
    let n = store.run(
        Db::Main,
        "UPDATE thumb_status SET status = 'pending', mtime = 0, last_checked = NULL",
        &[],
    )?;
    Ok(n)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// --- Foreground demand gauge ------------------------------------------------

/// Live thumbnail demand fed by the HTTP layer: requests currently being
/// generated plus requests queued behind them. The idle predicate treats
/// high demand as a non-idle window.
#[derive(Debug, Default)]
pub struct ThumbDemand {
    active: AtomicU64,
    queued: AtomicU64,
}

impl ThumbDemand {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enqueue(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn start(&self) {
        let prev = self.queued.fetch_sub(1, Ordering::Relaxed);
        if prev == 0 {
            // Unpaired start; undo the underflow.
            self.queued.store(0, Ordering::Relaxed);
        }
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish(&self) {
        let prev = self.active.fetch_sub(1, Ordering::Relaxed);
        if prev == 0 {
            self.active.store(0, Ordering::Relaxed);
        }
    }

    pub fn level(&self) -> u64 {
        self.active.load(Ordering::Relaxed) + self.queued.load(Ordering::Relaxed)
    }
}
