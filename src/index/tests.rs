// --- Indexing scenario tests ---
//
// End-to-end runs against a real worker thread, a temp photo tree, and a
// temp catalog. Video probes fall back to sentinel dimensions on hosts
// without ffprobe, which is exactly the production behavior for broken
// files, so nothing here depends on real media decoding.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::rebuild::{read_cursor, read_status, write_cursor, RESUME_CURSOR_KEY};
use super::{
    ChangeType, Indexer, IndexerDeps, IndexingFlag, PendingChange, TaskResult, WorkerRequest,
};
use crate::config::{IndexConfig, SchedulerConfig, SqliteTuning};
use crate::db::{CatalogStore, Db};
use crate::kv::Kv;
use crate::media::DimensionCache;
use crate::scheduler::IdleMonitor;
use crate::thumbs::ThumbDemand;

struct TestEnv {
    _photos: tempfile::TempDir,
    _data: tempfile::TempDir,
    photos_dir: PathBuf,
    store: Arc<CatalogStore>,
    indexer: Indexer,
}

/// PNG signature + IHDR carrying the given dimensions; enough header for
/// the dimension probe, which only parses the IHDR.
fn png_with_size(width: u8, height: u8) -> Vec<u8> {
    vec![
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48,
        0x44, 0x52, 0x00, 0x00, 0x00, width, 0x00, 0x00, 0x00, height, 0x08, 0x06, 0x00, 0x00,
        0x00, 0x1F, 0x15, 0xC4, 0x89,
    ]
}

fn one_by_one_png() -> Vec<u8> {
    png_with_size(1, 1)
}

impl TestEnv {
    fn new() -> Self {
        Self::with_batch_size(3)
    }

    fn with_batch_size(batch_size: usize) -> Self {
        let photos = tempfile::TempDir::new().unwrap();
        let data = tempfile::TempDir::new().unwrap();
        let store = Arc::new(CatalogStore::open(data.path(), SqliteTuning::default()).unwrap());
        let kv = Arc::new(Kv::local_only());

        let scheduler_cfg = SchedulerConfig {
            idle_cache_ttl: Duration::from_millis(0),
            load_per_core: f64::MAX,
            memory_budget_fraction: 1.1,
            ..SchedulerConfig::default()
        };
        let idle = IdleMonitor::new(Arc::clone(&store), ThumbDemand::new(), scheduler_cfg);

        let cfg = IndexConfig {
            batch_size,
            concurrency: 2,
            retry_interval: Duration::from_millis(20),
            dim_backfill_batch: 10,
            dim_backfill_sleep: Duration::from_millis(1),
            mtime_backfill_batch: 10,
            mtime_backfill_sleep: Duration::from_millis(1),
            ..IndexConfig::default()
        };

        let indexer = Indexer::spawn(IndexerDeps {
            store: Arc::clone(&store),
            kv: Arc::clone(&kv),
            dims: Arc::new(DimensionCache::new(Arc::clone(&kv))),
            idle,
            flag: IndexingFlag::new(kv),
            cfg,
        });

        Self {
            photos_dir: photos.path().to_path_buf(),
            _photos: photos,
            _data: data,
            store,
            indexer,
        }
    }

    fn write_photo(&self, rel: &str) {
        let path = self.photos_dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, one_by_one_png()).unwrap();
    }

    fn write_video(&self, rel: &str) {
        let path = self.photos_dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"not really an mp4").unwrap();
    }

    fn rebuild(&self) -> TaskResult {
        self.indexer
            .submit(WorkerRequest::RebuildIndex {
                photos_dir: self.photos_dir.clone(),
                sync_thumbnails: false,
            })
            .unwrap()
            .wait()
            .unwrap()
    }

    fn submit_changes(&self, changes: Vec<(ChangeType, &str)>) -> TaskResult {
        let changes = changes
            .into_iter()
            .map(|(change_type, rel)| PendingChange {
                change_type,
                file_path: self.photos_dir.join(rel),
            })
            .collect();
        self.indexer
            .submit(WorkerRequest::ProcessChanges {
                changes,
                photos_dir: self.photos_dir.clone(),
            })
            .unwrap()
            .wait()
            .unwrap()
    }

    fn item_paths(&self) -> Vec<String> {
        self.store
            .all(Db::Main, "SELECT path FROM items ORDER BY path", &[], |r| {
                r.get(0)
            })
            .unwrap()
    }

    fn count(&self, sql: &str) -> i64 {
        self.store
            .get(Db::Main, sql, &[], |r| r.get(0))
            .unwrap()
            .unwrap()
    }

    fn dump_catalog(&self) -> Vec<(String, String, i64)> {
        // items joined with fts text; the comparable catalog state.
        self.store
            .all(
                Db::Main,
                "SELECT i.path, f.name, i.mtime FROM items i
                 JOIN items_fts f ON f.rowid = i.id ORDER BY i.path",
                &[],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap()
    }

    fn assert_fts_parity(&self) {
        let orphans = self.count(
            "SELECT COUNT(*) FROM items i LEFT JOIN items_fts f ON f.rowid = i.id
             WHERE f.rowid IS NULL",
        );
        assert_eq!(orphans, 0, "items without fts rows");
        let items = self.count("SELECT COUNT(*) FROM items");
        let fts = self.count("SELECT COUNT(*) FROM items_fts");
        assert_eq!(items, fts, "fts row count must mirror items");
    }
}

// ---------------------------------------------------------------
// Scenario 1: Cold start
// ---------------------------------------------------------------
#[test]
fn test_cold_start_rebuild() {
    let env = TestEnv::new();
    env.write_photo("a/1.jpg");
    std::thread::sleep(Duration::from_millis(20));
    env.write_video("a/b/2.mp4");

    let result = env.rebuild();
    let TaskResult::RebuildComplete { count } = result else {
        panic!("unexpected result: {:?}", result);
    };
    assert_eq!(count, 4);

    assert_eq!(env.item_paths(), vec!["a", "a/1.jpg", "a/b", "a/b/2.mp4"]);

    // Two media rows, both pending thumbnails
    let pending = env.count("SELECT COUNT(*) FROM thumb_status WHERE status = 'pending'");
    assert_eq!(pending, 2);

    // Album cover is the newest descendant media
    let cover: String = env
        .store
        .get(
            Db::Main,
            "SELECT cover_path FROM album_covers WHERE album_path = 'a'",
            &[],
            |r| r.get(0),
        )
        .unwrap()
        .unwrap();
    assert_eq!(cover, "a/b/2.mp4");

    // Index status complete, counters advanced, cursor gone
    assert_eq!(read_status(&env.store).unwrap().as_deref(), Some("complete"));
    assert!(read_cursor(&env.store).unwrap().is_none());
    let processed: i64 = env
        .store
        .get(
            Db::Index,
            "SELECT processed_files FROM index_status WHERE id = 1",
            &[],
            |r| r.get(0),
        )
        .unwrap()
        .unwrap();
    assert_eq!(processed, 4);

    env.assert_fts_parity();
}

// ---------------------------------------------------------------
// Rebuild idempotence: second run over an unchanged tree yields the
// identical catalog.
// ---------------------------------------------------------------
#[test]
fn test_rebuild_idempotent() {
    let env = TestEnv::new();
    env.write_photo("a/1.jpg");
    env.write_photo("a/2.jpg");
    env.write_video("b/clip.mp4");

    env.rebuild();
    let first = env.dump_catalog();
    let first_covers: Vec<(String, String)> = env
        .store
        .all(
            Db::Main,
            "SELECT album_path, cover_path FROM album_covers ORDER BY album_path",
            &[],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();

    env.rebuild();
    assert_eq!(env.dump_catalog(), first);
    let second_covers: Vec<(String, String)> = env
        .store
        .all(
            Db::Main,
            "SELECT album_path, cover_path FROM album_covers ORDER BY album_path",
            &[],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(second_covers, first_covers);
    env.assert_fts_parity();
}

// ---------------------------------------------------------------
// Batch boundary: exactly one batch at INDEX_BATCH_SIZE, and one more
// item spills into a second batch; both complete cleanly.
// ---------------------------------------------------------------
#[test]
fn test_batch_size_boundaries() {
    for files in [3usize, 4] {
        let env = TestEnv::with_batch_size(4);
        // One album row plus `files` photos
        for i in 0..files {
            env.write_photo(&format!("a/{}.jpg", i));
        }
        let TaskResult::RebuildComplete { count } = env.rebuild() else {
            panic!();
        };
        assert_eq!(count as usize, files + 1);
        assert!(read_cursor(&env.store).unwrap().is_none());
        env.assert_fts_parity();
    }
}

// ---------------------------------------------------------------
// FTS: names with spaces and non-ASCII are tokenized and retrievable.
// ---------------------------------------------------------------
#[test]
fn test_fts_search_roundtrip() {
    let env = TestEnv::new();
    env.write_photo("trips/beach day 01.jpg");
    env.write_photo("trips/日本旅行.jpg");
    env.rebuild();

    let hits = |query: &str| -> i64 {
        env.store
            .get(
                Db::Main,
                "SELECT COUNT(*) FROM items_fts WHERE items_fts MATCH ?1",
                &[&query],
                |r| r.get(0),
            )
            .unwrap()
            .unwrap()
    };

    assert!(hits("beach") >= 1);
    assert!(hits("day") >= 1);
    // CJK substring reachable through the stored 2-grams
    assert!(hits("旅行") >= 1);
    // Type label is part of the token text
    assert!(hits("photo") >= 2);
}

// ---------------------------------------------------------------
// Incremental: add, update, then delete, checking covers, thumbs,
// parent mtimes, and the video/maintenance handoff flags.
// ---------------------------------------------------------------
#[test]
fn test_incremental_add_update_delete() {
    let env = TestEnv::new();
    env.write_photo("a/1.jpg");
    env.rebuild();

    let album_mtime_before: i64 = env
        .store
        .get(Db::Main, "SELECT mtime FROM items WHERE path = 'a'", &[], |r| r.get(0))
        .unwrap()
        .unwrap();

    // Add a new video
    env.write_video("a/clip.mp4");
    let result = env.submit_changes(vec![(ChangeType::Add, "a/clip.mp4")]);
    let TaskResult::ProcessChangesComplete {
        video_paths,
        needs_maintenance,
    } = result
    else {
        panic!();
    };
    assert_eq!(video_paths, vec!["a/clip.mp4".to_string()]);
    // Garbage video probes to sentinel, so maintenance is requested
    assert!(needs_maintenance);

    assert!(env.item_paths().contains(&"a/clip.mp4".to_string()));
    let thumb = env.count("SELECT COUNT(*) FROM thumb_status WHERE path = 'a/clip.mp4'");
    assert_eq!(thumb, 1);

    // The newest descendant now covers the album, and the album surfaced
    // as recently changed.
    let cover: String = env
        .store
        .get(
            Db::Main,
            "SELECT cover_path FROM album_covers WHERE album_path = 'a'",
            &[],
            |r| r.get(0),
        )
        .unwrap()
        .unwrap();
    assert_eq!(cover, "a/clip.mp4");
    let album_mtime_after: i64 = env
        .store
        .get(Db::Main, "SELECT mtime FROM items WHERE path = 'a'", &[], |r| r.get(0))
        .unwrap()
        .unwrap();
    assert!(album_mtime_after > album_mtime_before);

    // Update the photo: thumb goes back to pending with the new mtime
    std::thread::sleep(Duration::from_millis(20));
    env.write_photo("a/1.jpg");
    env.store
        .run(
            Db::Main,
            "UPDATE thumb_status SET status = 'exists' WHERE path = 'a/1.jpg'",
            &[],
        )
        .unwrap();
    env.submit_changes(vec![(ChangeType::Update, "a/1.jpg")]);
    let status: String = env
        .store
        .get(
            Db::Main,
            "SELECT status FROM thumb_status WHERE path = 'a/1.jpg'",
            &[],
            |r| r.get(0),
        )
        .unwrap()
        .unwrap();
    assert_eq!(status, "pending");

    // Delete the video again
    std::fs::remove_file(env.photos_dir.join("a/clip.mp4")).unwrap();
    env.submit_changes(vec![(ChangeType::Unlink, "a/clip.mp4")]);
    assert!(!env.item_paths().contains(&"a/clip.mp4".to_string()));
    assert_eq!(
        env.count("SELECT COUNT(*) FROM thumb_status WHERE path = 'a/clip.mp4'"),
        0
    );
    let cover: String = env
        .store
        .get(
            Db::Main,
            "SELECT cover_path FROM album_covers WHERE album_path = 'a'",
            &[],
            |r| r.get(0),
        )
        .unwrap()
        .unwrap();
    assert_eq!(cover, "a/1.jpg");

    env.assert_fts_parity();
}

// ---------------------------------------------------------------
// Incremental: a new subtree arrives with no addDir events; ancestor
// albums are materialized anyway.
// ---------------------------------------------------------------
#[test]
fn test_incremental_add_creates_ancestor_albums() {
    let env = TestEnv::new();
    env.write_photo("a/1.jpg");
    env.rebuild();

    env.write_photo("new/deep/x.jpg");
    env.submit_changes(vec![(ChangeType::Add, "new/deep/x.jpg")]);

    let paths = env.item_paths();
    assert!(paths.contains(&"new".to_string()));
    assert!(paths.contains(&"new/deep".to_string()));
    assert!(paths.contains(&"new/deep/x.jpg".to_string()));

    let cover: String = env
        .store
        .get(
            Db::Main,
            "SELECT cover_path FROM album_covers WHERE album_path = 'new/deep'",
            &[],
            |r| r.get(0),
        )
        .unwrap()
        .unwrap();
    assert_eq!(cover, "new/deep/x.jpg");
    env.assert_fts_parity();
}

// ---------------------------------------------------------------
// Incremental: unlinkDir cascades through the subtree.
// ---------------------------------------------------------------
#[test]
fn test_unlink_dir_cascades() {
    let env = TestEnv::new();
    env.write_photo("keep/1.jpg");
    env.write_photo("gone/2.jpg");
    env.write_photo("gone/sub/3.jpg");
    env.rebuild();
    assert_eq!(env.count("SELECT COUNT(*) FROM items"), 6);

    std::fs::remove_dir_all(env.photos_dir.join("gone")).unwrap();
    env.submit_changes(vec![(ChangeType::UnlinkDir, "gone")]);

    assert_eq!(env.item_paths(), vec!["keep", "keep/1.jpg"]);
    assert_eq!(
        env.count("SELECT COUNT(*) FROM thumb_status"),
        1,
        "thumb rows for the deleted subtree must cascade"
    );
    assert_eq!(
        env.count("SELECT COUNT(*) FROM album_covers WHERE album_path LIKE 'gone%'"),
        0
    );
    env.assert_fts_parity();
}

// ---------------------------------------------------------------
// Invariant 7: only one critical task in flight; a second critical is
// rejected while the first runs.
// ---------------------------------------------------------------
#[test]
fn test_critical_tasks_mutually_exclusive() {
    let env = TestEnv::new();
    // Enough files that the rebuild is still running when the second
    // critical arrives.
    for i in 0..40 {
        env.write_photo(&format!("a/{}.jpg", i));
    }

    let ticket = env
        .indexer
        .submit(WorkerRequest::RebuildIndex {
            photos_dir: env.photos_dir.clone(),
            sync_thumbnails: false,
        })
        .unwrap();

    // While the first critical is queued/running, a second is rejected.
    let second = env.indexer.submit(WorkerRequest::ProcessChanges {
        changes: vec![],
        photos_dir: env.photos_dir.clone(),
    });
    assert!(second.is_err());
    assert!(env.indexer.criticals_in_flight() <= 1);

    ticket.wait().unwrap();

    // After completion the latch is released.
    let third = env.indexer.submit(WorkerRequest::ProcessChanges {
        changes: vec![],
        photos_dir: env.photos_dir.clone(),
    });
    assert!(third.is_ok());
    third.unwrap().wait().unwrap();
}

// ---------------------------------------------------------------
// Scenario 4: resume. A cursor mid-walk means no truncate, counters
// accumulate, and the pass ends complete with the cursor gone.
// ---------------------------------------------------------------
#[test]
fn test_rebuild_resume() {
    let env = TestEnv::new();
    env.write_photo("a/1.jpg");
    env.write_photo("a/2.jpg");
    env.write_photo("z/9.jpg");
    env.rebuild();
    let full = env.dump_catalog();

    // Simulate a kill mid-walk: cursor after a/1.jpg, counters partial.
    write_cursor(&env.store, "a/1.jpg").unwrap();
    env.store
        .run(
            Db::Index,
            "UPDATE index_status SET status = 'pending', processed_files = 2 WHERE id = 1",
            &[],
        )
        .unwrap();

    let TaskResult::RebuildComplete { count } = env.rebuild() else {
        panic!();
    };
    // 2 carried over + a/2.jpg, z, z/9.jpg walked after the cursor
    assert_eq!(count, 5);
    assert_eq!(read_status(&env.store).unwrap().as_deref(), Some("complete"));
    assert!(read_cursor(&env.store).unwrap().is_none());

    // No truncate happened: the catalog still has every row.
    assert_eq!(env.dump_catalog().len(), full.len());
    env.assert_fts_parity();

    let leftover = env
        .store
        .get(
            Db::Index,
            "SELECT COUNT(*) FROM index_progress WHERE key = ?1",
            &[&RESUME_CURSOR_KEY],
            |r| r.get::<_, i64>(0),
        )
        .unwrap()
        .unwrap();
    assert_eq!(leftover, 0);
}

// ---------------------------------------------------------------
// Dimension backfill repairs sentinel rows and is idempotent.
// ---------------------------------------------------------------
#[test]
fn test_dimension_backfill_idempotent() {
    let env = TestEnv::new();
    // Garbage bytes under a photo extension probe to the sentinel.
    let broken = env.photos_dir.join("a/fix.jpg");
    std::fs::create_dir_all(broken.parent().unwrap()).unwrap();
    std::fs::write(&broken, b"garbage").unwrap();
    env.rebuild();

    let sentinel_rows =
        env.count("SELECT COUNT(*) FROM items WHERE path = 'a/fix.jpg' AND width <= 1");
    assert_eq!(sentinel_rows, 1);

    // The file becomes readable; the backfill repairs the row. The image
    // must be larger than the sentinel size or the repair would be
    // indistinguishable from the fallback.
    std::fs::write(&broken, png_with_size(2, 2)).unwrap();
    let result = env
        .indexer
        .submit(WorkerRequest::BackfillMissingDimensions {
            photos_dir: env.photos_dir.clone(),
        })
        .unwrap()
        .wait()
        .unwrap();
    let TaskResult::BackfillDimensionsComplete { updated } = result else {
        panic!();
    };
    assert_eq!(updated, 1);

    // Second run: nothing left to repair.
    let result = env
        .indexer
        .submit(WorkerRequest::BackfillMissingDimensions {
            photos_dir: env.photos_dir.clone(),
        })
        .unwrap()
        .wait()
        .unwrap();
    let TaskResult::BackfillDimensionsComplete { updated } = result else {
        panic!();
    };
    assert_eq!(updated, 0);
}

// ---------------------------------------------------------------
// Mtime backfill fills zero mtimes and skips vanished files.
// ---------------------------------------------------------------
#[test]
fn test_mtime_backfill() {
    let env = TestEnv::new();
    env.write_photo("a/1.jpg");
    env.rebuild();

    env.store
        .run(
            Db::Main,
            "UPDATE items SET mtime = 0 WHERE path = 'a/1.jpg'",
            &[],
        )
        .unwrap();
    env.store
        .run(
            Db::Main,
            "INSERT INTO items (path, name, type, mtime) VALUES ('a/ghost.jpg', 'ghost.jpg', 'photo', 0)",
            &[],
        )
        .unwrap();
    env.store
        .run(
            Db::Main,
            "INSERT INTO items_fts (rowid, name) SELECT id, 'ghost photo' FROM items WHERE path = 'a/ghost.jpg'",
            &[],
        )
        .unwrap();

    let result = env
        .indexer
        .submit(WorkerRequest::BackfillMissingMtime {
            photos_dir: env.photos_dir.clone(),
        })
        .unwrap()
        .wait()
        .unwrap();
    let TaskResult::BackfillMtimeComplete { updated } = result else {
        panic!();
    };
    assert_eq!(updated, 1, "only the on-disk file is repaired");

    let fixed: i64 = env
        .store
        .get(Db::Main, "SELECT mtime FROM items WHERE path = 'a/1.jpg'", &[], |r| r.get(0))
        .unwrap()
        .unwrap();
    assert!(fixed > 0);
}

// ---------------------------------------------------------------
// get_all_media_items: the thumbnail generator's bulk feed.
// ---------------------------------------------------------------
#[test]
fn test_get_all_media_items() {
    let env = TestEnv::new();
    env.write_photo("a/1.jpg");
    env.write_video("a/2.mp4");
    env.rebuild();

    let result = env
        .indexer
        .submit(WorkerRequest::GetAllMediaItems)
        .unwrap()
        .wait()
        .unwrap();
    let TaskResult::AllMediaItemsResult { payload } = result else {
        panic!();
    };

    let paths: Vec<&str> = payload.iter().map(|m| m.path.as_str()).collect();
    assert_eq!(paths, vec!["a/1.jpg", "a/2.mp4"]);
    // Albums are not media
    assert!(payload.iter().all(|m| m.kind != "album"));
}

// ---------------------------------------------------------------
// Invariant 4: every media row has a thumb_status row.
// ---------------------------------------------------------------
#[test]
fn test_thumb_rows_for_all_media() {
    let env = TestEnv::new();
    env.write_photo("a/1.jpg");
    env.write_photo("b/2.jpg");
    env.write_video("b/3.mp4");
    env.rebuild();

    let missing = env.count(
        "SELECT COUNT(*) FROM items i LEFT JOIN thumb_status t ON t.path = i.path
         WHERE i.type IN ('photo', 'video') AND t.path IS NULL",
    );
    assert_eq!(missing, 0);
}

// ---------------------------------------------------------------
// Covers: every cover row points at a live descendant (invariant 3).
// ---------------------------------------------------------------
#[test]
fn test_cover_rows_reference_descendants() {
    let env = TestEnv::new();
    env.write_photo("a/1.jpg");
    env.write_photo("a/b/2.jpg");
    env.write_photo("c/3.jpg");
    env.rebuild();

    let bad = env.count(
        "SELECT COUNT(*) FROM album_covers ac
         LEFT JOIN items i ON i.path = ac.cover_path
         WHERE i.path IS NULL
            OR substr(ac.cover_path, 1, length(ac.album_path) + 1) <> ac.album_path || '/'",
    );
    assert_eq!(bad, 0);
}
