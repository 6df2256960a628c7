// Startup sequence
//
// 1. Directories and thumbnail-root write probe.
// 2. Legacy single-database detection (migration is a separate tool; here
//    it is detected and reported only).
// 3. Stores opened, idempotent migrations applied.
// 4. Crash recovery: processing thumbnails back to pending.
// 5. Consistency self-heal for a wiped thumbnail tree.
// 6. Scheduler and orchestrator up, KV probed.
// 7. Watcher installed; startup rebuild/backfill decisions.

use std::path::Path;
use std::sync::Arc;

use log::{info, warn};

use crate::config::Config;
use crate::constants::LEGACY_DB_FILENAME;
use crate::db::CatalogStore;
use crate::error::{Result, ShoeboxError};
use crate::index::{Indexer, IndexerDeps, IndexingFlag};
use crate::kv::{JobLock, Kv};
use crate::media::DimensionCache;
use crate::scheduler::{IdleMonitor, Scheduler};
use crate::service::IndexService;
use crate::tags::TagInvalidator;
use crate::thumbs::{self, ThumbDemand};
use crate::video::{LoggingVideoPipeline, VideoPipeline};
use crate::watcher::LibraryWatcher;

pub struct App {
    pub config: Config,
    pub store: Arc<CatalogStore>,
    pub kv: Arc<Kv>,
    pub scheduler: Scheduler,
    pub service: Arc<IndexService>,
    pub watcher: Option<Arc<LibraryWatcher>>,
    pub thumb_demand: Arc<ThumbDemand>,
    pub indexing_flag: Arc<IndexingFlag>,
    pub redis_configured: bool,
}

pub fn run(config: Config) -> Result<App> {
    run_with_video(config, Arc::new(LoggingVideoPipeline))
}

pub fn run_with_video(config: Config, video: Arc<dyn VideoPipeline>) -> Result<App> {
    // 1. Directories. The photo root must already exist; data and thumbs
    // are ours to create, and the thumbnail root must be writable.
    if !config.photos_dir.is_dir() {
        return Err(ShoeboxError::Validation(format!(
            "photo root {} does not exist",
            config.photos_dir.display()
        )));
    }
    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.thumbs_dir)?;
    verify_writable(&config.thumbs_dir)?;

    // 2. Legacy catalog detection.
    let legacy = config.data_dir.join(LEGACY_DB_FILENAME);
    let main_db = config.data_dir.join(crate::constants::MAIN_DB_FILENAME);
    if legacy.exists() && !main_db.exists() {
        warn!(
            "Legacy single-database catalog found at {}; run the migration tool before indexing (continuing with a fresh catalog)",
            legacy.display()
        );
    }

    // 3. Stores and migrations, plus the connection supervision ticker.
    let store = Arc::new(CatalogStore::open(&config.data_dir, config.sqlite.clone())?);
    spawn_connection_supervisor(Arc::clone(&store));

    // 4. Crash recovery.
    thumbs::reset_processing(&store)?;

    // 5. Self-heal against a wiped thumbnail tree.
    let healed = thumbs::self_heal_missing_thumbs(&store, &config.thumbs_dir)?;
    if healed > 0 {
        info!("Self-heal reset {} thumbnail rows", healed);
    }

    // 6. KV, idle gate, scheduler.
    let redis_configured = config.redis_url.is_some();
    let kv = Arc::new(match config.redis_url.as_deref() {
        Some(url) => Kv::with_redis(url),
        None => Kv::local_only(),
    });

    let thumb_demand = ThumbDemand::new();
    let idle = IdleMonitor::new(
        Arc::clone(&store),
        Arc::clone(&thumb_demand),
        config.scheduler.clone(),
    );
    let scheduler = Scheduler::new(Arc::clone(&idle), JobLock::new(Arc::clone(&kv)));
    scheduler.start(Arc::clone(&store), config.scheduler.clone());

    // 7. Indexer, service, watcher, startup indexing.
    let indexing_flag = IndexingFlag::new(Arc::clone(&kv));
    let indexer = Indexer::spawn(IndexerDeps {
        store: Arc::clone(&store),
        kv: Arc::clone(&kv),
        dims: Arc::new(DimensionCache::new(Arc::clone(&kv))),
        idle: Arc::clone(&idle),
        flag: Arc::clone(&indexing_flag),
        cfg: config.index.clone(),
    });

    let service = IndexService::new(
        Arc::clone(&store),
        indexer,
        scheduler.clone(),
        video,
        config.clone(),
    );

    let watcher = if config.watch.disabled {
        info!("Live watcher disabled by configuration");
        None
    } else {
        let watcher = LibraryWatcher::start(
            &config.photos_dir,
            config.watch.clone(),
            Arc::new(Arc::clone(&service)),
            TagInvalidator::new(Arc::clone(&kv)),
            Arc::clone(&indexing_flag),
        )?;
        service.attach_watcher(Arc::clone(&watcher));
        Some(watcher)
    };

    service.schedule_startup_index()?;

    Ok(App {
        config,
        store,
        kv,
        scheduler,
        service,
        watcher,
        thumb_demand,
        indexing_flag,
        redis_configured,
    })
}

/// Periodic liveness probe over all four connections; failed ones are
/// reopened with capped backoff.
fn spawn_connection_supervisor(store: Arc<CatalogStore>) {
    std::thread::Builder::new()
        .name("db-supervisor".into())
        .spawn(move || loop {
            std::thread::sleep(store.health_check_interval());
            store.health_check();
        })
        .expect("Failed to spawn db supervisor thread");
}

/// Probe write permission by creating and removing a marker file.
fn verify_writable(dir: &Path) -> Result<()> {
    let probe = dir.join(".write-probe");
    std::fs::write(&probe, b"probe").map_err(|e| {
        ShoeboxError::Validation(format!("{} is not writable: {}", dir.display(), e))
    })?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexConfig, SchedulerConfig, SqliteTuning, WatchConfig};

    fn test_config(root: &Path) -> Config {
        Config {
            photos_dir: root.join("photos"),
            data_dir: root.join("data"),
            thumbs_dir: root.join("thumbs"),
            redis_url: None,
            sqlite: SqliteTuning::default(),
            watch: WatchConfig {
                disabled: true,
                ..WatchConfig::default()
            },
            index: IndexConfig {
                disable_startup_index: true,
                ..IndexConfig::default()
            },
            scheduler: SchedulerConfig::default(),
        }
    }

    #[test]
    fn test_bootstrap_requires_photo_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(dir.path());
        assert!(run(config).is_err());
    }

    #[test]
    fn test_bootstrap_creates_dirs_and_opens_catalog() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("photos")).unwrap();
        let config = test_config(dir.path());

        let app = run(config).unwrap();
        assert!(dir.path().join("data/main.db").exists());
        assert!(dir.path().join("thumbs").is_dir());
        assert!(app.watcher.is_none());
        assert!(app.service.indexer().is_alive());

        let report = crate::health::check(&app.store, &app.kv, app.service.indexer(), false);
        assert!(report.ok, "issues: {:?}", report.issues);
    }

    #[test]
    fn test_bootstrap_resets_processing_rows() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("photos")).unwrap();
        let config = test_config(dir.path());

        // Seed a crashed-generator row, then bootstrap again.
        {
            let store =
                CatalogStore::open(&config.data_dir, config.sqlite.clone()).unwrap();
            store
                .run(
                    crate::db::Db::Main,
                    "INSERT INTO items (path, name, type, mtime) VALUES ('a/1.jpg', '1.jpg', 'photo', 5)",
                    &[],
                )
                .unwrap();
            store
                .run(
                    crate::db::Db::Main,
                    "INSERT INTO thumb_status (path, mtime, status) VALUES ('a/1.jpg', 5, 'processing')",
                    &[],
                )
                .unwrap();
        }

        let app = run(test_config(dir.path())).unwrap();
        let status: String = app
            .store
            .get(
                crate::db::Db::Main,
                "SELECT status FROM thumb_status WHERE path = 'a/1.jpg'",
                &[],
                |r| r.get(0),
            )
            .unwrap()
            .unwrap();
        assert_eq!(status, "pending");
    }
}
