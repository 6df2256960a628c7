// Shoebox Constants
// Defaults for everything the environment can override; see config.rs for
// the override surface.

// Database files
pub const MAIN_DB_FILENAME: &str = "main.db";
pub const SETTINGS_DB_FILENAME: &str = "settings.db";
pub const HISTORY_DB_FILENAME: &str = "history.db";
pub const INDEX_DB_FILENAME: &str = "index.db";
pub const LEGACY_DB_FILENAME: &str = "gallery.db";

// SQLite tuning defaults
pub const SQLITE_JOURNAL_MODE: &str = "WAL";
pub const SQLITE_SYNCHRONOUS: &str = "NORMAL";
pub const SQLITE_TEMP_STORE: &str = "MEMORY";
pub const SQLITE_CACHE_SIZE_KIB: i64 = 65536; // 64MB, passed as -kibibytes
pub const SQLITE_MMAP_SIZE: i64 = 268_435_456; // 256MB
pub const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const SQLITE_QUERY_TIMEOUT_MS: u64 = 30_000;
pub const SQLITE_QUERY_TIMEOUT_MIN_MS: u64 = 15_000;
pub const SQLITE_QUERY_TIMEOUT_MAX_MS: u64 = 60_000;
pub const SQLITE_SLOW_QUERY_MS: u64 = 1_000;

// Busy retry policy
pub const BUSY_RETRY_ATTEMPTS: u32 = 8;
pub const BUSY_RETRY_BASE_MS: u64 = 50;
pub const BUSY_RETRY_CAP_MS: u64 = 5_000;
pub const BUSY_RETRY_YIELD_MS: u64 = 200;

// Telemetry sampling
pub const DB_STATS_SAMPLE_INTERVAL_MS: u64 = 60_000;

// Indexing
pub const INDEX_BATCH_SIZE: usize = 1_000;
pub const INDEX_CONCURRENCY: usize = 8;
pub const INDEX_STABILIZE_DELAY_MS: u64 = 2_000;
pub const INDEX_START_DELAY_MS: u64 = 5_000;
pub const INDEX_RETRY_INTERVAL_MS: u64 = 30_000;
pub const INDEX_TIMEOUT_MS: u64 = 4 * 3_600_000;
pub const INDEX_LOCK_TTL_SEC: u64 = 3_600;
pub const INDEX_REBUILD_ESCALATION_THRESHOLD: usize = 5_000;

// Fingerprint sampling
pub const INDEX_HASH_SIZE_THRESHOLD: u64 = 16 * 1024 * 1024;
pub const INDEX_HASH_SAMPLE_BYTES: usize = 1_048_576; // 1MB head + 1MB tail

// Watcher
pub const WATCH_DEPTH: usize = 32;
pub const WATCH_POLL_INTERVAL_MS: u64 = 2_000;
pub const WATCH_STABILITY_THRESHOLD_MS: u64 = 1_000;
pub const WATCHER_IDLE_STOP_MS: u64 = 6 * 3_600_000;
pub const WATCHER_TICK_MS: u64 = 500;
pub const WATCHER_RESTART_DELAY_MS: u64 = 3_000;
pub const WATCHER_SKIP_LOG_SAMPLE: u64 = 100;

// Debounce escalation tiers (pending count -> delay)
pub const DEBOUNCE_TIER_HUGE: usize = 10_000;
pub const DEBOUNCE_TIER_HUGE_MS: u64 = 30_000;
pub const DEBOUNCE_TIER_LARGE: usize = 5_000;
pub const DEBOUNCE_TIER_LARGE_MS: u64 = 20_000;
pub const DEBOUNCE_TIER_MEDIUM: usize = 1_000;
pub const DEBOUNCE_TIER_MEDIUM_MS: u64 = 10_000;

// Backfill pacing
pub const DIM_BACKFILL_BATCH: usize = 200;
pub const DIM_BACKFILL_SLEEP_MS: u64 = 2_000;
pub const MTIME_BACKFILL_BATCH: usize = 500;
pub const MTIME_BACKFILL_SLEEP_MS: u64 = 1_000;

// Post-index maintenance scheduling
pub const POST_INDEX_BACKFILL_DELAY_MS: u64 = 60_000;
pub const POST_INDEX_BACKFILL_RETRY_MS: u64 = 5 * 60_000;
pub const POST_INDEX_BACKFILL_TIMEOUT_MS: u64 = 2 * 3_600_000;

// DB maintenance scheduling
pub const DB_MAINT_INTERVAL_MS: u64 = 6 * 3_600_000;
pub const DB_MAINT_RETRY_MS: u64 = 15 * 60_000;
pub const DB_MAINT_INITIAL_DELAY_MS: u64 = 10 * 60_000;
pub const DB_MAINT_DB_DELAY_STEP_MS: u64 = 30_000;

// Idle gate
pub const IDLE_CACHE_TTL_MS: u64 = 2_000;
pub const IDLE_CHECK_INTERVAL_MS: u64 = 5_000;
pub const IDLE_MAX_WAIT_MS: u64 = 10 * 60_000;
pub const IDLE_LOAD_PER_CORE: f64 = 0.75;
pub const IDLE_MEMORY_BUDGET_FRACTION: f64 = 0.90;
pub const IDLE_THUMB_DEMAND_THRESHOLD: u64 = 4;

// Distributed KV
pub const KV_PROBE_INTERVAL_MS: u64 = 30_000;
pub const INDEXING_FLAG_KEY: &str = "indexing_in_progress";
pub const INDEXING_FLAG_TTL_SEC: u64 = 120;
pub const DIM_CACHE_KEY_PREFIX: &str = "dim:";
pub const DIM_CACHE_TTL_SEC: u64 = 3_600;
pub const DIM_CACHE_L1_ENTRIES: usize = 500;
pub const ROUTE_CACHE_PREFIX: &str = "route:browse:";
pub const JOB_LOCK_PREFIX: &str = "lock:job:";

// Tag invalidation
pub const TAG_INVALIDATION_BASE_CAP: usize = 64;

// Connection supervision
pub const DB_HEALTH_CHECK_INTERVAL_MS: u64 = 60_000;
pub const DB_RECONNECT_ATTEMPTS: u32 = 5;
pub const DB_RECONNECT_BASE_MS: u64 = 500;
pub const DB_RECONNECT_CAP_MS: u64 = 30_000;

// Thumbnail layout
pub const THUMB_IMAGE_EXT: &str = "webp";
pub const THUMB_VIDEO_EXT: &str = "jpg";
pub const THUMB_SELF_HEAL_EXISTS_THRESHOLD: i64 = 50;
pub const THUMB_SELF_HEAL_SAMPLE: usize = 20;

// Dimension probing fallback when a file cannot be opened or parsed
pub const SENTINEL_DIMENSION: i64 = 1;

// Media extensions accepted by the indexer
pub const PHOTO_EXTENSIONS: [&str; 8] = [
    "jpg", "jpeg", "png", "gif", "bmp", "tiff", "webp", "heic",
];

pub const VIDEO_EXTENSIONS: [&str; 10] = [
    "mp4", "mov", "avi", "mkv", "webm", "m4v", "mpg", "mpeg", "wmv", "3gp",
];

// HLS transcoder output and database-like files; indexing these would loop
// the watcher on our own writes.
pub const REJECTED_EXTENSIONS: [&str; 8] = [
    "m3u8", "ts", "tmp", "db", "db-wal", "db-shm", "db-journal", "sqlite",
];

// Directory names never worth watching or indexing
pub const IGNORED_DIRS: [&str; 8] = [
    "@eaDir",
    "#recycle",
    ".thumbnails",
    ".previews",
    "lost+found",
    "System Volume Information",
    "$RECYCLE.BIN",
    "__MACOSX",
];
