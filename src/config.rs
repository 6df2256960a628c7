// Environment-driven configuration
//
// Every knob has a compiled default in constants.rs; the environment can
// override each one. Bad values fall back to the default with a warning so a
// typo in a unit suffix never takes the server down.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::warn;

use crate::constants::*;

/// Parse an environment variable, falling back to `default` when unset or
/// unparseable.
fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("Ignoring unparseable {}={:?}, using default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_flag(key: &str) -> bool {
    matches!(
        env::var(key).as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes")
    )
}

/// SQLite tuning and connection supervision, applied by the catalog store.
#[derive(Debug, Clone)]
pub struct SqliteTuning {
    pub journal_mode: String,
    pub synchronous: String,
    pub temp_store: String,
    pub cache_size_kib: i64,
    pub mmap_size: i64,
    pub busy_timeout: Duration,
    pub query_timeout: Duration,
    pub slow_query: Duration,
    pub health_check_interval: Duration,
    pub reconnect_attempts: u32,
}

impl SqliteTuning {
    fn from_env() -> Self {
        // Query timeout is clamped; an over-eager override would otherwise
        // interrupt legitimate full-table scans on large catalogs.
        let query_timeout_ms = env_parse("SQLITE_QUERY_TIMEOUT", SQLITE_QUERY_TIMEOUT_MS)
            .clamp(SQLITE_QUERY_TIMEOUT_MIN_MS, SQLITE_QUERY_TIMEOUT_MAX_MS);
        // SQLITE_INTERRUPT_MS is a legacy alias for the same deadline.
        let query_timeout_ms = env_parse("SQLITE_INTERRUPT_MS", query_timeout_ms)
            .clamp(SQLITE_QUERY_TIMEOUT_MIN_MS, SQLITE_QUERY_TIMEOUT_MAX_MS);

        Self {
            journal_mode: env_string("SQLITE_JOURNAL_MODE", SQLITE_JOURNAL_MODE),
            synchronous: env_string("SQLITE_SYNCHRONOUS", SQLITE_SYNCHRONOUS),
            temp_store: env_string("SQLITE_TEMP_STORE", SQLITE_TEMP_STORE),
            cache_size_kib: env_parse("SQLITE_CACHE_SIZE", SQLITE_CACHE_SIZE_KIB),
            mmap_size: env_parse("SQLITE_MMAP_SIZE", SQLITE_MMAP_SIZE),
            busy_timeout: Duration::from_millis(env_parse(
                "SQLITE_BUSY_TIMEOUT",
                SQLITE_BUSY_TIMEOUT_MS,
            )),
            query_timeout: Duration::from_millis(query_timeout_ms),
            slow_query: Duration::from_millis(env_parse(
                "SQLITE_SLOW_QUERY_MS",
                SQLITE_SLOW_QUERY_MS,
            )),
            health_check_interval: Duration::from_millis(env_parse(
                "DB_HEALTH_CHECK_INTERVAL",
                DB_HEALTH_CHECK_INTERVAL_MS,
            )),
            reconnect_attempts: env_parse("DB_RECONNECT_ATTEMPTS", DB_RECONNECT_ATTEMPTS).max(1),
        }
    }
}

impl Default for SqliteTuning {
    fn default() -> Self {
        Self {
            journal_mode: SQLITE_JOURNAL_MODE.to_string(),
            synchronous: SQLITE_SYNCHRONOUS.to_string(),
            temp_store: SQLITE_TEMP_STORE.to_string(),
            cache_size_kib: SQLITE_CACHE_SIZE_KIB,
            mmap_size: SQLITE_MMAP_SIZE,
            busy_timeout: Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS),
            query_timeout: Duration::from_millis(SQLITE_QUERY_TIMEOUT_MS),
            slow_query: Duration::from_millis(SQLITE_SLOW_QUERY_MS),
            health_check_interval: Duration::from_millis(DB_HEALTH_CHECK_INTERVAL_MS),
            reconnect_attempts: DB_RECONNECT_ATTEMPTS,
        }
    }
}

/// Watcher tuning.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub disabled: bool,
    pub depth: usize,
    pub use_polling: bool,
    pub poll_interval: Duration,
    pub stability_threshold: Duration,
    pub stabilize_delay: Duration,
    pub idle_stop: Duration,
    pub hash_size_threshold: u64,
    pub hash_sample_bytes: usize,
    pub escalation_threshold: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            depth: WATCH_DEPTH,
            use_polling: false,
            poll_interval: Duration::from_millis(WATCH_POLL_INTERVAL_MS),
            stability_threshold: Duration::from_millis(WATCH_STABILITY_THRESHOLD_MS),
            stabilize_delay: Duration::from_millis(INDEX_STABILIZE_DELAY_MS),
            idle_stop: Duration::from_millis(WATCHER_IDLE_STOP_MS),
            hash_size_threshold: INDEX_HASH_SIZE_THRESHOLD,
            hash_sample_bytes: INDEX_HASH_SAMPLE_BYTES,
            escalation_threshold: INDEX_REBUILD_ESCALATION_THRESHOLD,
        }
    }
}

/// Indexer tuning.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    pub start_delay: Duration,
    pub retry_interval: Duration,
    pub timeout: Duration,
    pub lock_ttl_sec: u64,
    pub disable_startup_index: bool,
    pub dim_backfill_batch: usize,
    pub dim_backfill_sleep: Duration,
    pub mtime_backfill_batch: usize,
    pub mtime_backfill_sleep: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            batch_size: INDEX_BATCH_SIZE,
            concurrency: INDEX_CONCURRENCY,
            start_delay: Duration::from_millis(INDEX_START_DELAY_MS),
            retry_interval: Duration::from_millis(INDEX_RETRY_INTERVAL_MS),
            timeout: Duration::from_millis(INDEX_TIMEOUT_MS),
            lock_ttl_sec: INDEX_LOCK_TTL_SEC,
            disable_startup_index: false,
            dim_backfill_batch: DIM_BACKFILL_BATCH,
            dim_backfill_sleep: Duration::from_millis(DIM_BACKFILL_SLEEP_MS),
            mtime_backfill_batch: MTIME_BACKFILL_BATCH,
            mtime_backfill_sleep: Duration::from_millis(MTIME_BACKFILL_SLEEP_MS),
        }
    }
}

/// Scheduler and maintenance tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub idle_cache_ttl: Duration,
    pub idle_check_interval: Duration,
    pub idle_max_wait: Duration,
    pub load_per_core: f64,
    pub memory_budget_fraction: f64,
    pub thumb_demand_threshold: u64,
    pub maint_interval: Duration,
    pub maint_retry: Duration,
    pub maint_initial_delay: Duration,
    pub maint_db_delay_step: Duration,
    pub post_backfill_delay: Duration,
    pub post_backfill_retry: Duration,
    pub post_backfill_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_cache_ttl: Duration::from_millis(IDLE_CACHE_TTL_MS),
            idle_check_interval: Duration::from_millis(IDLE_CHECK_INTERVAL_MS),
            idle_max_wait: Duration::from_millis(IDLE_MAX_WAIT_MS),
            load_per_core: IDLE_LOAD_PER_CORE,
            memory_budget_fraction: IDLE_MEMORY_BUDGET_FRACTION,
            thumb_demand_threshold: IDLE_THUMB_DEMAND_THRESHOLD,
            maint_interval: Duration::from_millis(DB_MAINT_INTERVAL_MS),
            maint_retry: Duration::from_millis(DB_MAINT_RETRY_MS),
            maint_initial_delay: Duration::from_millis(DB_MAINT_INITIAL_DELAY_MS),
            maint_db_delay_step: Duration::from_millis(DB_MAINT_DB_DELAY_STEP_MS),
            post_backfill_delay: Duration::from_millis(POST_INDEX_BACKFILL_DELAY_MS),
            post_backfill_retry: Duration::from_millis(POST_INDEX_BACKFILL_RETRY_MS),
            post_backfill_timeout: Duration::from_millis(POST_INDEX_BACKFILL_TIMEOUT_MS),
        }
    }
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub photos_dir: PathBuf,
    pub data_dir: PathBuf,
    pub thumbs_dir: PathBuf,
    pub redis_url: Option<String>,
    pub sqlite: SqliteTuning,
    pub watch: WatchConfig,
    pub index: IndexConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Resolve configuration from the environment. Directory arguments come
    /// from the CLI layer; everything else is env-var tunable.
    pub fn from_env(photos_dir: PathBuf, data_dir: PathBuf, thumbs_dir: PathBuf) -> Self {
        let watch = WatchConfig {
            disabled: env_flag("DISABLE_WATCH"),
            depth: env_parse("WATCH_DEPTH", WATCH_DEPTH),
            use_polling: env_flag("WATCH_USE_POLLING"),
            poll_interval: Duration::from_millis(env_parse(
                "WATCH_POLL_INTERVAL",
                WATCH_POLL_INTERVAL_MS,
            )),
            stability_threshold: Duration::from_millis(env_parse(
                "WATCH_STABILITY_THRESHOLD",
                WATCH_STABILITY_THRESHOLD_MS,
            )),
            stabilize_delay: Duration::from_millis(env_parse(
                "INDEX_STABILIZE_DELAY_MS",
                INDEX_STABILIZE_DELAY_MS,
            )),
            idle_stop: Duration::from_millis(env_parse(
                "WATCHER_IDLE_STOP_MS",
                WATCHER_IDLE_STOP_MS,
            )),
            hash_size_threshold: env_parse("INDEX_HASH_SIZE_THRESHOLD", INDEX_HASH_SIZE_THRESHOLD),
            hash_sample_bytes: env_parse("INDEX_HASH_SAMPLE_BYTES", INDEX_HASH_SAMPLE_BYTES),
            escalation_threshold: INDEX_REBUILD_ESCALATION_THRESHOLD,
        };

        let index = IndexConfig {
            batch_size: env_parse("INDEX_BATCH_SIZE", INDEX_BATCH_SIZE).max(1),
            concurrency: env_parse("INDEX_CONCURRENCY", INDEX_CONCURRENCY).max(1),
            start_delay: Duration::from_millis(env_parse(
                "INDEX_START_DELAY_MS",
                INDEX_START_DELAY_MS,
            )),
            retry_interval: Duration::from_millis(env_parse(
                "INDEX_RETRY_INTERVAL_MS",
                INDEX_RETRY_INTERVAL_MS,
            )),
            timeout: Duration::from_millis(env_parse("INDEX_TIMEOUT_MS", INDEX_TIMEOUT_MS)),
            lock_ttl_sec: env_parse("INDEX_LOCK_TTL_SEC", INDEX_LOCK_TTL_SEC),
            disable_startup_index: env_flag("DISABLE_STARTUP_INDEX"),
            dim_backfill_batch: env_parse("DIM_BACKFILL_BATCH", DIM_BACKFILL_BATCH).max(1),
            dim_backfill_sleep: Duration::from_millis(env_parse(
                "DIM_BACKFILL_SLEEP_MS",
                DIM_BACKFILL_SLEEP_MS,
            )),
            mtime_backfill_batch: env_parse("MTIME_BACKFILL_BATCH", MTIME_BACKFILL_BATCH).max(1),
            mtime_backfill_sleep: Duration::from_millis(env_parse(
                "MTIME_BACKFILL_SLEEP_MS",
                MTIME_BACKFILL_SLEEP_MS,
            )),
        };

        let scheduler = SchedulerConfig {
            maint_interval: Duration::from_millis(env_parse(
                "DB_MAINT_INTERVAL_MS",
                DB_MAINT_INTERVAL_MS,
            )),
            maint_retry: Duration::from_millis(env_parse("DB_MAINT_RETRY_MS", DB_MAINT_RETRY_MS)),
            maint_initial_delay: Duration::from_millis(env_parse(
                "DB_MAINT_INITIAL_DELAY_MS",
                DB_MAINT_INITIAL_DELAY_MS,
            )),
            maint_db_delay_step: Duration::from_millis(env_parse(
                "DB_MAINT_DB_DELAY_STEP_MS",
                DB_MAINT_DB_DELAY_STEP_MS,
            )),
            post_backfill_delay: Duration::from_millis(env_parse(
                "POST_INDEX_BACKFILL_DELAY_MS",
                POST_INDEX_BACKFILL_DELAY_MS,
            )),
            post_backfill_retry: Duration::from_millis(env_parse(
                "POST_INDEX_BACKFILL_RETRY_MS",
                POST_INDEX_BACKFILL_RETRY_MS,
            )),
            post_backfill_timeout: Duration::from_millis(env_parse(
                "POST_INDEX_BACKFILL_TIMEOUT_MS",
                POST_INDEX_BACKFILL_TIMEOUT_MS,
            )),
            ..SchedulerConfig::default()
        };

        Self {
            photos_dir,
            data_dir,
            thumbs_dir,
            redis_url: env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            sqlite: SqliteTuning::from_env(),
            watch,
            index,
            scheduler,
        }
    }
}
