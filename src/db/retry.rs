// Busy-aware retry wrapper and telemetry counters
//
// SQLite reports BUSY/LOCKED under writer contention; the wrapper absorbs
// short storms with exponential backoff + jitter before surfacing Conflict.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;

use crate::constants::{
    BUSY_RETRY_ATTEMPTS, BUSY_RETRY_BASE_MS, BUSY_RETRY_CAP_MS, BUSY_RETRY_YIELD_MS,
};
use crate::error::Result;

/// Counters sampled periodically to the log. Shared across every connection
/// of the store.
#[derive(Debug, Default)]
pub struct DbTelemetry {
    busy_retries: AtomicU64,
    busy_exhausted: AtomicU64,
    timeouts: AtomicU64,
    slow_queries: AtomicU64,
    reconnects: AtomicU64,
}

impl DbTelemetry {
    pub fn record_busy_retry(&self) {
        self.busy_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_busy_exhausted(&self) {
        self.busy_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slow_query(&self) {
        self.slow_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn busy_retries(&self) -> u64 {
        self.busy_retries.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn slow_queries(&self) -> u64 {
        self.slow_queries.load(Ordering::Relaxed)
    }

    pub fn log_sample(&self) {
        let retries = self.busy_retries.load(Ordering::Relaxed);
        let exhausted = self.busy_exhausted.load(Ordering::Relaxed);
        let timeouts = self.timeouts.load(Ordering::Relaxed);
        let slow = self.slow_queries.load(Ordering::Relaxed);
        let reconnects = self.reconnects.load(Ordering::Relaxed);

        if retries + exhausted + timeouts + slow + reconnects == 0 {
            debug!("DB stats: quiet");
        } else {
            info!(
                "DB stats: busy_retries={} busy_exhausted={} timeouts={} slow_queries={} reconnects={}",
                retries, exhausted, timeouts, slow, reconnects
            );
        }
    }
}

/// Exponential backoff + jitter for BUSY/LOCKED writes: up to 8 attempts,
/// base 50 ms, cap 5 s. `yield_first` adds a pre-delay before the first
/// attempt so foreground writes yield to a running indexer.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    pub yield_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: BUSY_RETRY_ATTEMPTS,
            base: Duration::from_millis(BUSY_RETRY_BASE_MS),
            cap: Duration::from_millis(BUSY_RETRY_CAP_MS),
            yield_delay: Duration::from_millis(BUSY_RETRY_YIELD_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `n` (1-based): min(cap, base * 2^(n-1)) plus up
    /// to 50% jitter so concurrent retriers fan out.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32 << (attempt - 1).min(16))
            .min(self.cap);
        let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 2);
        exp + Duration::from_millis(jitter_ms)
    }

    pub fn run<T>(
        &self,
        telemetry: &DbTelemetry,
        yield_first: bool,
        mut f: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        if yield_first {
            std::thread::sleep(self.yield_delay);
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_busy() && attempt < self.attempts => {
                    telemetry.record_busy_retry();
                    let delay = self.backoff(attempt);
                    debug!(
                        "Write busy (attempt {}/{}), backing off {} ms",
                        attempt,
                        self.attempts,
                        delay.as_millis()
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => {
                    if e.is_busy() {
                        telemetry.record_busy_exhausted();
                        warn!("Write still busy after {} attempts", self.attempts);
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShoeboxError;

    fn busy_error() -> ShoeboxError {
        ShoeboxError::Conflict("database is locked".into())
    }

    #[test]
    fn test_retry_eventually_succeeds() {
        let telemetry = DbTelemetry::default();
        let policy = RetryPolicy {
            attempts: 5,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            yield_delay: Duration::from_millis(0),
        };

        let mut remaining_failures = 3;
        let result = policy.run(&telemetry, false, || {
            if remaining_failures > 0 {
                remaining_failures -= 1;
                Err(busy_error())
            } else {
                Ok(42)
            }
        });

        assert_eq!(result.unwrap(), 42);
        assert_eq!(telemetry.busy_retries(), 3);
    }

    #[test]
    fn test_retry_exhausts_and_surfaces_conflict() {
        let telemetry = DbTelemetry::default();
        let policy = RetryPolicy {
            attempts: 3,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(1),
            yield_delay: Duration::from_millis(0),
        };

        let result: Result<()> = policy.run(&telemetry, false, || Err(busy_error()));
        assert!(result.is_err());
        assert_eq!(telemetry.busy_retries(), 2);
    }

    #[test]
    fn test_busy_storm_all_writers_succeed() {
        use crate::db::{CatalogStore, Db};
        use crate::config::SqliteTuning;
        use std::sync::Arc;

        let dir = tempfile::TempDir::new().unwrap();
        // The store opens the file and applies the schema.
        let store = CatalogStore::open(dir.path(), SqliteTuning::default()).unwrap();
        let db_path = dir.path().join(Db::Main.filename());
        let telemetry = Arc::new(DbTelemetry::default());
        let policy = RetryPolicy {
            attempts: 8,
            base: Duration::from_millis(2),
            cap: Duration::from_millis(50),
            yield_delay: Duration::from_millis(0),
        };

        // Independent connections with no busy_timeout, so writer
        // contention surfaces as BUSY and exercises the wrapper.
        let writers = 16;
        let per_writer = 5;
        std::thread::scope(|s| {
            for w in 0..writers {
                let db_path = db_path.clone();
                let policy = policy.clone();
                let telemetry = Arc::clone(&telemetry);
                s.spawn(move || {
                    let conn = rusqlite::Connection::open(&db_path).unwrap();
                    conn.busy_timeout(Duration::from_millis(0)).unwrap();
                    for i in 0..per_writer {
                        let path = format!("storm/{}-{}.jpg", w, i);
                        policy
                            .run(&telemetry, false, || {
                                conn.execute(
                                    "INSERT INTO thumb_status (path, mtime, status)
                                     VALUES (?1, 1, 'pending')",
                                    [&path],
                                )
                                .map(|_| ())
                                .map_err(crate::error::ShoeboxError::from)
                            })
                            .unwrap();
                    }
                });
            }
        });

        let count = store
            .get(Db::Main, "SELECT COUNT(*) FROM thumb_status", &[], |r| {
                r.get::<_, i64>(0)
            })
            .unwrap()
            .unwrap();
        assert_eq!(count as usize, writers * per_writer, "no data loss");
    }

    #[test]
    fn test_non_busy_error_not_retried() {
        let telemetry = DbTelemetry::default();
        let policy = RetryPolicy::default();

        let mut calls = 0;
        let result: Result<()> = policy.run(&telemetry, false, || {
            calls += 1;
            Err(ShoeboxError::Validation("bad path".into()))
        });

        assert!(result.is_err());
        assert_eq!(calls, 1);
        assert_eq!(telemetry.busy_retries(), 0);
    }
}
