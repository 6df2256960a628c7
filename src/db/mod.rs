// Catalog store
//
// Owns the connections to the four logical databases and is the only
// component that issues PRAGMAs. All access goes through the store so the
// query-timeout watchdog, transaction depth tracking, and telemetry counters
// see every call.

pub mod migrations;
pub mod retry;
pub mod store;

pub use retry::{DbTelemetry, RetryPolicy};
pub use store::{in_clause, BatchOptions, DbConn, TxMode};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{info, warn};
use rusqlite::Connection;

use crate::config::SqliteTuning;
use crate::constants::{
    DB_RECONNECT_BASE_MS, DB_RECONNECT_CAP_MS, HISTORY_DB_FILENAME, INDEX_DB_FILENAME,
    MAIN_DB_FILENAME, SETTINGS_DB_FILENAME,
};
use crate::error::{Result, ShoeboxError};

/// The four logical databases. `main` holds the catalog tables, `index`
/// holds rebuild status and the resume cursor; `settings` and `history` are
/// interface-only collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Db {
    Main,
    Settings,
    History,
    Index,
}

impl Db {
    pub const ALL: [Db; 4] = [Db::Main, Db::Settings, Db::History, Db::Index];

    pub fn filename(&self) -> &'static str {
        match self {
            Db::Main => MAIN_DB_FILENAME,
            Db::Settings => SETTINGS_DB_FILENAME,
            Db::History => HISTORY_DB_FILENAME,
            Db::Index => INDEX_DB_FILENAME,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Db::Main => "main",
            Db::Settings => "settings",
            Db::History => "history",
            Db::Index => "index",
        }
    }

    fn slot(&self) -> usize {
        match self {
            Db::Main => 0,
            Db::Settings => 1,
            Db::History => 2,
            Db::Index => 3,
        }
    }
}

pub struct CatalogStore {
    data_dir: PathBuf,
    tuning: SqliteTuning,
    conns: [Mutex<DbConn>; 4],
    telemetry: Arc<DbTelemetry>,
    degraded: [AtomicBool; 4],
}

impl CatalogStore {
    /// Open all four databases, apply PRAGMAs, and run idempotent keyed
    /// migrations on each.
    pub fn open(data_dir: &Path, tuning: SqliteTuning) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;

        let telemetry = Arc::new(DbTelemetry::default());
        let watchdog = store::Watchdog::spawn();

        let mut opened = Vec::with_capacity(4);
        for db in Db::ALL {
            let conn = open_connection(data_dir, db, &tuning)?;
            migrations::run_migrations(&conn, db)
                .map_err(|e| ShoeboxError::Schema(format!("{}: {}", db.label(), e)))?;
            opened.push(Mutex::new(DbConn::new(
                conn,
                db,
                tuning.clone(),
                watchdog.clone(),
                Arc::clone(&telemetry),
            )));
            info!("Opened {} database", db.label());
        }

        let mut iter = opened.into_iter();
        let conns = [
            iter.next().unwrap(),
            iter.next().unwrap(),
            iter.next().unwrap(),
            iter.next().unwrap(),
        ];

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            tuning,
            conns,
            telemetry,
            degraded: Default::default(),
        })
    }

    fn lock(&self, db: Db) -> MutexGuard<'_, DbConn> {
        // A poisoned mutex means a panic mid-statement; the connection
        // itself is still usable and the transaction depth is reset below.
        match self.conns[db.slot()].lock() {
            Ok(g) => g,
            Err(poisoned) => {
                let mut g = poisoned.into_inner();
                g.reset_after_panic();
                g
            }
        }
    }

    /// Run `f` with exclusive access to one database connection.
    pub fn with_conn<T>(&self, db: Db, f: impl FnOnce(&mut DbConn) -> Result<T>) -> Result<T> {
        let mut guard = self.lock(db);
        f(&mut guard)
    }

    pub fn run(&self, db: Db, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<usize> {
        self.lock(db).run(sql, params)
    }

    pub fn get<T>(
        &self,
        db: Db,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
        f: impl FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Option<T>> {
        self.lock(db).get(sql, params, f)
    }

    pub fn all<T>(
        &self,
        db: Db,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
        f: impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        self.lock(db).all(sql, params, f)
    }

    pub fn batch(
        &self,
        db: Db,
        sql: &str,
        rows: &[Vec<rusqlite::types::Value>],
        opts: BatchOptions,
    ) -> Result<usize> {
        self.lock(db).batch(sql, rows, opts)
    }

    pub fn with_transaction<T>(
        &self,
        db: Db,
        mode: TxMode,
        f: impl FnOnce(&mut DbConn) -> Result<T>,
    ) -> Result<T> {
        self.lock(db).with_transaction(mode, f)
    }

    pub fn has_table(&self, db: Db, table: &str) -> Result<bool> {
        self.lock(db).has_table(table)
    }

    pub fn has_column(&self, db: Db, table: &str, column: &str) -> Result<bool> {
        self.lock(db).has_column(table, column)
    }

    pub fn telemetry(&self) -> &Arc<DbTelemetry> {
        &self.telemetry
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// WAL checkpoint + ANALYZE for one database; the maintenance job walks
    /// all four with a delay step between them.
    pub fn checkpoint_and_analyze(&self, db: Db) -> Result<()> {
        let guard = self.lock(db);
        guard.raw().execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        guard.raw().execute_batch("ANALYZE;")?;
        Ok(())
    }

    /// Cheap liveness probe for one connection.
    pub fn ping(&self, db: Db) -> bool {
        let guard = self.lock(db);
        let ok = guard.raw().query_row("SELECT 1", [], |r| r.get::<_, i64>(0)).is_ok();
        drop(guard);
        self.degraded[db.slot()].store(!ok, Ordering::Relaxed);
        ok
    }

    pub fn is_degraded(&self, db: Db) -> bool {
        self.degraded[db.slot()].load(Ordering::Relaxed)
    }

    pub fn health_check_interval(&self) -> Duration {
        self.tuning.health_check_interval
    }

    /// Reopen one connection after a connection-level failure. Retries with
    /// capped exponential backoff before giving up.
    pub fn reconnect(&self, db: Db) -> Result<()> {
        let mut delay = Duration::from_millis(DB_RECONNECT_BASE_MS);
        let mut last_err = None;
        let attempts = self.tuning.reconnect_attempts;

        for attempt in 1..=attempts {
            match open_connection(&self.data_dir, db, &self.tuning) {
                Ok(conn) => {
                    let mut guard = self.lock(db);
                    guard.replace_connection(conn);
                    drop(guard);
                    self.degraded[db.slot()].store(false, Ordering::Relaxed);
                    self.telemetry.record_reconnect();
                    info!("Reconnected {} database (attempt {})", db.label(), attempt);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Reconnect attempt {}/{} for {} failed: {}",
                        attempt,
                        attempts,
                        db.label(),
                        e
                    );
                    last_err = Some(e);
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(Duration::from_millis(DB_RECONNECT_CAP_MS));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            ShoeboxError::Other(format!("reconnect failed for {}", db.label()))
        }))
    }

    /// Probe every connection and reconnect the ones that stopped answering.
    /// Driven by the supervision ticker.
    pub fn health_check(&self) {
        for db in Db::ALL {
            if !self.ping(db) {
                warn!("{} database failed health check, reconnecting", db.label());
                if let Err(e) = self.reconnect(db) {
                    warn!("{} database reconnect failed: {}", db.label(), e);
                }
            }
        }
    }

    /// Periodically emit the telemetry counters at a sampled interval.
    /// Returns the last sample time for the caller's bookkeeping.
    pub fn sample_telemetry(&self, last: Instant, every: Duration) -> Instant {
        if last.elapsed() >= every {
            self.telemetry.log_sample();
            Instant::now()
        } else {
            last
        }
    }
}

fn open_connection(data_dir: &Path, db: Db, tuning: &SqliteTuning) -> Result<Connection> {
    let path = data_dir.join(db.filename());
    let conn = Connection::open(&path)?;
    apply_pragmas(&conn, tuning)?;
    Ok(conn)
}

/// Startup PRAGMAs. Journal mode and synchronous level are env-tunable; the
/// rest keep SQLite out of the way under heavy batch writes.
fn apply_pragmas(conn: &Connection, tuning: &SqliteTuning) -> Result<()> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = {};\n\
         PRAGMA synchronous = {};\n\
         PRAGMA temp_store = {};\n\
         PRAGMA foreign_keys = ON;\n\
         PRAGMA cache_size = -{};\n\
         PRAGMA mmap_size = {};",
        tuning.journal_mode,
        tuning.synchronous,
        tuning.temp_store,
        tuning.cache_size_kib,
        tuning.mmap_size,
    ))?;
    conn.busy_timeout(tuning.busy_timeout)?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_store() -> (tempfile::TempDir, CatalogStore) {
    let dir = tempfile::TempDir::new().unwrap();
    let store = CatalogStore::open(dir.path(), SqliteTuning::default()).unwrap();
    (dir, store)
}
