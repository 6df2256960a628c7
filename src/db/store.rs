// Connection wrapper: query-timeout watchdog, transaction depth tracking,
// and the chunked batch executor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};
use rusqlite::{Connection, InterruptHandle, ToSql};

use crate::config::SqliteTuning;
use crate::db::retry::DbTelemetry;
use crate::db::Db;
use crate::error::{Result, ShoeboxError};

/// Explicit transaction mode. `Immediate` is the default for mixed
/// read/write work so lock acquisition fails fast instead of at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    Deferred,
    Immediate,
    Exclusive,
}

impl TxMode {
    fn begin_sql(&self) -> &'static str {
        match self {
            TxMode::Deferred => "BEGIN DEFERRED",
            TxMode::Immediate => "BEGIN IMMEDIATE",
            TxMode::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub chunk_size: usize,
    /// When set, the batch opens its own IMMEDIATE transaction and commits
    /// or rolls back as a unit. Callers already inside a transaction leave
    /// this off.
    pub manage_transaction: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            manage_transaction: true,
        }
    }
}

/// Build a `?,?,?` placeholder list for an IN clause.
pub fn in_clause(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

// --- Query-timeout watchdog -------------------------------------------------
//
// SQLite has no per-statement deadline, so each guarded call arms the
// watchdog with the connection's interrupt handle. If the statement is still
// running at the deadline the watchdog interrupts it and the error surfaces
// as Timeout.

struct Arm {
    handle: InterruptHandle,
    deadline: Instant,
    done: Arc<AtomicBool>,
}

#[derive(Clone)]
pub(crate) struct Watchdog {
    tx: Sender<Arm>,
}

impl Watchdog {
    pub(crate) fn spawn() -> Self {
        let (tx, rx) = unbounded::<Arm>();
        std::thread::Builder::new()
            .name("db-watchdog".into())
            .spawn(move || watchdog_loop(rx))
            .expect("Failed to spawn db watchdog thread");
        Self { tx }
    }

    fn arm(&self, handle: InterruptHandle, timeout: Duration) -> ArmGuard {
        let done = Arc::new(AtomicBool::new(false));
        let _ = self.tx.send(Arm {
            handle,
            deadline: Instant::now() + timeout,
            done: Arc::clone(&done),
        });
        ArmGuard { done }
    }
}

struct ArmGuard {
    done: Arc<AtomicBool>,
}

impl Drop for ArmGuard {
    fn drop(&mut self) {
        self.done.store(true, Ordering::Release);
    }
}

fn watchdog_loop(rx: Receiver<Arm>) {
    let mut armed: Vec<Arm> = Vec::new();

    loop {
        let wait = armed
            .iter()
            .map(|a| a.deadline.saturating_duration_since(Instant::now()))
            .min()
            .unwrap_or(Duration::from_secs(1));

        match rx.recv_timeout(wait) {
            Ok(arm) => armed.push(arm),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }

        let now = Instant::now();
        armed.retain(|a| {
            if a.done.load(Ordering::Acquire) {
                return false;
            }
            if a.deadline <= now {
                a.handle.interrupt();
                return false;
            }
            true
        });
    }
}

// --- Connection wrapper -----------------------------------------------------

pub struct DbConn {
    conn: Connection,
    db: Db,
    tx_depth: u32,
    tuning: SqliteTuning,
    watchdog: Watchdog,
    telemetry: Arc<DbTelemetry>,
}

impl DbConn {
    pub(crate) fn new(
        conn: Connection,
        db: Db,
        tuning: SqliteTuning,
        watchdog: Watchdog,
        telemetry: Arc<DbTelemetry>,
    ) -> Self {
        Self {
            conn,
            db,
            tx_depth: 0,
            tuning,
            watchdog,
            telemetry,
        }
    }

    pub fn db(&self) -> Db {
        self.db
    }

    /// Direct access for migrations and maintenance PRAGMAs.
    pub fn raw(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn replace_connection(&mut self, conn: Connection) {
        self.conn = conn;
        self.tx_depth = 0;
    }

    pub(crate) fn reset_after_panic(&mut self) {
        if self.tx_depth > 0 {
            let _ = self.conn.execute_batch("ROLLBACK");
            self.tx_depth = 0;
        }
    }

    /// Run `f` under the watchdog deadline; interrupted statements surface
    /// as Timeout, and anything slower than the slow-query threshold is
    /// logged.
    fn guarded<T>(
        &self,
        label: &str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let _arm = self
            .watchdog
            .arm(self.conn.get_interrupt_handle(), self.tuning.query_timeout);
        let started = Instant::now();
        let result = f(&self.conn);
        let elapsed = started.elapsed();

        if elapsed >= self.tuning.slow_query {
            self.telemetry.record_slow_query();
            warn!(
                "Slow query on {} ({} ms): {}",
                self.db.label(),
                elapsed.as_millis(),
                label
            );
        }

        match result {
            Ok(v) => Ok(v),
            Err(rusqlite::Error::SqliteFailure(e, msg))
                if e.code == rusqlite::ErrorCode::OperationInterrupted =>
            {
                self.telemetry.record_timeout();
                debug!("Query interrupted on {}: {:?}", self.db.label(), msg);
                Err(ShoeboxError::Timeout(format!(
                    "query exceeded {} ms on {}",
                    self.tuning.query_timeout.as_millis(),
                    self.db.label()
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn run(&mut self, sql: &str, params: &[&dyn ToSql]) -> Result<usize> {
        self.guarded(sql, |conn| conn.execute(sql, params))
    }

    pub fn get<T>(
        &mut self,
        sql: &str,
        params: &[&dyn ToSql],
        f: impl FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Option<T>> {
        self.guarded(sql, |conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params)?;
            match rows.next()? {
                Some(row) => Ok(Some(f(row)?)),
                None => Ok(None),
            }
        })
    }

    pub fn all<T>(
        &mut self,
        sql: &str,
        params: &[&dyn ToSql],
        mut f: impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        self.guarded(sql, |conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(f(row)?);
            }
            Ok(out)
        })
    }

    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    /// Stream `rows` through one prepared statement in chunks. With
    /// `manage_transaction` the whole batch is atomic; on failure it rolls
    /// back and rethrows. The statement is finalized either way.
    pub fn batch(
        &mut self,
        sql: &str,
        rows: &[Vec<rusqlite::types::Value>],
        opts: BatchOptions,
    ) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let chunk_size = opts.chunk_size.max(1);

        if opts.manage_transaction && self.tx_depth == 0 {
            return self.with_transaction(TxMode::Immediate, |db| {
                db.batch(
                    sql,
                    rows,
                    BatchOptions {
                        chunk_size,
                        manage_transaction: false,
                    },
                )
            });
        }

        let mut affected = 0usize;
        let _arm = self
            .watchdog
            .arm(self.conn.get_interrupt_handle(), self.tuning.query_timeout);

        let mut stmt = self.conn.prepare(sql)?;
        for chunk in rows.chunks(chunk_size) {
            for row in chunk {
                affected += stmt.execute(rusqlite::params_from_iter(row.iter()))?;
            }
        }
        drop(stmt);

        Ok(affected)
    }

    /// Run `f` inside a transaction of the given mode. Nested calls are
    /// tracked with an explicit depth counter: the inner call runs inside
    /// the outer transaction and commit/rollback only happen at depth 0.
    pub fn with_transaction<T>(
        &mut self,
        mode: TxMode,
        f: impl FnOnce(&mut DbConn) -> Result<T>,
    ) -> Result<T> {
        if self.tx_depth > 0 {
            self.tx_depth += 1;
            let result = f(self);
            self.tx_depth -= 1;
            return result;
        }

        self.conn.execute_batch(mode.begin_sql())?;
        self.tx_depth = 1;

        let result = f(self);
        self.tx_depth = 0;

        match result {
            Ok(v) => {
                if let Err(e) = self.conn.execute_batch("COMMIT") {
                    // A BUSY commit leaves the transaction open; roll it
                    // back so the retry wrapper can BEGIN again cleanly.
                    let _ = self.conn.execute_batch("ROLLBACK");
                    return Err(e.into());
                }
                Ok(v)
            }
            Err(e) => {
                // Rollback only because this level began the transaction.
                if let Err(rb) = self.conn.execute_batch("ROLLBACK") {
                    warn!("Rollback failed on {}: {}", self.db.label(), rb);
                }
                Err(e)
            }
        }
    }

    pub fn has_table(&mut self, table: &str) -> Result<bool> {
        let found = self.get(
            "SELECT 1 FROM sqlite_master WHERE type IN ('table','view') AND name = ?1",
            &[&table],
            |_| Ok(()),
        )?;
        Ok(found.is_some())
    }

    pub fn has_column(&mut self, table: &str, column: &str) -> Result<bool> {
        if !self.has_table(table)? {
            return Ok(false);
        }
        let cols = self.guarded("PRAGMA table_info", |conn| {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
            let mut rows = stmt.query([])?;
            let mut names = Vec::new();
            while let Some(row) = rows.next()? {
                names.push(row.get::<_, String>(1)?);
            }
            Ok(names)
        })?;
        Ok(cols.iter().any(|c| c == column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_store, Db};

    #[test]
    fn test_in_clause() {
        assert_eq!(in_clause(0), "");
        assert_eq!(in_clause(1), "?");
        assert_eq!(in_clause(3), "?,?,?");
    }

    #[test]
    fn test_run_get_all() {
        let (_dir, store) = test_store();
        store
            .run(
                Db::Main,
                "INSERT INTO items (path, name, type, mtime) VALUES (?1, ?2, ?3, ?4)",
                &[&"a/x.jpg", &"x.jpg", &"photo", &100i64],
            )
            .unwrap();

        let name = store
            .get(
                Db::Main,
                "SELECT name FROM items WHERE path = ?1",
                &[&"a/x.jpg"],
                |r| r.get::<_, String>(0),
            )
            .unwrap();
        assert_eq!(name.as_deref(), Some("x.jpg"));

        let all = store
            .all(Db::Main, "SELECT path FROM items", &[], |r| {
                r.get::<_, String>(0)
            })
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_nested_transaction_is_noop() {
        let (_dir, store) = test_store();
        store
            .with_transaction(Db::Main, TxMode::Immediate, |db| {
                db.run(
                    "INSERT INTO items (path, name, type) VALUES ('a', 'a', 'album')",
                    &[],
                )?;
                // Inner transaction must run inside the outer one.
                db.with_transaction(TxMode::Immediate, |db| {
                    db.run(
                        "INSERT INTO items (path, name, type) VALUES ('b', 'b', 'album')",
                        &[],
                    )
                })?;
                Ok(())
            })
            .unwrap();

        let count = store
            .get(Db::Main, "SELECT COUNT(*) FROM items", &[], |r| {
                r.get::<_, i64>(0)
            })
            .unwrap()
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_transaction_rollback_on_error() {
        let (_dir, store) = test_store();
        let result: Result<()> = store.with_transaction(Db::Main, TxMode::Immediate, |db| {
            db.run(
                "INSERT INTO items (path, name, type) VALUES ('a', 'a', 'album')",
                &[],
            )?;
            Err(ShoeboxError::Other("boom".into()))
        });
        assert!(result.is_err());

        let count = store
            .get(Db::Main, "SELECT COUNT(*) FROM items", &[], |r| {
                r.get::<_, i64>(0)
            })
            .unwrap()
            .unwrap();
        assert_eq!(count, 0, "rollback must leave the catalog unchanged");
    }

    #[test]
    fn test_batch_atomicity_on_failure() {
        let (_dir, store) = test_store();
        let good = vec![
            vec![
                rusqlite::types::Value::from("a/1.jpg".to_string()),
                rusqlite::types::Value::from("1.jpg".to_string()),
            ],
            vec![
                rusqlite::types::Value::from("a/2.jpg".to_string()),
                rusqlite::types::Value::from("2.jpg".to_string()),
            ],
        ];
        let n = store
            .batch(
                Db::Main,
                "INSERT INTO items (path, name, type) VALUES (?1, ?2, 'photo')",
                &good,
                BatchOptions::default(),
            )
            .unwrap();
        assert_eq!(n, 2);

        // A duplicate path violates UNIQUE mid-batch; the whole batch rolls
        // back and the row count is unchanged.
        let bad = vec![
            vec![
                rusqlite::types::Value::from("a/3.jpg".to_string()),
                rusqlite::types::Value::from("3.jpg".to_string()),
            ],
            vec![
                rusqlite::types::Value::from("a/1.jpg".to_string()),
                rusqlite::types::Value::from("1.jpg".to_string()),
            ],
        ];
        let result = store.batch(
            Db::Main,
            "INSERT INTO items (path, name, type) VALUES (?1, ?2, 'photo')",
            &bad,
            BatchOptions::default(),
        );
        assert!(result.is_err());

        let count = store
            .get(Db::Main, "SELECT COUNT(*) FROM items", &[], |r| {
                r.get::<_, i64>(0)
            })
            .unwrap()
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_has_table_and_column() {
        let (_dir, store) = test_store();
        assert!(store.has_table(Db::Main, "items").unwrap());
        assert!(!store.has_table(Db::Main, "nope").unwrap());
        assert!(store.has_column(Db::Main, "items", "mtime").unwrap());
        assert!(!store.has_column(Db::Main, "items", "nope").unwrap());
    }
}
