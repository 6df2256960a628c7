// Database migrations
// Migrations are forward-only and keyed; the ledger table makes re-runs
// idempotent. Never edit or delete a migration after it ships.

use anyhow::Result;
use log::info;
use rusqlite::Connection;

use crate::db::Db;

const MAIN_MIGRATIONS: &[(&str, &str)] = &[
    (
        "001_catalog",
        r#"
    -- Items table: one row per album directory or media file, keyed by the
    -- POSIX-normalized path relative to the photo root.
    CREATE TABLE items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        type TEXT NOT NULL CHECK (type IN ('album', 'photo', 'video')),
        mtime INTEGER NOT NULL DEFAULT 0,
        width INTEGER,
        height INTEGER,
        status TEXT NOT NULL DEFAULT 'active',
        processing_state TEXT
    );
    CREATE INDEX idx_items_type ON items(type);
    CREATE INDEX idx_items_mtime ON items(mtime);

    -- Tokenized names; rowid mirrors items.id and both tables are always
    -- mutated in the same transaction.
    CREATE VIRTUAL TABLE items_fts USING fts5(name);

    -- Per-media thumbnail lifecycle
    CREATE TABLE thumb_status (
        path TEXT PRIMARY KEY,
        mtime INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'processing', 'exists', 'missing', 'failed', 'permanent_failed')),
        last_checked INTEGER
    );
    CREATE INDEX idx_thumb_status_status ON thumb_status(status);

    -- Precomputed representative media per album
    CREATE TABLE album_covers (
        album_path TEXT PRIMARY KEY,
        cover_path TEXT NOT NULL,
        width INTEGER,
        height INTEGER,
        mtime INTEGER NOT NULL DEFAULT 0
    );
    "#,
    ),
];

const INDEX_MIGRATIONS: &[(&str, &str)] = &[
    (
        "001_index_status",
        r#"
    -- Singleton status row maintained by the indexer
    CREATE TABLE index_status (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        status TEXT NOT NULL DEFAULT 'idle'
            CHECK (status IN ('idle', 'building', 'complete', 'pending')),
        processed_files INTEGER NOT NULL DEFAULT 0,
        total_files INTEGER NOT NULL DEFAULT 0,
        last_updated INTEGER NOT NULL DEFAULT 0
    );
    INSERT INTO index_status (id, status) VALUES (1, 'idle');

    -- Key/value progress; 'last_processed_path' is the rebuild resume cursor
    CREATE TABLE index_progress (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    "#,
    ),
];

const SETTINGS_MIGRATIONS: &[(&str, &str)] = &[
    (
        "001_settings",
        r#"
    CREATE TABLE settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    "#,
    ),
];

const HISTORY_MIGRATIONS: &[(&str, &str)] = &[
    (
        "001_view_history",
        r#"
    CREATE TABLE view_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        item_path TEXT NOT NULL,
        viewed_at TEXT NOT NULL DEFAULT (datetime('now'))
    );
    CREATE INDEX idx_view_history_user ON view_history(user_id, viewed_at);
    "#,
    ),
];

fn migrations_for(db: Db) -> &'static [(&'static str, &'static str)] {
    match db {
        Db::Main => MAIN_MIGRATIONS,
        Db::Settings => SETTINGS_MIGRATIONS,
        Db::History => HISTORY_MIGRATIONS,
        Db::Index => INDEX_MIGRATIONS,
    }
}

/// Apply all pending migrations for one logical database (crash-safe: the
/// ledger row commits in the same transaction as the migration body).
pub fn run_migrations(conn: &Connection, db: Db) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
            key TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    for (key, sql) in migrations_for(db) {
        let applied: bool = conn
            .query_row(
                "SELECT 1 FROM migrations WHERE key = ?1",
                [key],
                |_| Ok(true),
            )
            .unwrap_or(false);
        if applied {
            continue;
        }

        conn.execute_batch("BEGIN IMMEDIATE")?;
        match conn
            .execute_batch(sql)
            .and_then(|_| {
                conn.execute("INSERT INTO migrations (key) VALUES (?1)", [key])
                    .map(|_| ())
            }) {
            Ok(()) => {
                conn.execute_batch("COMMIT")?;
                info!("Applied migration {} on {}", key, db.label());
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e.into());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_schema() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn, Db::Main).unwrap();

        // All four catalog tables present
        for table in ["items", "items_fts", "thumb_status", "album_covers"] {
            let found: bool = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE name = ?1",
                    [table],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            assert!(found, "missing table {}", table);
        }

        // Re-run is a no-op
        run_migrations(&conn, Db::Main).unwrap();
    }

    #[test]
    fn test_index_status_seeded() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn, Db::Index).unwrap();

        let status: String = conn
            .query_row("SELECT status FROM index_status WHERE id = 1", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(status, "idle");
    }
}
