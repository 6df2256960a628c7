// Health snapshot
//
// The HTTP layer turns this into a 200/503: `ok` is false when a required
// dependency is degraded. The distributed KV and ffprobe are optional by
// design (the catalog degrades to local mode and sentinel video
// dimensions), so their absence is reported but never flips `ok` on its
// own.

use std::sync::Arc;

use serde::Serialize;

use crate::db::{CatalogStore, Db};
use crate::index::Indexer;
use crate::kv::Kv;

#[derive(Debug, Clone, Serialize)]
pub struct HealthIssue {
    pub code: &'static str,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub ok: bool,
    pub issues: Vec<HealthIssue>,
}

pub fn check(
    store: &Arc<CatalogStore>,
    kv: &Arc<Kv>,
    indexer: &Indexer,
    redis_configured: bool,
) -> HealthReport {
    let mut issues = Vec::new();
    let mut ok = true;

    for db in Db::ALL {
        if !store.ping(db) {
            ok = false;
            issues.push(HealthIssue {
                code: "database_connections",
                detail: format!("{} database not responding", db.label()),
            });
        }
    }

    match store.has_table(Db::Main, "items") {
        Ok(true) => {}
        _ => {
            ok = false;
            issues.push(HealthIssue {
                code: "items_table",
                detail: "items table missing".to_string(),
            });
        }
    }
    match store.has_table(Db::Main, "items_fts") {
        Ok(true) => {}
        _ => {
            ok = false;
            issues.push(HealthIssue {
                code: "items_fts_table",
                detail: "items_fts table missing".to_string(),
            });
        }
    }

    if redis_configured && !kv.distributed_available() {
        issues.push(HealthIssue {
            code: "redis_unavailable",
            detail: "distributed KV unreachable, running in local mode".to_string(),
        });
    }

    if !crate::media::ffprobe_available() {
        issues.push(HealthIssue {
            code: "ffprobe_missing",
            detail: "ffprobe not found; videos index with sentinel dimensions".to_string(),
        });
    }

    if !indexer.is_alive() {
        ok = false;
        issues.push(HealthIssue {
            code: "worker_indexing",
            detail: "indexing worker exited".to_string(),
        });
    }

    HealthReport { ok, issues }
}
