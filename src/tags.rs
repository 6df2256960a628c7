// Cache-tag invalidation
//
// Browse responses are cached in the KV under `route:browse:<album-path>`.
// After a catalog mutation the affected album chain is invalidated
// fine-grained; very large tag sets degrade to one coarse purge of the
// whole browse cache, which is cheaper than thousands of deletes.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::constants::{ROUTE_CACHE_PREFIX, TAG_INVALIDATION_BASE_CAP};
use crate::kv::Kv;

pub struct TagInvalidator {
    kv: Arc<Kv>,
}

impl TagInvalidator {
    pub fn new(kv: Arc<Kv>) -> Self {
        Self { kv }
    }

    /// Route-cache key for an `album:/...` tag.
    fn route_key(tag: &str) -> Option<String> {
        tag.strip_prefix("album:")
            .map(|path| format!("{}{}", ROUTE_CACHE_PREFIX, path))
    }

    /// Cap grows with the pending change count: a drain that touched many
    /// paths legitimately produces a bigger tag set before coarse purging
    /// becomes the better deal.
    fn cap_for(pending_count: usize) -> usize {
        TAG_INVALIDATION_BASE_CAP + pending_count / 16
    }

    pub fn invalidate(&self, tags: &BTreeSet<String>, pending_count: usize) {
        if tags.is_empty() {
            return;
        }

        let cap = Self::cap_for(pending_count);
        if tags.len() > cap {
            info!(
                "Tag set of {} exceeds cap {}, purging browse cache",
                tags.len(),
                cap
            );
            match self.kv.del_matching(&format!("{}*", ROUTE_CACHE_PREFIX)) {
                Ok(n) => debug!("Purged {} browse cache keys", n),
                Err(e) => warn!("Browse cache purge failed: {}", e),
            }
            return;
        }

        let mut deleted = 0usize;
        for tag in tags {
            let Some(key) = Self::route_key(tag) else {
                continue;
            };
            match self.kv.del(&key) {
                Ok(()) => deleted += 1,
                Err(e) => {
                    // KV troubles are non-fatal; stale cache entries expire
                    // on their own TTL.
                    debug!("Tag invalidation failed for {}: {}", tag, e);
                }
            }
        }
        debug!("Invalidated {} album tags", deleted);
    }
}
