// Two-tier dimension cache
//
// Probing media is the expensive part of indexing, so results are cached by
// `absolute_path:mtime`. L1 is a small in-process LRU; L2 is the shared KV
// with a TTL, written fire-and-forget so a slow Redis never stalls a batch.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use lru::LruCache;

use crate::constants::{DIM_CACHE_KEY_PREFIX, DIM_CACHE_L1_ENTRIES, DIM_CACHE_TTL_SEC};
use crate::kv::Kv;
use crate::media::{probe_dimensions, Dimensions, ItemKind};

pub struct DimensionCache {
    l1: Mutex<LruCache<String, Dimensions>>,
    kv: Arc<Kv>,
    ttl: Duration,
}

impl DimensionCache {
    pub fn new(kv: Arc<Kv>) -> Self {
        Self {
            l1: Mutex::new(LruCache::new(
                NonZeroUsize::new(DIM_CACHE_L1_ENTRIES).unwrap(),
            )),
            kv,
            ttl: Duration::from_secs(DIM_CACHE_TTL_SEC),
        }
    }

    fn cache_key(path: &Path, mtime_ms: i64) -> String {
        format!("{}:{}", path.display(), mtime_ms)
    }

    /// Look up cached dimensions or probe the file. Probe failures fall
    /// back to a sentinel size so indexing can proceed; the sentinel is not
    /// cached, letting the backfill retry the probe later.
    pub fn get_or_probe(&self, path: &Path, mtime_ms: i64, kind: ItemKind) -> Dimensions {
        let key = Self::cache_key(path, mtime_ms);

        if let Some(dims) = self.l1.lock().unwrap().get(&key).copied() {
            return dims;
        }

        let kv_key = format!("{}{}", DIM_CACHE_KEY_PREFIX, key);
        if let Ok(Some(raw)) = self.kv.get(&kv_key) {
            if let Ok(dims) = serde_json::from_str::<Dimensions>(&raw) {
                self.l1.lock().unwrap().put(key, dims);
                return dims;
            }
        }

        let dims = match probe_dimensions(path, kind) {
            Ok(d) => d,
            Err(e) => {
                warn!("Dimension probe failed, using sentinel: {}", e);
                return Dimensions::sentinel();
            }
        };

        self.l1.lock().unwrap().put(key, dims);

        // Fire-and-forget on the write path
        if let Ok(raw) = serde_json::to_string(&dims) {
            if let Err(e) = self.kv.set_ttl(&kv_key, &raw, self.ttl) {
                debug!("Dimension cache L2 write failed: {}", e);
            }
        }

        dims
    }
}
