// Distributed KV facade
//
// The server prefers a shared Redis for job locks, the indexing flag, the
// dimension cache L2, and the browse route cache. Every operation must
// tolerate Redis being down: the facade flips to the in-process expiring map
// and re-probes the backend on an interval.

pub mod local;
pub mod lock;

pub use lock::{JobLock, LockGuard};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use redis::Commands;

use crate::constants::KV_PROBE_INTERVAL_MS;
use crate::error::{Result, ShoeboxError};
use local::LocalKv;

/// Which backend served an operation. Lock guards remember this so release
/// targets the backend that granted them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvBackend {
    Distributed,
    Local,
}

/// Minimal KV surface shared by both backends.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    /// Atomic set-if-absent with TTL. Returns true when the key was set.
    fn set_nx_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
    fn del(&self, key: &str) -> Result<()>;
    /// Delete every key matching a glob pattern; returns how many went.
    fn del_matching(&self, pattern: &str) -> Result<usize>;
    fn ping(&self) -> bool;
}

// --- Redis backend ----------------------------------------------------------

pub struct RedisKv {
    client: redis::Client,
    conn: Mutex<Option<redis::Connection>>,
}

impl RedisKv {
    pub fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| ShoeboxError::External(format!("redis client: {}", e)))?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    /// Run `f` against a cached connection, dropping it on error so the next
    /// call reconnects.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T> {
        let mut guard = self.conn.lock().unwrap();
        if guard.is_none() {
            let conn = self
                .client
                .get_connection_with_timeout(Duration::from_secs(2))
                .map_err(|e| ShoeboxError::External(format!("redis connect: {}", e)))?;
            *guard = Some(conn);
        }

        match f(guard.as_mut().unwrap()) {
            Ok(v) => Ok(v),
            Err(e) => {
                *guard = None;
                Err(ShoeboxError::External(format!("redis: {}", e)))
            }
        }
    }
}

impl KvStore for RedisKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|c| c.get(key))
    }

    fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.with_conn(|c| c.set_ex(key, value, ttl.as_secs().max(1)))
    }

    fn set_nx_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        // SET key value NX EX ttl -- single round trip, atomic.
        self.with_conn(|c| {
            let result: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs().max(1))
                .query(c)?;
            Ok(result.is_some())
        })
    }

    fn del(&self, key: &str) -> Result<()> {
        self.with_conn(|c| c.del(key))
    }

    fn del_matching(&self, pattern: &str) -> Result<usize> {
        self.with_conn(|c| {
            let keys: Vec<String> = c.keys(pattern)?;
            let count = keys.len();
            if !keys.is_empty() {
                c.del::<_, ()>(keys)?;
            }
            Ok(count)
        })
    }

    fn ping(&self) -> bool {
        self.with_conn(|c| redis::cmd("PING").query::<String>(c)).is_ok()
    }
}

// --- Facade -----------------------------------------------------------------

pub struct Kv {
    redis: Option<RedisKv>,
    local: LocalKv,
    redis_ok: AtomicBool,
    last_probe: Mutex<Instant>,
    probe_interval: Duration,
}

impl Kv {
    /// Local-only handle (no Redis configured).
    pub fn local_only() -> Self {
        Self {
            redis: None,
            local: LocalKv::new(),
            redis_ok: AtomicBool::new(false),
            last_probe: Mutex::new(Instant::now()),
            probe_interval: Duration::from_millis(KV_PROBE_INTERVAL_MS),
        }
    }

    /// Handle backed by Redis when reachable, the local map otherwise.
    pub fn with_redis(url: &str) -> Self {
        let redis = match RedisKv::connect(url) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("Redis unavailable, running in local mode: {}", e);
                None
            }
        };

        let kv = Self {
            redis,
            local: LocalKv::new(),
            redis_ok: AtomicBool::new(false),
            last_probe: Mutex::new(Instant::now()),
            probe_interval: Duration::from_millis(KV_PROBE_INTERVAL_MS),
        };
        kv.probe();
        kv
    }

    /// Probe Redis liveness, at most once per probe interval unless forced
    /// by a fresh failure.
    pub fn probe(&self) -> bool {
        let Some(ref redis) = self.redis else {
            return false;
        };

        let ok = redis.ping();
        let was_ok = self.redis_ok.swap(ok, Ordering::Relaxed);
        if ok && !was_ok {
            info!("Distributed KV available");
        } else if !ok && was_ok {
            warn!("Distributed KV lost, degrading to local mode");
        }
        *self.last_probe.lock().unwrap() = Instant::now();
        ok
    }

    fn maybe_reprobe(&self) {
        let due = {
            let last = self.last_probe.lock().unwrap();
            last.elapsed() >= self.probe_interval
        };
        if due {
            self.probe();
        }
    }

    pub fn distributed_available(&self) -> bool {
        self.maybe_reprobe();
        self.redis.is_some() && self.redis_ok.load(Ordering::Relaxed)
    }

    pub fn backend(&self) -> KvBackend {
        if self.distributed_available() {
            KvBackend::Distributed
        } else {
            KvBackend::Local
        }
    }

    pub fn local(&self) -> &LocalKv {
        &self.local
    }

    fn store_for(&self, backend: KvBackend) -> &dyn KvStore {
        match backend {
            KvBackend::Distributed => self.redis.as_ref().unwrap(),
            KvBackend::Local => &self.local,
        }
    }

    /// Run `op` on the preferred backend; on an External failure, mark the
    /// distributed side unhealthy and rerun on the local map.
    fn degrade<T>(&self, op: impl Fn(&dyn KvStore) -> Result<T>) -> Result<T> {
        if self.distributed_available() {
            match op(self.store_for(KvBackend::Distributed)) {
                Ok(v) => return Ok(v),
                Err(e) => {
                    debug!("Distributed KV call failed, degrading: {}", e);
                    self.redis_ok.store(false, Ordering::Relaxed);
                }
            }
        }
        op(&self.local)
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.degrade(|s| s.get(key))
    }

    pub fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.degrade(|s| s.set_ttl(key, value, ttl))
    }

    pub fn del(&self, key: &str) -> Result<()> {
        self.degrade(|s| s.del(key))
    }

    pub fn del_matching(&self, pattern: &str) -> Result<usize> {
        self.degrade(|s| s.del_matching(pattern))
    }

    /// set-if-absent on a specific backend; the lock layer picks the backend
    /// and remembers it.
    pub fn set_nx_ttl_on(
        &self,
        backend: KvBackend,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        self.store_for(backend).set_nx_ttl(key, value, ttl)
    }

    pub fn get_on(&self, backend: KvBackend, key: &str) -> Result<Option<String>> {
        self.store_for(backend).get(key)
    }

    pub fn del_on(&self, backend: KvBackend, key: &str) -> Result<()> {
        self.store_for(backend).del(key)
    }
}

pub type SharedKv = Arc<Kv>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_only_roundtrip() {
        let kv = Kv::local_only();
        assert!(!kv.distributed_available());
        assert_eq!(kv.backend(), KvBackend::Local);

        kv.set_ttl("k", "v", Duration::from_secs(60)).unwrap();
        assert_eq!(kv.get("k").unwrap().as_deref(), Some("v"));

        kv.del("k").unwrap();
        assert_eq!(kv.get("k").unwrap(), None);
    }

    #[test]
    fn test_unreachable_redis_degrades_to_local() {
        // Nothing listens on this port; the facade must fall back silently.
        let kv = Kv::with_redis("redis://127.0.0.1:1/");
        assert!(!kv.distributed_available());

        kv.set_ttl("k", "v", Duration::from_secs(60)).unwrap();
        assert_eq!(kv.get("k").unwrap().as_deref(), Some("v"));
    }
}
