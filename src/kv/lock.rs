// Named job locks over the KV facade.
//
// A lock is an atomic set-if-absent with TTL on `lock:job:<name>`. The
// distributed backend is preferred so one acquisition serializes singleton
// jobs across replicas sharing a Redis; the local map covers the
// single-process case. The guard remembers which backend granted it so
// release targets that backend, and release only deletes the key while it
// still holds this owner's token.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use uuid::Uuid;

use crate::constants::JOB_LOCK_PREFIX;
use crate::kv::{Kv, KvBackend};

pub struct JobLock {
    kv: Arc<Kv>,
    owner_prefix: String,
}

pub struct LockGuard {
    kv: Arc<Kv>,
    key: String,
    token: String,
    backend: KvBackend,
    released: bool,
}

impl JobLock {
    pub fn new(kv: Arc<Kv>) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            kv,
            owner_prefix: format!("{}:{}", host, std::process::id()),
        }
    }

    /// Try to take the named lock. Returns None if another holder is live.
    pub fn try_acquire(&self, name: &str, ttl: Duration) -> Option<LockGuard> {
        let key = format!("{}{}", JOB_LOCK_PREFIX, name);
        let token = format!("{}:{}", self.owner_prefix, Uuid::new_v4());

        // Prefer the distributed backend; if the write itself fails, fall
        // back to local rather than refusing the job.
        let preferred = self.kv.backend();
        let (granted, backend) = match self.kv.set_nx_ttl_on(preferred, &key, &token, ttl) {
            Ok(v) => (v, preferred),
            Err(e) if preferred == KvBackend::Distributed => {
                debug!("Distributed lock attempt failed ({}), trying local", e);
                match self.kv.set_nx_ttl_on(KvBackend::Local, &key, &token, ttl) {
                    Ok(v) => (v, KvBackend::Local),
                    Err(e) => {
                        warn!("Local lock attempt failed for {}: {}", name, e);
                        return None;
                    }
                }
            }
            Err(e) => {
                warn!("Lock attempt failed for {}: {}", name, e);
                return None;
            }
        };

        if !granted {
            return None;
        }

        debug!("Acquired {:?} lock {}", backend, key);
        Some(LockGuard {
            kv: Arc::clone(&self.kv),
            key,
            token,
            backend,
            released: false,
        })
    }
}

impl LockGuard {
    pub fn backend(&self) -> KvBackend {
        self.backend
    }

    /// Release early. Verifies the token so an expired-and-reacquired lock
    /// is never deleted out from under the new holder.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match self.kv.get_on(self.backend, &self.key) {
            Ok(Some(held)) if held == self.token => {
                if let Err(e) = self.kv.del_on(self.backend, &self.key) {
                    warn!("Failed to release lock {}: {}", self.key, e);
                }
            }
            Ok(_) => {
                // Expired and possibly re-acquired by someone else.
                debug!("Lock {} no longer held by this owner", self.key);
            }
            Err(e) => warn!("Failed to inspect lock {} on release: {}", self.key, e),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock() -> JobLock {
        JobLock::new(Arc::new(Kv::local_only()))
    }

    #[test]
    fn test_exclusive_while_held() {
        let locks = lock();
        let guard = locks.try_acquire("rebuild", Duration::from_secs(60));
        assert!(guard.is_some());
        assert!(locks.try_acquire("rebuild", Duration::from_secs(60)).is_none());

        // Different name is independent
        assert!(locks.try_acquire("maint", Duration::from_secs(60)).is_some());
    }

    #[test]
    fn test_release_allows_reacquire() {
        let locks = lock();
        let guard = locks.try_acquire("rebuild", Duration::from_secs(60)).unwrap();
        guard.release();
        assert!(locks.try_acquire("rebuild", Duration::from_secs(60)).is_some());
    }

    #[test]
    fn test_drop_releases() {
        let locks = lock();
        {
            let _guard = locks.try_acquire("rebuild", Duration::from_secs(60)).unwrap();
        }
        assert!(locks.try_acquire("rebuild", Duration::from_secs(60)).is_some());
    }

    #[test]
    fn test_ttl_expiry_reacquires() {
        let locks = lock();
        let guard = locks
            .try_acquire("rebuild", Duration::from_millis(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        // Expired: a second holder may acquire, and releasing the stale
        // guard must not delete the new holder's key.
        let second = locks.try_acquire("rebuild", Duration::from_secs(60));
        assert!(second.is_some());
        guard.release();
        assert!(locks.try_acquire("rebuild", Duration::from_secs(60)).is_none());
    }
}
