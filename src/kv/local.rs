// In-process KV fallback: expiring map with an opportunistic sweep.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::kv::KvStore;

const SWEEP_EVERY: u32 = 64;

struct Entry {
    value: String,
    expires_at: Instant,
}

pub struct LocalKv {
    map: Mutex<HashMap<String, Entry>>,
    writes: Mutex<u32>,
}

impl LocalKv {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            writes: Mutex::new(0),
        }
    }

    /// Every N writes, drop expired entries so an idle key set does not
    /// grow without bound.
    fn maybe_sweep(&self, map: &mut HashMap<String, Entry>) {
        let mut writes = self.writes.lock().unwrap();
        *writes += 1;
        if *writes >= SWEEP_EVERY {
            *writes = 0;
            let now = Instant::now();
            map.retain(|_, e| e.expires_at > now);
        }
    }

    /// Glob match supporting a single trailing `*`, which is all the route
    /// cache and dimension cache patterns use.
    fn glob_match(pattern: &str, key: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == pattern,
        }
    }
}

impl Default for LocalKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for LocalKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut map = self.map.lock().unwrap();
        match map.get(key) {
            Some(e) if e.expires_at > Instant::now() => Ok(Some(e.value.clone())),
            Some(_) => {
                map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut map = self.map.lock().unwrap();
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        self.maybe_sweep(&mut map);
        Ok(())
    }

    fn set_nx_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut map = self.map.lock().unwrap();
        let now = Instant::now();

        let live = map.get(key).map(|e| e.expires_at > now).unwrap_or(false);
        if live {
            return Ok(false);
        }

        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        self.maybe_sweep(&mut map);
        Ok(true)
    }

    fn del(&self, key: &str) -> Result<()> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    fn del_matching(&self, pattern: &str) -> Result<usize> {
        let mut map = self.map.lock().unwrap();
        let before = map.len();
        map.retain(|k, _| !Self::glob_match(pattern, k));
        Ok(before - map.len())
    }

    fn ping(&self) -> bool {
        true
    }
}
