// Idle-window detection
//
// Background jobs only run when the box has headroom. A window is non-idle
// when the indexer is building (or has a resume cursor waiting), when load
// or memory is over budget, or when foreground thumbnail demand is high.
// The verdict is cached for a short TTL because several jobs poll it.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::debug;
use sysinfo::System;

use crate::config::SchedulerConfig;
use crate::db::{CatalogStore, Db};
use crate::thumbs::ThumbDemand;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusyReason {
    IndexBuilding,
    ResumeCursorPresent,
    LoadOverBudget,
    MemoryOverBudget,
    ThumbDemand,
}

#[derive(Debug, Clone)]
struct CachedVerdict {
    at: Instant,
    busy: Option<BusyReason>,
}

pub struct IdleMonitor {
    store: Arc<CatalogStore>,
    thumb_demand: Arc<ThumbDemand>,
    sys: Mutex<System>,
    cached: Mutex<Option<CachedVerdict>>,
    cfg: SchedulerConfig,
    cores: usize,
}

impl IdleMonitor {
    pub fn new(
        store: Arc<CatalogStore>,
        thumb_demand: Arc<ThumbDemand>,
        cfg: SchedulerConfig,
    ) -> Arc<Self> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Arc::new(Self {
            store,
            thumb_demand,
            sys: Mutex::new(System::new()),
            cached: Mutex::new(None),
            cfg,
            cores,
        })
    }

    pub fn is_idle(&self) -> bool {
        self.busy_reason().is_none()
    }

    /// Why the window is busy, or None when idle. Cached for the TTL.
    pub fn busy_reason(&self) -> Option<BusyReason> {
        {
            let cached = self.cached.lock().unwrap();
            if let Some(v) = cached.as_ref() {
                if v.at.elapsed() < self.cfg.idle_cache_ttl {
                    return v.busy.clone();
                }
            }
        }

        let busy = self.compute();
        *self.cached.lock().unwrap() = Some(CachedVerdict {
            at: Instant::now(),
            busy: busy.clone(),
        });
        busy
    }

    /// Drop the cached verdict; used when a job just changed index state.
    pub fn invalidate(&self) {
        *self.cached.lock().unwrap() = None;
    }

    fn compute(&self) -> Option<BusyReason> {
        // Index state first: a running rebuild owns the I/O budget.
        let status = self
            .store
            .get(
                Db::Index,
                "SELECT status FROM index_status WHERE id = 1",
                &[],
                |r| r.get::<_, String>(0),
            )
            .ok()
            .flatten();
        if status.as_deref() == Some("building") {
            return Some(BusyReason::IndexBuilding);
        }

        let cursor = self
            .store
            .get(
                Db::Index,
                "SELECT value FROM index_progress WHERE key = 'last_processed_path'",
                &[],
                |r| r.get::<_, String>(0),
            )
            .ok()
            .flatten();
        if cursor.is_some() {
            return Some(BusyReason::ResumeCursorPresent);
        }

        if self.thumb_demand.level() >= self.cfg.thumb_demand_threshold {
            return Some(BusyReason::ThumbDemand);
        }

        let load = System::load_average().one;
        if load > self.cfg.load_per_core * self.cores as f64 {
            debug!("Busy: load {} over budget ({} cores)", load, self.cores);
            return Some(BusyReason::LoadOverBudget);
        }

        {
            let mut sys = self.sys.lock().unwrap();
            sys.refresh_memory();
            let total = sys.total_memory();
            if total > 0 {
                let used_fraction = 1.0 - sys.available_memory() as f64 / total as f64;
                if used_fraction > self.cfg.memory_budget_fraction {
                    debug!("Busy: memory {:.0}% used", used_fraction * 100.0);
                    return Some(BusyReason::MemoryOverBudget);
                }
            }
        }

        None
    }

    /// Block until the idle window opens or `max_wait` elapses; returns true
    /// if the window opened. After `max_wait` the caller proceeds anyway so
    /// starved maintenance still happens eventually.
    pub fn gate(&self, kind: &str, max_wait: Duration, check_interval: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            match self.busy_reason() {
                None => return true,
                Some(reason) => {
                    if Instant::now() >= deadline {
                        debug!(
                            "Admission gate '{}' timed out while {:?}, proceeding",
                            kind, reason
                        );
                        return false;
                    }
                    debug!("Admission gate '{}' waiting: {:?}", kind, reason);
                    std::thread::sleep(check_interval.min(deadline - Instant::now()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_store;

    fn relaxed_cfg() -> SchedulerConfig {
        // Thresholds the test host can always satisfy, so only catalog and
        // demand inputs decide the verdict.
        SchedulerConfig {
            idle_cache_ttl: Duration::from_millis(0),
            load_per_core: f64::MAX,
            memory_budget_fraction: 1.1,
            thumb_demand_threshold: 4,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn test_idle_when_quiet() {
        let (_dir, store) = test_store();
        let monitor = IdleMonitor::new(Arc::new(store), ThumbDemand::new(), relaxed_cfg());
        assert!(monitor.is_idle());
    }

    #[test]
    fn test_building_status_is_busy() {
        let (_dir, store) = test_store();
        store
            .run(
                Db::Index,
                "UPDATE index_status SET status = 'building' WHERE id = 1",
                &[],
            )
            .unwrap();
        let monitor = IdleMonitor::new(Arc::new(store), ThumbDemand::new(), relaxed_cfg());
        assert_eq!(monitor.busy_reason(), Some(BusyReason::IndexBuilding));
    }

    #[test]
    fn test_resume_cursor_is_busy() {
        let (_dir, store) = test_store();
        store
            .run(
                Db::Index,
                "INSERT INTO index_progress (key, value) VALUES ('last_processed_path', 'a/b')",
                &[],
            )
            .unwrap();
        let monitor = IdleMonitor::new(Arc::new(store), ThumbDemand::new(), relaxed_cfg());
        assert_eq!(monitor.busy_reason(), Some(BusyReason::ResumeCursorPresent));
    }

    #[test]
    fn test_thumb_demand_is_busy_and_gate_times_out() {
        let (_dir, store) = test_store();
        let demand = ThumbDemand::new();
        for _ in 0..5 {
            demand.enqueue();
        }
        let monitor = IdleMonitor::new(Arc::new(store), Arc::clone(&demand), relaxed_cfg());
        assert_eq!(monitor.busy_reason(), Some(BusyReason::ThumbDemand));

        // Gate must return (false) once max_wait elapses.
        let opened = monitor.gate(
            "test",
            Duration::from_millis(30),
            Duration::from_millis(10),
        );
        assert!(!opened);

        // Demand drains: window opens.
        for _ in 0..5 {
            demand.start();
            demand.finish();
        }
        assert!(monitor.is_idle());
    }
}
