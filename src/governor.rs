// src/governor.rs

use crate::memory::{as_mib, MemoryMonitor, MIB};
use crate::shutdown::Shutdown;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// Cadence at which `await_safe` re-samples memory.
const SAFETY_POLL: Duration = Duration::from_secs(1);

/// Turns memory readings into admission decisions and a concurrency ceiling.
///
/// Unreadable memory is treated as safe: the governor never blocks the run
/// because monitoring failed. The first failure is logged once.
pub struct ResourceGovernor {
    monitor: Arc<dyn MemoryMonitor>,
    max_memory_bytes: u64,
    shutdown: Shutdown,
    read_failure_reported: AtomicBool,
}

impl ResourceGovernor {
    pub fn new(monitor: Arc<dyn MemoryMonitor>, max_memory_bytes: u64, shutdown: Shutdown) -> Self {
        Self {
            monitor,
            max_memory_bytes,
            shutdown,
            read_failure_reported: AtomicBool::new(false),
        }
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_bytes
    }

    /// Concurrency that fits the free memory: one download per 100 MiB available,
    /// clamped to `1..=hard_cap`, then capped by `base_limit`.
    pub fn initial_concurrency(&self, base_limit: usize, hard_cap: usize) -> usize {
        let hard_cap = hard_cap.max(1);
        let base_limit = base_limit.max(1);

        match self.monitor.available_system_memory() {
            Some(available) => {
                let available_mib = available as f64 / MIB as f64;
                let by_memory = (available_mib * 0.1 / 10.0).floor() as usize;
                let concurrency = by_memory.clamp(1, hard_cap).min(base_limit);
                tracing::info!(
                    "available memory {:.1} MB, max concurrency set to {}",
                    available_mib,
                    concurrency
                );
                concurrency
            }
            None => {
                let concurrency = base_limit.min(hard_cap);
                tracing::warn!(
                    "cannot read available memory, using default concurrency {}",
                    concurrency
                );
                concurrency
            }
        }
    }

    /// Current process memory, if it can be read.
    pub fn memory_usage(&self) -> Option<u64> {
        let usage = self.monitor.current_usage();
        if usage.is_none() && !self.read_failure_reported.swap(true, Ordering::Relaxed) {
            tracing::warn!("cannot read process memory, memory ceiling is not enforced");
        }
        usage
    }

    /// True while process memory stays below the ceiling (or cannot be read).
    pub fn is_safe(&self) -> bool {
        match self.memory_usage() {
            Some(usage) => usage < self.max_memory_bytes,
            None => true,
        }
    }

    /// True when usage is above `fraction` of the ceiling.
    pub fn is_under_pressure(&self, fraction: f64) -> bool {
        match self.memory_usage() {
            Some(usage) => usage as f64 > self.max_memory_bytes as f64 * fraction,
            None => false,
        }
    }

    /// Waits, polling once a second, until memory is safe or `timeout` passes.
    /// Returns false straight away once a stop has been requested.
    pub async fn await_safe(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        while !self.shutdown.should_stop() && started.elapsed() < timeout {
            if self.is_safe() {
                return true;
            }
            if let Some(usage) = self.memory_usage() {
                tracing::warn!("memory usage too high ({:.1} MB), waiting for release", as_mib(usage));
            }
            tokio::select! {
                _ = tokio::time::sleep(SAFETY_POLL) => {}
                _ = self.shutdown.stopped() => {}
            }
        }
        if self.shutdown.should_stop() {
            return false;
        }
        self.is_safe()
    }
}

/// Ceiling and live count of downloads past the admission gate.
#[derive(Debug, Default)]
pub struct ConcurrencyState {
    effective_max: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyState {
    pub fn new(effective_max: usize) -> Self {
        Self {
            effective_max: AtomicUsize::new(effective_max),
            ..Self::default()
        }
    }

    pub fn effective_max(&self) -> usize {
        self.effective_max.load(Ordering::SeqCst)
    }

    pub fn set_effective_max(&self, effective_max: usize) {
        self.effective_max.store(effective_max, Ordering::SeqCst);
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously active downloads seen so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Marks one download active until the returned guard is dropped.
    pub fn enter(self: &Arc<Self>) -> ActiveGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ActiveGuard {
            state: Arc::clone(self),
        }
    }
}

#[derive(Debug)]
pub struct ActiveGuard {
    state: Arc<ConcurrencyState>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::SeqCst);
    }
}
