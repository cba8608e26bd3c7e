// src/stats.rs

use crate::governor::{ConcurrencyState, ResourceGovernor};
use crate::memory::as_mib;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Outcome of one pass over the URL list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundResult {
    pub round_number: u64,
    pub attempted: usize,
    pub succeeded: usize,
    pub bytes_transferred: u64,
    pub duration: Duration,
    /// The round never dispatched because memory stayed above the ceiling.
    pub skipped: bool,
}

impl RoundResult {
    pub fn skipped(round_number: u64) -> Self {
        Self {
            round_number,
            attempted: 0,
            succeeded: 0,
            bytes_transferred: 0,
            duration: Duration::ZERO,
            skipped: true,
        }
    }
}

#[derive(Debug, Default)]
struct Totals {
    total_bytes: u64,
    rounds_completed: u64,
    rounds_skipped: u64,
    tasks_attempted: u64,
    tasks_succeeded: u64,
}

/// Run-wide totals. Bytes arrive per finished download, counts per recorded round.
pub struct Aggregator {
    totals: Mutex<Totals>,
    started: Instant,
    concurrency: Arc<ConcurrencyState>,
    governor: Arc<ResourceGovernor>,
}

impl Aggregator {
    /// Starts the run clock at zero bytes.
    pub fn new(concurrency: Arc<ConcurrencyState>, governor: Arc<ResourceGovernor>) -> Self {
        Self {
            totals: Mutex::new(Totals::default()),
            started: Instant::now(),
            concurrency,
            governor,
        }
    }

    /// Adds the body size of one finished download, whether or not its round is recorded.
    pub async fn add_bytes(&self, bytes: u64) {
        self.totals.lock().await.total_bytes += bytes;
    }

    /// Counts a finished or skipped round. Its bytes were already added by `add_bytes`.
    pub async fn record(&self, round: &RoundResult) {
        let mut totals = self.totals.lock().await;
        if round.skipped {
            totals.rounds_skipped += 1;
            return;
        }
        totals.rounds_completed += 1;
        totals.tasks_attempted += round.attempted as u64;
        totals.tasks_succeeded += round.succeeded as u64;
    }

    /// Computed fresh on every call.
    pub async fn snapshot(&self) -> Snapshot {
        let totals = self.totals.lock().await;
        let elapsed = self.started.elapsed().as_secs_f64();
        let total_mb = as_mib(totals.total_bytes);
        let avg_mbps = if elapsed > 0.0 { total_mb / elapsed } else { 0.0 };

        Snapshot {
            elapsed_secs: elapsed,
            total_bytes: totals.total_bytes,
            total_mb,
            avg_mbps,
            memory_mb: self.governor.memory_usage().map(as_mib),
            max_memory_mb: as_mib(self.governor.max_memory_bytes()),
            active_downloads: self.concurrency.active(),
            max_concurrency: self.concurrency.effective_max(),
            rounds_completed: totals.rounds_completed,
            rounds_skipped: totals.rounds_skipped,
            tasks_attempted: totals.tasks_attempted,
            tasks_succeeded: totals.tasks_succeeded,
        }
    }
}

/// Point-in-time view of the run for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub elapsed_secs: f64,
    pub total_bytes: u64,
    pub total_mb: f64,
    /// MB per second averaged over the whole run.
    pub avg_mbps: f64,
    pub memory_mb: Option<f64>,
    pub max_memory_mb: f64,
    pub active_downloads: usize,
    pub max_concurrency: usize,
    pub rounds_completed: u64,
    pub rounds_skipped: u64,
    pub tasks_attempted: u64,
    pub tasks_succeeded: u64,
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Statistics:")?;
        writeln!(f, "   elapsed:    {:.1} s", self.elapsed_secs)?;
        writeln!(f, "   downloaded: {:.2} MB", self.total_mb)?;
        writeln!(f, "   avg speed:  {:.2} MB/s", self.avg_mbps)?;
        match self.memory_mb {
            Some(memory) => writeln!(f, "   memory:     {:.1} MB / {:.0} MB", memory, self.max_memory_mb)?,
            None => writeln!(f, "   memory:     unknown / {:.0} MB", self.max_memory_mb)?,
        }
        writeln!(f, "   rounds:     {} completed, {} skipped", self.rounds_completed, self.rounds_skipped)?;
        writeln!(f, "   downloads:  {}/{} succeeded", self.tasks_succeeded, self.tasks_attempted)?;
        write!(f, "   active:     {}/{}", self.active_downloads, self.max_concurrency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryMonitor, MIB};
    use crate::shutdown::Shutdown;

    struct Steady;

    impl MemoryMonitor for Steady {
        fn current_usage(&self) -> Option<u64> {
            Some(20 * MIB)
        }
        fn available_system_memory(&self) -> Option<u64> {
            Some(1024 * MIB)
        }
    }

    fn aggregator() -> Aggregator {
        let governor = Arc::new(ResourceGovernor::new(Arc::new(Steady), 100 * MIB, Shutdown::new()));
        Aggregator::new(Arc::new(ConcurrencyState::new(4)), governor)
    }

    async fn finish(stats: &Aggregator, round: RoundResult) {
        stats.add_bytes(round.bytes_transferred).await;
        stats.record(&round).await;
    }

    fn round(number: u64, attempted: usize, succeeded: usize, bytes: u64) -> RoundResult {
        RoundResult {
            round_number: number,
            attempted,
            succeeded,
            bytes_transferred: bytes,
            duration: Duration::from_millis(10),
            skipped: false,
        }
    }

    #[tokio::test]
    async fn record_accumulates_rounds() {
        let stats = aggregator();
        finish(&stats, round(1, 3, 2, 2 * MIB)).await;
        finish(&stats, round(2, 3, 3, MIB)).await;
        stats.record(&RoundResult::skipped(3)).await;

        let snap = stats.snapshot().await;
        assert_eq!(snap.total_bytes, 3 * MIB);
        assert_eq!(snap.total_mb, 3.0);
        assert_eq!(snap.rounds_completed, 2);
        assert_eq!(snap.rounds_skipped, 1);
        assert_eq!(snap.tasks_attempted, 6);
        assert_eq!(snap.tasks_succeeded, 5);
        assert_eq!(snap.memory_mb, Some(20.0));
        assert_eq!(snap.max_concurrency, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn average_speed_uses_run_clock() {
        let stats = aggregator();
        tokio::time::sleep(Duration::from_secs(4)).await;
        finish(&stats, round(1, 1, 1, 8 * MIB)).await;
        let snap = stats.snapshot().await;
        assert!((snap.avg_mbps - 2.0).abs() < 1e-6, "{}", snap.avg_mbps);
    }

    #[tokio::test]
    async fn report_mentions_every_figure() {
        let stats = aggregator();
        finish(&stats, round(1, 2, 1, MIB)).await;
        let text = stats.snapshot().await.to_string();
        assert!(text.contains("1.00 MB"));
        assert!(text.contains("20.0 MB / 100 MB"));
        assert!(text.contains("1/2 succeeded"));
        assert!(text.contains("0/4"));
    }

    #[tokio::test]
    async fn bytes_count_without_a_recorded_round() {
        let stats = aggregator();
        stats.add_bytes(4096).await;
        stats.add_bytes(1024).await;

        let snap = stats.snapshot().await;
        assert_eq!(snap.total_bytes, 5120);
        assert_eq!(snap.rounds_completed, 0);
        assert_eq!(snap.tasks_attempted, 0);
    }
}
