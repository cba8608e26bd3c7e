// src/scheduler.rs

use crate::config::{RateSplit, TrafficConfig};
use crate::downloader::{DownloadError, Downloader};
use crate::governor::{ConcurrencyState, ResourceGovernor};
use crate::limiter::per_download_rate;
use crate::memory::{as_mib, MemoryMonitor};
use crate::shutdown::Shutdown;
use crate::stats::{Aggregator, RoundResult, Snapshot};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Granularity of the inter-round sleep; the stop flag is re-checked this often.
const SLEEP_TICK: Duration = Duration::from_secs(1);
/// Ticks between memory checks while sleeping.
const PRESSURE_CHECK_EVERY: u64 = 5;
/// Share of the memory ceiling that counts as high usage between rounds.
const PRESSURE_FRACTION: f64 = 0.8;

/// Progress notifications published while the run is going.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    RoundStarted {
        round: u64,
        concurrency: usize,
        rate_limit: u64,
    },
    RoundFinished {
        result: RoundResult,
        snapshot: Snapshot,
    },
    /// Memory stayed above the ceiling for the whole wait.
    RoundSkipped { round: u64, snapshot: Snapshot },
    /// A stop arrived while downloads were in flight; the round is not recorded.
    RoundInterrupted { round: u64 },
}

/// Final figures of a run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub rounds_completed: u64,
    pub rounds_skipped: u64,
    pub snapshot: Snapshot,
}

enum RoundOutcome {
    Completed(RoundResult),
    Skipped,
    Interrupted,
    /// Stop requested before anything was dispatched.
    Stopped,
}

/// Runs rounds of downloads over the URL list until stopped or `repeat_count` is reached.
pub struct TrafficScheduler {
    config: TrafficConfig,
    downloader: Arc<Downloader>,
    governor: Arc<ResourceGovernor>,
    concurrency: Arc<ConcurrencyState>,
    shutdown: Shutdown,
    startup_concurrency: usize,
    progress_tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl TrafficScheduler {
    pub fn new(
        config: TrafficConfig,
        transport: Arc<dyn Transport>,
        monitor: Arc<dyn MemoryMonitor>,
        shutdown: Shutdown,
    ) -> Self {
        let governor = Arc::new(ResourceGovernor::new(
            monitor,
            config.max_memory_bytes,
            shutdown.clone(),
        ));
        let startup_concurrency =
            governor.initial_concurrency(config.base_max_concurrency, config.concurrency_hard_cap);
        let concurrency = Arc::new(ConcurrencyState::new(startup_concurrency));
        let downloader = Arc::new(Downloader::new(
            transport,
            governor.clone(),
            concurrency.clone(),
            shutdown.clone(),
            config.chunk_len(),
            config.request_timeout,
        ));

        Self {
            config,
            downloader,
            governor,
            concurrency,
            shutdown,
            startup_concurrency,
            progress_tx: None,
        }
    }

    /// Publishes `ProgressEvent`s on `tx` as the run goes.
    pub fn with_progress(mut self, tx: mpsc::Sender<ProgressEvent>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    pub fn effective_max_concurrency(&self) -> usize {
        self.concurrency.effective_max()
    }

    pub fn concurrency(&self) -> Arc<ConcurrencyState> {
        self.concurrency.clone()
    }

    pub async fn run(&self, urls: &[String]) -> RunSummary {
        let stats = Aggregator::new(self.concurrency.clone(), self.governor.clone());
        let mut round = 0u64;

        while !self.shutdown.should_stop() && !self.repeats_done(round) {
            round += 1;
            tracing::info!("--- round {} starting ---", round);

            match self.run_round(round, urls, &stats).await {
                RoundOutcome::Completed(result) => {
                    tracing::info!(
                        "round {} finished: {}/{} downloads, {:.2} MB in {:.1} s",
                        result.round_number,
                        result.succeeded,
                        result.attempted,
                        as_mib(result.bytes_transferred),
                        result.duration.as_secs_f64()
                    );
                    stats.record(&result).await;
                    let snapshot = stats.snapshot().await;
                    self.publish(ProgressEvent::RoundFinished { result, snapshot }).await;
                }
                RoundOutcome::Skipped => {
                    stats.record(&RoundResult::skipped(round)).await;
                    let snapshot = stats.snapshot().await;
                    self.publish(ProgressEvent::RoundSkipped { round, snapshot }).await;
                }
                RoundOutcome::Interrupted => {
                    tracing::info!("round {} interrupted by stop request, not recorded", round);
                    self.publish(ProgressEvent::RoundInterrupted { round }).await;
                    break;
                }
                RoundOutcome::Stopped => break,
            }

            if self.shutdown.should_stop() || self.repeats_done(round) {
                break;
            }
            self.pause_between_rounds().await;
        }

        let snapshot = stats.snapshot().await;
        RunSummary {
            rounds_completed: snapshot.rounds_completed,
            rounds_skipped: snapshot.rounds_skipped,
            snapshot,
        }
    }

    fn repeats_done(&self, rounds: u64) -> bool {
        self.config.repeat_count.is_some_and(|limit| rounds >= limit)
    }

    async fn run_round(&self, round: u64, urls: &[String], stats: &Aggregator) -> RoundOutcome {
        if !self.governor.is_safe() {
            tracing::warn!("memory usage too high, waiting for release before round {}", round);
            if !self.governor.await_safe(self.config.memory_wait_timeout).await {
                if self.shutdown.should_stop() {
                    return RoundOutcome::Stopped;
                }
                tracing::warn!(
                    "memory did not drop within {} s, skipping round {}",
                    self.config.memory_wait_timeout.as_secs(),
                    round
                );
                return RoundOutcome::Skipped;
            }
        }

        let concurrency = self.round_concurrency();
        self.concurrency.set_effective_max(concurrency);
        let workers = concurrency.min(urls.len()).max(1);
        let rate_limit = per_download_rate(
            self.config.per_download_rate_limit,
            self.config.global_rate_limit,
            workers,
        );
        tracing::info!(
            "dispatching {} downloads, max concurrency {}, rate {}",
            urls.len(),
            concurrency,
            describe_rate(rate_limit)
        );
        self.publish(ProgressEvent::RoundStarted {
            round,
            concurrency,
            rate_limit,
        })
        .await;

        let started = Instant::now();
        let gate = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();
        for url in urls {
            let downloader = self.downloader.clone();
            let gate = gate.clone();
            let url = url.clone();
            tasks.spawn(async move { downloader.download(&gate, &url, rate_limit).await });
        }

        let mut result = RoundResult {
            round_number: round,
            attempted: urls.len(),
            succeeded: 0,
            bytes_transferred: 0,
            duration: Duration::ZERO,
            skipped: false,
        };
        let mut interrupted = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(transfer)) => {
                    result.succeeded += 1;
                    result.bytes_transferred += transfer.bytes;
                    stats.add_bytes(transfer.bytes).await;
                }
                Ok(Err(DownloadError::Cancelled)) => interrupted = true,
                Ok(Err(_)) => {}
                Err(e) => tracing::error!("download task died: {}", e),
            }
        }
        result.duration = started.elapsed();

        if interrupted {
            RoundOutcome::Interrupted
        } else {
            RoundOutcome::Completed(result)
        }
    }

    fn round_concurrency(&self) -> usize {
        match self.config.rate_split {
            RateSplit::Fixed => self.startup_concurrency,
            RateSplit::PerRound => self
                .governor
                .initial_concurrency(self.config.base_max_concurrency, self.config.concurrency_hard_cap),
        }
    }

    /// Sleeps out the round interval. Returns how many memory checks found high usage.
    async fn pause_between_rounds(&self) -> u64 {
        let ticks = self.config.round_interval.as_secs();
        let mut pressure_hits = 0;
        if ticks == 0 {
            return pressure_hits;
        }
        tracing::info!("waiting {} s before the next round", ticks);

        for tick in 0..ticks {
            if self.shutdown.should_stop() {
                break;
            }
            if tick % PRESSURE_CHECK_EVERY == 0 && self.governor.is_under_pressure(PRESSURE_FRACTION) {
                pressure_hits += 1;
                if let Some(usage) = self.governor.memory_usage() {
                    tracing::warn!("memory usage high between rounds: {:.1} MB", as_mib(usage));
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(SLEEP_TICK) => {}
                _ = self.shutdown.stopped() => break,
            }
        }
        pressure_hits
    }

    async fn publish(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(event).await;
        }
    }
}

fn describe_rate(rate_limit: u64) -> String {
    if rate_limit == 0 {
        "unlimited".to_string()
    } else {
        format!("{} KB/s per download", rate_limit / 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MIB;
    use crate::transport::{TransportError, TransportResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Unreachable;

    #[async_trait]
    impl Transport for Unreachable {
        async fn get(&self, url: &str, _timeout: Duration) -> Result<TransportResponse, TransportError> {
            Err(TransportError::Other(format!("no route to {}", url)))
        }
    }

    struct Usage(AtomicU64);

    impl MemoryMonitor for Usage {
        fn current_usage(&self) -> Option<u64> {
            Some(self.0.load(Ordering::SeqCst))
        }
        fn available_system_memory(&self) -> Option<u64> {
            Some(1024 * MIB)
        }
    }

    fn sleeping_scheduler(usage: u64, interval_secs: u64, shutdown: Shutdown) -> TrafficScheduler {
        let config = TrafficConfig {
            round_interval: Duration::from_secs(interval_secs),
            ..TrafficConfig::default()
        };
        TrafficScheduler::new(
            config,
            Arc::new(Unreachable),
            Arc::new(Usage(AtomicU64::new(usage))),
            shutdown,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn pause_checks_memory_every_fifth_tick() {
        // 90 MiB against the 100 MiB default ceiling is above the 80% mark.
        let scheduler = sleeping_scheduler(90 * MIB, 12, Shutdown::new());
        let started = Instant::now();
        let hits = scheduler.pause_between_rounds().await;
        assert_eq!(hits, 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(12) && elapsed < Duration::from_secs(13), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_ignores_usage_below_the_mark() {
        let scheduler = sleeping_scheduler(50 * MIB, 6, Shutdown::new());
        assert_eq!(scheduler.pause_between_rounds().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_ends_early_on_stop() {
        let shutdown = Shutdown::new();
        let scheduler = sleeping_scheduler(90 * MIB, 60, shutdown.clone());
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            shutdown.request_stop();
        });
        let started = Instant::now();
        let hits = scheduler.pause_between_rounds().await;
        stopper.await.unwrap();
        assert_eq!(hits, 1);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn rate_description() {
        assert_eq!(describe_rate(0), "unlimited");
        assert_eq!(describe_rate(10 * 1024), "10 KB/s per download");
    }
}
