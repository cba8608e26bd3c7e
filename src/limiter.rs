// src/limiter.rs

use tokio::time::{Duration, Instant};

/// Paces a byte stream to a target rate at chunk granularity.
///
/// After each chunk the pacer compares the time since the previous chunk with
/// the time that chunk *should* have taken at the target rate and sleeps for the
/// difference. Bursts inside a chunk are not smoothed and data is never dropped.
#[derive(Debug)]
pub struct ChunkPacer {
    /// When the previous chunk finished (or when the stream started).
    last_chunk: Instant,
}

impl ChunkPacer {
    pub fn new() -> Self {
        Self {
            last_chunk: Instant::now(),
        }
    }

    /// Delays the caller so `bytes_in_chunk` does not arrive faster than
    /// `rate_bytes_per_sec`. A rate of 0 means unlimited and returns immediately.
    pub async fn pace(&mut self, bytes_in_chunk: u64, rate_bytes_per_sec: u64) {
        let Some(expected) = expected_interval(bytes_in_chunk, rate_bytes_per_sec) else {
            return;
        };

        let actual = self.last_chunk.elapsed();
        if actual < expected {
            tokio::time::sleep(expected - actual).await;
        }
        self.last_chunk = Instant::now();
    }
}

impl Default for ChunkPacer {
    fn default() -> Self {
        Self::new()
    }
}

/// Time a chunk of `bytes` should occupy at `rate_bytes_per_sec`, or `None` when unlimited.
pub fn expected_interval(bytes: u64, rate_bytes_per_sec: u64) -> Option<Duration> {
    if rate_bytes_per_sec == 0 {
        return None;
    }
    Some(Duration::from_secs_f64(bytes as f64 / rate_bytes_per_sec as f64))
}

/// Picks the rate a single download runs at.
///
/// A per-download limit wins. Otherwise a global limit is split evenly across the
/// workers dispatched concurrently in the round. 0 means unlimited.
pub fn per_download_rate(per_download: u64, global: u64, concurrent_workers: usize) -> u64 {
    if per_download > 0 {
        per_download
    } else if global > 0 {
        (global / concurrent_workers.max(1) as u64).max(1)
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn paced_duration(chunks: &[u64], rate: u64) -> Duration {
        let start = Instant::now();
        let mut pacer = ChunkPacer::new();
        for &chunk in chunks {
            pacer.pace(chunk, rate).await;
        }
        start.elapsed()
    }

    fn close_to(actual: Duration, expected: Duration) -> bool {
        let diff = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        diff <= Duration::from_millis(2)
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_rate_never_sleeps() {
        let elapsed = paced_duration(&[4096; 50], 0).await;
        assert_eq!(elapsed, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn instant_chunks_take_their_expected_interval() {
        // 10 chunks of 4 KiB at 40 KiB/s is one second.
        let elapsed = paced_duration(&[4096; 10], 40 * 1024).await;
        assert!(close_to(elapsed, Duration::from_secs(1)), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn same_input_gives_same_duration() {
        let chunks = [4096, 1000, 4096, 17, 2048];
        let first = paced_duration(&chunks, 8192).await;
        let second = paced_duration(&chunks, 8192).await;
        assert!(close_to(first, second));
    }

    #[tokio::test(start_paused = true)]
    async fn lower_rate_never_finishes_sooner() {
        let chunks = [4096u64; 8];
        let mut previous = Duration::ZERO;
        for rate in [1_000_000u64, 100_000, 32_768, 8192, 1024] {
            let elapsed = paced_duration(&chunks, rate).await;
            assert!(elapsed >= previous, "rate {} took {:?} < {:?}", rate, elapsed, previous);
            previous = elapsed;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_arrivals_are_not_delayed_further() {
        let mut pacer = ChunkPacer::new();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let before = Instant::now();
        pacer.pace(4096, 4096).await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[test]
    fn rate_policy() {
        assert_eq!(per_download_rate(0, 0, 4), 0);
        assert_eq!(per_download_rate(2048, 0, 4), 2048);
        assert_eq!(per_download_rate(2048, 100_000, 4), 2048);
        assert_eq!(per_download_rate(0, 100_000, 4), 25_000);
        assert_eq!(per_download_rate(0, 100_000, 0), 100_000);
        assert_eq!(per_download_rate(0, 3, 10), 1);
    }

    #[test]
    fn expected_interval_for_limited_and_unlimited() {
        assert_eq!(expected_interval(4096, 0), None);
        assert_eq!(expected_interval(1024, 1024), Some(Duration::from_secs(1)));
    }
}
