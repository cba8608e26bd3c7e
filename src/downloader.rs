// src/downloader.rs

use crate::governor::{ConcurrencyState, ResourceGovernor};
use crate::limiter::ChunkPacer;
use crate::memory::as_mib;
use crate::shutdown::Shutdown;
use crate::transport::{Transport, TransportError};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Chunks between checkpoint log lines.
const CHECKPOINT_EVERY: u64 = 100;

/// Why a single download ended without success. None of these stop the run.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("cancelled")]
    Cancelled,
    #[error("skipped, memory usage above ceiling")]
    MemorySkip,
    #[error("server returned HTTP {0}")]
    HttpStatus(u16),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// What a finished download consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    pub bytes: u64,
    pub chunks: u64,
}

pub type Outcome = Result<Transfer, DownloadError>;

/// Fetches URLs and throws the body away, chunk by chunk.
pub struct Downloader {
    transport: Arc<dyn Transport>,
    governor: Arc<ResourceGovernor>,
    concurrency: Arc<ConcurrencyState>,
    shutdown: Shutdown,
    chunk_len: usize,
    timeout: Duration,
}

impl Downloader {
    pub fn new(
        transport: Arc<dyn Transport>,
        governor: Arc<ResourceGovernor>,
        concurrency: Arc<ConcurrencyState>,
        shutdown: Shutdown,
        chunk_len: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            governor,
            concurrency,
            shutdown,
            chunk_len: chunk_len.max(1),
            timeout,
        }
    }

    /// Downloads `url` once, holding one permit of `gate` for the duration of the transfer.
    /// `rate_limit` is in bytes per second, 0 = unlimited.
    pub async fn download(&self, gate: &Semaphore, url: &str, rate_limit: u64) -> Outcome {
        if self.shutdown.should_stop() {
            return Err(DownloadError::Cancelled);
        }
        if !self.governor.is_safe() {
            tracing::warn!("memory usage too high, skipping download: {}", url);
            return Err(DownloadError::MemorySkip);
        }

        let _permit = tokio::select! {
            permit = gate.acquire() => permit.map_err(|_| DownloadError::Cancelled)?,
            _ = self.shutdown.stopped() => return Err(DownloadError::Cancelled),
        };
        if self.shutdown.should_stop() {
            return Err(DownloadError::Cancelled);
        }
        // The wait for a slot can outlast the first check.
        if !self.governor.is_safe() {
            tracing::warn!("memory usage rose while queued, skipping download: {}", url);
            return Err(DownloadError::MemorySkip);
        }
        let _active = self.concurrency.enter();

        let result = self.transfer(url, rate_limit).await;
        match &result {
            Ok(transfer) => {
                let rate = if rate_limit > 0 {
                    format!(" (limit {} KB/s)", rate_limit / 1024)
                } else {
                    String::new()
                };
                let memory = self
                    .governor
                    .memory_usage()
                    .map(|usage| format!(" [memory {:.1} MB]", as_mib(usage)))
                    .unwrap_or_default();
                tracing::debug!(
                    "downloaded and discarded {} ({} bytes, {} chunks){}{}",
                    url,
                    transfer.bytes,
                    transfer.chunks,
                    rate,
                    memory
                );
            }
            Err(DownloadError::Cancelled) => tracing::debug!("download cancelled: {}", url),
            Err(e) => tracing::warn!("download failed {}: {}", url, e),
        }
        result
    }

    async fn transfer(&self, url: &str, rate_limit: u64) -> Outcome {
        let resp = self.transport.get(url, self.timeout).await?;
        if !resp.is_success() {
            return Err(DownloadError::HttpStatus(resp.status));
        }

        let mut body = resp.body;
        let mut pacer = ChunkPacer::new();
        let mut transfer = Transfer::default();

        loop {
            let piece = tokio::select! {
                piece = body.next() => piece,
                _ = self.shutdown.stopped() => return Err(DownloadError::Cancelled),
            };
            let Some(piece) = piece else { break };
            let mut piece = piece?;
            while !piece.is_empty() {
                let len = {
                    let chunk = piece.split_to(self.chunk_len.min(piece.len()));
                    chunk.len() as u64
                };
                transfer.bytes += len;
                transfer.chunks += 1;

                if self.shutdown.should_stop() {
                    return Err(DownloadError::Cancelled);
                }
                tokio::select! {
                    _ = pacer.pace(len, rate_limit) => {}
                    _ = self.shutdown.stopped() => return Err(DownloadError::Cancelled),
                }
                if transfer.chunks % CHECKPOINT_EVERY == 0 {
                    tracing::trace!("{}: {} chunks, {} bytes so far", url, transfer.chunks, transfer.bytes);
                }
            }
        }

        Ok(transfer)
    }
}
