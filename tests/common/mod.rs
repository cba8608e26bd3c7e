//! Scripted transport and memory monitor shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use trafficflow::memory::{MemoryMonitor, MIB};
use trafficflow::transport::{Transport, TransportError, TransportResponse};

/// Serves every URL with a fixed-size body; status and piece count can be overridden per URL.
pub struct ScriptedTransport {
    statuses: HashMap<String, u16>,
    piece_counts: HashMap<String, usize>,
    default_status: u16,
    pieces: usize,
    piece_len: usize,
    piece_delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(pieces: usize, piece_len: usize) -> Self {
        Self {
            statuses: HashMap::new(),
            piece_counts: HashMap::new(),
            default_status: 200,
            pieces,
            piece_len,
            piece_delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_status(mut self, url: &str, status: u16) -> Self {
        self.statuses.insert(url.to_string(), status);
        self
    }

    pub fn with_pieces(mut self, url: &str, pieces: usize) -> Self {
        self.piece_counts.insert(url.to_string(), pieces);
        self
    }

    pub fn with_default_status(mut self, status: u16) -> Self {
        self.default_status = status;
        self
    }

    pub fn with_piece_delay(mut self, delay: Duration) -> Self {
        self.piece_delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, url: &str, _timeout: Duration) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let status = self.statuses.get(url).copied().unwrap_or(self.default_status);
        let pieces = self.piece_counts.get(url).copied().unwrap_or(self.pieces);
        let delay = self.piece_delay;
        let piece = Bytes::from(vec![0u8; self.piece_len]);
        let body = futures_util::stream::iter(std::iter::repeat(piece).take(pieces))
            .then(move |piece| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, TransportError>(piece)
            })
            .boxed();
        Ok(TransportResponse { status, body })
    }
}

/// Memory monitor whose readings the test controls.
pub struct FakeMemory {
    usage: AtomicU64,
    available: AtomicU64,
}

impl FakeMemory {
    /// 10 MiB used, 8 GiB free.
    pub fn roomy() -> Arc<Self> {
        Arc::new(Self {
            usage: AtomicU64::new(10 * MIB),
            available: AtomicU64::new(8192 * MIB),
        })
    }

    pub fn set_usage(&self, bytes: u64) {
        self.usage.store(bytes, Ordering::SeqCst);
    }
}

impl MemoryMonitor for FakeMemory {
    fn current_usage(&self) -> Option<u64> {
        Some(self.usage.load(Ordering::SeqCst))
    }

    fn available_system_memory(&self) -> Option<u64> {
        Some(self.available.load(Ordering::SeqCst))
    }
}

pub fn urls(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| format!("http://test.invalid/{}", name)).collect()
}
