pub mod config;
pub mod downloader;
pub mod governor;
pub mod limiter;
pub mod logging;
pub mod memory;
pub mod scheduler;
pub mod shutdown;
pub mod stats;
pub mod transport;
pub mod urls;

/// Re-exports for the binary and integration tests.
pub mod prelude {
    pub use crate::config::{ConfigError, RateSplit, Settings, TrafficConfig};
    pub use crate::downloader::{DownloadError, Downloader, Outcome, Transfer};
    pub use crate::governor::{ConcurrencyState, ResourceGovernor};
    pub use crate::memory::{MemoryMonitor, SystemMemory};
    pub use crate::scheduler::{ProgressEvent, RunSummary, TrafficScheduler};
    pub use crate::shutdown::{install_signal_handlers, Shutdown};
    pub use crate::stats::{Aggregator, RoundResult, Snapshot};
    pub use crate::transport::{HttpTransport, Transport, TransportError, TransportResponse};
    pub use crate::urls::load_urls;
}
