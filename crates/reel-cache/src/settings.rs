//! Unified configuration for the cache core.
//!
//! One flattened settings struct covers the HTTP pool, the progress protocol, persistence
//! throttling, and eviction. Defaults match the values the cache was tuned with; every knob
//! has a builder-style setter.

use std::time::Duration;

/// Settings for the cache core (downloader, metadata store, evictor).
#[derive(Debug, Clone)]
pub struct CacheSettings {
    // ----------------------------
    // HTTP connection pool
    // ----------------------------
    /// Number of long-lived HTTP clients in the pool, selected round-robin.
    /// Default: 4.
    pub pool_size: usize,

    /// Timeout for establishing a connection.
    /// Default: 8 seconds.
    pub connect_timeout: Duration,

    /// How long an idle pooled connection is kept alive for reuse.
    /// Default: 30 seconds.
    pub pool_idle_timeout: Duration,

    /// Read timeout: maximum time between receiving data chunks before an active
    /// download is failed. Distinct from `pool_idle_timeout`, which only governs
    /// connection reuse.
    /// Default: 30 seconds.
    pub read_timeout: Duration,

    // ----------------------------
    // Progress protocol
    // ----------------------------
    /// Accumulated new bytes between intermediate progress emissions.
    /// Default: 64 KiB.
    pub progress_emit_bytes: u64,

    /// Byte threshold above which a partially downloaded file is considered playable.
    /// Default: 128 KiB.
    pub playable_threshold_bytes: u64,

    /// How long a caller polls an already-running download for the playable threshold
    /// before returning the path anyway.
    /// Default: 10 seconds.
    pub threshold_wait_timeout: Duration,

    // ----------------------------
    // Metadata persistence
    // ----------------------------
    /// Minimum interval between persisted progress updates for a single URL.
    /// Completion always persists immediately.
    /// Default: 5 seconds.
    pub persist_interval: Duration,

    // ----------------------------
    // Eviction
    // ----------------------------
    /// Cache size ceiling. An eviction pass reduces the footprint to 80% of this.
    /// Default: 200 MiB.
    pub max_cache_bytes: u64,

    /// Minimum interval between throttled eviction passes.
    /// Default: 30 seconds.
    pub evict_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            pool_size: 4,
            connect_timeout: Duration::from_secs(8),
            pool_idle_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            progress_emit_bytes: 64 * 1024,
            playable_threshold_bytes: 128 * 1024,
            threshold_wait_timeout: Duration::from_secs(10),
            persist_interval: Duration::from_secs(5),
            max_cache_bytes: 200 * 1024 * 1024,
            evict_interval: Duration::from_secs(30),
        }
    }
}

impl CacheSettings {
    /// Create default settings.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool_size(mut self, v: usize) -> Self {
        self.pool_size = v.max(1);
        self
    }

    pub fn connect_timeout(mut self, v: Duration) -> Self {
        self.connect_timeout = v;
        self
    }

    pub fn pool_idle_timeout(mut self, v: Duration) -> Self {
        self.pool_idle_timeout = v;
        self
    }

    pub fn read_timeout(mut self, v: Duration) -> Self {
        self.read_timeout = v;
        self
    }

    pub fn progress_emit_bytes(mut self, v: u64) -> Self {
        self.progress_emit_bytes = v.max(1);
        self
    }

    pub fn playable_threshold_bytes(mut self, v: u64) -> Self {
        self.playable_threshold_bytes = v;
        self
    }

    pub fn threshold_wait_timeout(mut self, v: Duration) -> Self {
        self.threshold_wait_timeout = v;
        self
    }

    pub fn persist_interval(mut self, v: Duration) -> Self {
        self.persist_interval = v;
        self
    }

    pub fn max_cache_bytes(mut self, v: u64) -> Self {
        self.max_cache_bytes = v;
        self
    }

    pub fn evict_interval(mut self, v: Duration) -> Self {
        self.evict_interval = v;
        self
    }
}
