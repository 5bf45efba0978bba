//! Rolling-average bandwidth estimation and network-adaptive prefetch sizing.
//!
//! Completing downloads feed byte/duration samples into a small rolling window; the mean
//! classifies the connection and the class picks how far ahead/behind the feed prefetches
//! and how many downloads may run at once. A wifi classification comes from connectivity
//! hints only and is never overridden by samples.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

/// Observed network class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    Wifi,
    FiveG,
    FourG,
    Slow,
    Offline,
}

/// Prefetch fan-out for a network class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchConfig {
    /// Feed items prefetched ahead of the current index.
    pub ahead: usize,
    /// Feed items prefetched behind the current index.
    pub behind: usize,
    /// Widest window inside which in-flight downloads are preserved.
    pub keep: usize,
    /// Concurrent download cap.
    pub max_concurrent: usize,
}

/// Connectivity hint from the host platform.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectivityHint {
    pub is_wifi: bool,
    pub is_mobile: bool,
}

const WINDOW: usize = 10;
const MIN_SAMPLE_DURATION: Duration = Duration::from_millis(100);
const DEFAULT_BANDWIDTH_KIBPS: f64 = 1024.0;

struct MonitorState {
    network: NetworkType,
    bandwidth_kibps: f64,
    samples: VecDeque<f64>,
}

/// Rolling-average bandwidth estimator.
pub struct NetworkQualityMonitor {
    state: Mutex<MonitorState>,
}

impl Default for NetworkQualityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkQualityMonitor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MonitorState {
                network: NetworkType::Wifi,
                bandwidth_kibps: DEFAULT_BANDWIDTH_KIBPS,
                samples: VecDeque::with_capacity(WINDOW),
            }),
        }
    }

    /// Record a completed transfer. Samples shorter than 100 ms are too noisy and ignored.
    pub fn record_sample(&self, bytes: u64, duration: Duration) {
        if duration < MIN_SAMPLE_DURATION {
            return;
        }
        let kibps = bytes as f64 / 1024.0 / duration.as_secs_f64();

        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.samples.push_back(kibps);
        while st.samples.len() > WINDOW {
            st.samples.pop_front();
        }
        st.bandwidth_kibps = st.samples.iter().sum::<f64>() / st.samples.len() as f64;

        // Wifi classification comes from the platform, not from throughput.
        if st.network != NetworkType::Wifi {
            let class = if st.bandwidth_kibps > 2048.0 {
                NetworkType::FiveG
            } else if st.bandwidth_kibps > 512.0 {
                NetworkType::FourG
            } else {
                NetworkType::Slow
            };
            if class != st.network {
                debug!(?class, bandwidth = st.bandwidth_kibps, "network reclassified");
                st.network = class;
            }
        }
    }

    /// Apply a platform connectivity hint. Mobile starts as `FourG` until samples refine it.
    pub fn update_from_connectivity(&self, hint: ConnectivityHint) {
        let class = if hint.is_wifi {
            NetworkType::Wifi
        } else if hint.is_mobile {
            NetworkType::FourG
        } else {
            NetworkType::Offline
        };
        self.set_network_type(class);
    }

    /// Force a network class. Samples are cleared on any transition.
    pub fn set_network_type(&self, network: NetworkType) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if st.network != network {
            debug!(?network, "network class set");
            st.network = network;
            st.samples.clear();
        }
    }

    pub fn network_type(&self) -> NetworkType {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.network
    }

    /// Current bandwidth estimate in KiB/s.
    pub fn bandwidth_kibps(&self) -> f64 {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.bandwidth_kibps
    }

    /// Prefetch fan-out for the current class.
    pub fn prefetch_config(&self) -> PrefetchConfig {
        match self.network_type() {
            NetworkType::Wifi => PrefetchConfig {
                ahead: 4,
                behind: 2,
                keep: 8,
                max_concurrent: 4,
            },
            NetworkType::FiveG => PrefetchConfig {
                ahead: 3,
                behind: 1,
                keep: 6,
                max_concurrent: 3,
            },
            NetworkType::FourG => PrefetchConfig {
                ahead: 2,
                behind: 1,
                keep: 4,
                max_concurrent: 2,
            },
            NetworkType::Slow => PrefetchConfig {
                ahead: 1,
                behind: 0,
                keep: 3,
                max_concurrent: 1,
            },
            NetworkType::Offline => PrefetchConfig {
                ahead: 0,
                behind: 0,
                keep: 2,
                max_concurrent: 0,
            },
        }
    }
}
