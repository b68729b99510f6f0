//! Shared state for the HTTP layer

use super::metrics::RelayMetrics;
use crate::config::Config;
use crate::stream::BroadcastRegistry;
use std::sync::Arc;

/// Shared state for the application
#[derive(Clone)]
pub struct SharedState {
    /// Configuration
    pub config: Arc<Config>,

    /// Stream table
    pub streams: Arc<BroadcastRegistry>,

    /// Prometheus registry
    pub metrics: Arc<RelayMetrics>,

    /// Server start time
    pub start_time: std::time::Instant,
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("config", &self.config)
            .field("run_id", &self.streams.run_id())
            .field("streams", &self.streams.stream_count())
            .finish()
    }
}

impl SharedState {
    /// Create a new shared state
    pub fn new(config: Config, streams: Arc<BroadcastRegistry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            config: Arc::new(config),
            streams,
            metrics: Arc::new(RelayMetrics::new()?),
            start_time: std::time::Instant::now(),
        })
    }

    /// Get server uptime
    pub fn uptime(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}
