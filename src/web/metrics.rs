//! Prometheus metrics

use crate::stream::BroadcastRegistry;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct RelayMetrics {
    registry: Registry,
    streams: IntGauge,
    available_streams: IntGauge,
    viewer_sessions: IntGauge,
    signals: IntCounterVec,
}

impl RelayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let streams = IntGauge::with_opts(Opts::new("streamrelay_streams", "registered streams"))?;
        let available_streams = IntGauge::with_opts(Opts::new(
            "streamrelay_available_streams",
            "streams with recent capture activity",
        ))?;
        let viewer_sessions = IntGauge::with_opts(Opts::new(
            "streamrelay_viewer_sessions",
            "relayed viewer sessions",
        ))?;
        let signals = IntCounterVec::new(
            Opts::new("streamrelay_signals_total", "signals accepted by direction"),
            &["direction"],
        )?;

        registry.register(Box::new(streams.clone()))?;
        registry.register(Box::new(available_streams.clone()))?;
        registry.register(Box::new(viewer_sessions.clone()))?;
        registry.register(Box::new(signals.clone()))?;

        Ok(Self {
            registry,
            streams,
            available_streams,
            viewer_sessions,
            signals,
        })
    }

    /// Count signals posted from `direction` ("viewer" or "capture")
    pub fn record_signals(&self, direction: &str, count: usize) {
        self.signals.with_label_values(&[direction]).inc_by(count as u64);
    }

    /// Refresh gauges from `streams` and encode everything
    pub fn render(&self, streams: &BroadcastRegistry) -> Result<(String, String), prometheus::Error> {
        self.streams.set(streams.stream_count() as i64);
        self.available_streams.set(streams.available_stream_count() as i64);
        self.viewer_sessions.set(streams.viewer_session_count() as i64);

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        let body = String::from_utf8_lossy(&buffer).into_owned();
        Ok((encoder.format_type().to_string(), body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::test_support::factory;
    use crate::stream::StreamSettings;

    #[tokio::test]
    async fn test_render_includes_gauges_and_counters() {
        let metrics = RelayMetrics::new().unwrap();
        let streams = BroadcastRegistry::new(factory(), StreamSettings::default());
        streams.new_stream("desk", true, false).await;
        metrics.record_signals("viewer", 3);

        let (content_type, body) = metrics.render(&streams).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("streamrelay_streams 1"));
        assert!(body.contains("streamrelay_signals_total{direction=\"viewer\"} 3"));
    }
}
