//! Prometheus instruments for the feed

use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{FeedError, Result};

/// Feed counters and gauges, registered on an explicit registry
#[derive(Clone)]
pub struct FeedMetrics {
    pub connects: IntCounter,
    pub reconnect_attempts: IntCounter,
    pub messages: IntCounterVec,
    pub parse_errors: IntCounter,
    pub dropped_messages: IntCounter,
    pub heartbeat_latency_ms: Gauge,
    pub connected: IntGauge,
}

impl FeedMetrics {
    pub fn register(registry: &Registry) -> Result<Self> {
        let metrics = Self {
            connects: IntCounter::new("feed_connects_total", "Successful WebSocket connections")?,
            reconnect_attempts: IntCounter::new(
                "feed_reconnect_attempts_total",
                "Reconnection attempts scheduled after a failure",
            )?,
            messages: IntCounterVec::new(
                Opts::new("feed_messages_total", "Parsed inbound frames by kind"),
                &["kind"],
            )?,
            parse_errors: IntCounter::new("feed_parse_errors_total", "Inbound frames that failed to parse")?,
            dropped_messages: IntCounter::new(
                "feed_dropped_messages_total",
                "Data frames for channels that are not subscribed",
            )?,
            heartbeat_latency_ms: Gauge::new(
                "feed_heartbeat_latency_ms",
                "Round trip of the last application ping",
            )?,
            connected: IntGauge::new("feed_connected", "1 while the socket is open")?,
        };

        registry.register(Box::new(metrics.connects.clone()))?;
        registry.register(Box::new(metrics.reconnect_attempts.clone()))?;
        registry.register(Box::new(metrics.messages.clone()))?;
        registry.register(Box::new(metrics.parse_errors.clone()))?;
        registry.register(Box::new(metrics.dropped_messages.clone()))?;
        registry.register(Box::new(metrics.heartbeat_latency_ms.clone()))?;
        registry.register(Box::new(metrics.connected.clone()))?;

        Ok(metrics)
    }
}

/// Render a registry in the Prometheus text format
pub fn encode(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| FeedError::MetricsError(e.to_string()))
}
