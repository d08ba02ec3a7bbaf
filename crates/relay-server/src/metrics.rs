//! Metrics collection and export for Relay.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tenvis_relay_core::{live_stats, ChannelManager, MemoryStats, Statistic, StatsSink};
use tenvis_relay_transport::FrameObserver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const MESSAGES_TOTAL: &str = "relay_messages_total";
    pub const MESSAGES_BYTES: &str = "relay_messages_bytes";
    pub const CHANNELS_ACTIVE: &str = "relay_channels_active";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "relay_subscriptions_active";
    pub const AUTH_FAILURES_TOTAL: &str = "relay_auth_failures_total";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of occupied channels");
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Current number of channel subscriptions"
    );
    metrics::describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Total number of rejected request signatures"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!(%addr, "Metrics server listening");
    Ok(())
}

/// Record a rejected request signature.
pub fn record_auth_failure(surface: &'static str) {
    counter!(names::AUTH_FAILURES_TOTAL, "surface" => surface).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Publish channel occupancy gauges every `period` until `shutdown`.
pub async fn sample_channels(
    channels: Arc<ChannelManager>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let stats = channels.stats();
                gauge!(names::CHANNELS_ACTIVE).set(stats.occupied_channels as f64);
                gauge!(names::SUBSCRIPTIONS_ACTIVE).set(stats.total_subscriptions as f64);
            }
        }
    }
}

/// Publish each application's statistics every `period` until `shutdown`.
pub async fn report_statistics(
    stats: Arc<ServerStats>,
    channels: Arc<ChannelManager>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let start = tokio::time::Instant::now() + period;
    let mut ticker = tokio::time::interval_at(start, period);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let apps = stats.report(&channels);
                debug!(apps, "Statistics window closed");
            }
        }
    }
}

/// Statistics sink backing the stats endpoint and the Prometheus counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    memory: MemoryStats,
}

impl ServerStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counters for one application.
    #[must_use]
    pub fn snapshot(&self, app_id: &str) -> Statistic {
        self.memory.snapshot(app_id)
    }

    /// Close the current window: publish every active application's
    /// counters on its `current-stats` channel, then restart its counters
    /// from the connections still subscribed somewhere.
    ///
    /// Returns the number of applications reported.
    pub fn report(&self, channels: &ChannelManager) -> usize {
        let window = self
            .memory
            .flush(|app_id| channels.concurrent_connections_for_app(app_id) as u64);
        for stat in &window {
            live_stats::publish_statistic(channels, stat);
        }
        window.len()
    }
}

impl StatsSink for ServerStats {
    fn on_connect(&self, app_id: &str) {
        self.memory.on_connect(app_id);
        counter!(names::CONNECTIONS_TOTAL, "app_id" => app_id.to_string()).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE, "app_id" => app_id.to_string()).increment(1.0);
    }

    fn on_disconnect(&self, app_id: &str) {
        self.memory.on_disconnect(app_id);
        gauge!(names::CONNECTIONS_ACTIVE, "app_id" => app_id.to_string()).decrement(1.0);
    }

    fn on_api_message(&self, app_id: &str) {
        self.memory.on_api_message(app_id);
        counter!(names::MESSAGES_TOTAL, "direction" => "api").increment(1);
    }

    fn on_websocket_message(&self, app_id: &str) {
        self.memory.on_websocket_message(app_id);
        counter!(names::MESSAGES_TOTAL, "direction" => "client").increment(1);
    }
}

/// Frame traffic observer feeding the byte counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrafficMetrics;

impl FrameObserver for TrafficMetrics {
    fn on_inbound(&self, bytes: usize) {
        counter!(names::MESSAGES_TOTAL, "direction" => "inbound").increment(1);
        counter!(names::MESSAGES_BYTES, "direction" => "inbound").increment(bytes as u64);
    }

    fn on_outbound(&self, bytes: usize) {
        counter!(names::MESSAGES_TOTAL, "direction" => "outbound").increment(1);
        counter!(names::MESSAGES_BYTES, "direction" => "outbound").increment(bytes as u64);
    }

    fn on_error(&self, kind: &'static str) {
        record_error(kind);
    }
}
