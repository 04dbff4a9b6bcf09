//! Prometheus metrics for delivery batches.
//!
//! Device tokens never appear in labels; only aggregate counts and gateway
//! status codes are recorded.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use crate::error::Result;

/// All metrics for pushgate.
#[derive(Clone)]
pub struct Metrics {
    /// The Prometheus registry containing all metrics.
    pub registry: Registry,

    // === Frame Metrics ===
    /// Notification frames written to the gateway, resends included.
    pub frames_sent_total: IntCounter,
    /// Notifications skipped because their device token was malformed.
    pub tokens_skipped_total: IntCounter,
    /// Error responses received from the gateway, by status.
    pub gateway_errors_total: IntCounterVec,
    /// Connections declared lost (undecodable frame or read failure).
    pub connections_lost_total: IntCounter,

    // === Connection Metrics ===
    /// Gateway connections opened.
    pub connections_opened_total: IntCounter,
    /// Gateway connections retired, by reason.
    pub connections_retired_total: IntCounterVec,
    /// Gateway connections currently open.
    pub connections_open: IntGauge,
    /// Error listener tasks currently running.
    pub listeners_active: IntGauge,
    /// Transport failures (connect, handshake, write).
    pub transport_failures_total: IntCounter,

    // === Batch Metrics ===
    /// Batches finished, by outcome.
    pub batches_total: IntCounterVec,
    /// Wall-clock duration of a batch.
    pub batch_duration_seconds: Histogram,
    /// Build information.
    pub build_info: IntGaugeVec,
}

impl Metrics {
    /// Create and register all metrics.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let frames_sent_total = IntCounter::with_opts(Opts::new(
            "pushgate_frames_sent_total",
            "Total number of notification frames written to the gateway",
        ))?;
        registry.register(Box::new(frames_sent_total.clone()))?;

        let tokens_skipped_total = IntCounter::with_opts(Opts::new(
            "pushgate_tokens_skipped_total",
            "Total number of notifications skipped for malformed device tokens",
        ))?;
        registry.register(Box::new(tokens_skipped_total.clone()))?;

        let gateway_errors_total = IntCounterVec::new(
            Opts::new(
                "pushgate_gateway_errors_total",
                "Total number of error responses received from the gateway",
            ),
            &["status"],
        )?;
        registry.register(Box::new(gateway_errors_total.clone()))?;

        let connections_lost_total = IntCounter::with_opts(Opts::new(
            "pushgate_connections_lost_total",
            "Total number of connections lost without a decodable error response",
        ))?;
        registry.register(Box::new(connections_lost_total.clone()))?;

        let connections_opened_total = IntCounter::with_opts(Opts::new(
            "pushgate_connections_opened_total",
            "Total number of gateway connections opened",
        ))?;
        registry.register(Box::new(connections_opened_total.clone()))?;

        let connections_retired_total = IntCounterVec::new(
            Opts::new(
                "pushgate_connections_retired_total",
                "Total number of gateway connections retired",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(connections_retired_total.clone()))?;

        let connections_open = IntGauge::with_opts(Opts::new(
            "pushgate_connections_open",
            "Number of gateway connections currently open",
        ))?;
        registry.register(Box::new(connections_open.clone()))?;

        let listeners_active = IntGauge::with_opts(Opts::new(
            "pushgate_listeners_active",
            "Number of error listener tasks currently running",
        ))?;
        registry.register(Box::new(listeners_active.clone()))?;

        let transport_failures_total = IntCounter::with_opts(Opts::new(
            "pushgate_transport_failures_total",
            "Total number of gateway transport failures",
        ))?;
        registry.register(Box::new(transport_failures_total.clone()))?;

        let batches_total = IntCounterVec::new(
            Opts::new("pushgate_batches_total", "Total number of batches run"),
            &["outcome"],
        )?;
        registry.register(Box::new(batches_total.clone()))?;

        let batch_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "pushgate_batch_duration_seconds",
                "Duration of delivery batches in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0]),
        )?;
        registry.register(Box::new(batch_duration_seconds.clone()))?;

        let build_info = IntGaugeVec::new(
            Opts::new("pushgate_build_info", "Version and build information"),
            &["version"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            frames_sent_total,
            tokens_skipped_total,
            gateway_errors_total,
            connections_lost_total,
            connections_opened_total,
            connections_retired_total,
            connections_open,
            listeners_active,
            transport_failures_total,
            batches_total,
            batch_duration_seconds,
            build_info,
        })
    }

    /// Record the running version.
    pub fn init_build_info(&self, version: &str) {
        self.build_info.with_label_values(&[version]).set(1);
    }

    /// Record a frame written to the gateway.
    pub fn record_frame_sent(&self) {
        self.frames_sent_total.inc();
    }

    /// Record a notification skipped for a malformed token.
    pub fn record_token_skipped(&self) {
        self.tokens_skipped_total.inc();
    }

    /// Record an error response.
    ///
    /// `status` is the label from `ErrorStatus::as_str`.
    pub fn record_gateway_error(&self, status: &str) {
        self.gateway_errors_total.with_label_values(&[status]).inc();
    }

    /// Record a connection lost without a usable error response.
    pub fn record_connection_lost(&self) {
        self.connections_lost_total.inc();
    }

    /// Record a newly opened connection.
    pub fn record_connection_opened(&self) {
        self.connections_opened_total.inc();
        self.connections_open.inc();
    }

    /// Record a retired connection.
    ///
    /// `reason` is one of "rejected", "lost", "rotation", "transport",
    /// "complete" or "cancelled".
    pub fn record_connection_retired(&self, reason: &str) {
        self.connections_retired_total
            .with_label_values(&[reason])
            .inc();
        self.connections_open.dec();
    }

    /// Record a listener task starting.
    pub fn record_listener_started(&self) {
        self.listeners_active.inc();
    }

    /// Record a listener task exiting.
    pub fn record_listener_stopped(&self) {
        self.listeners_active.dec();
    }

    /// Record a transport failure.
    pub fn record_transport_failure(&self) {
        self.transport_failures_total.inc();
    }

    /// Record a finished batch.
    ///
    /// `outcome` should be "completed" or "failed".
    pub fn record_batch(&self, outcome: &str, duration_secs: f64) {
        self.batches_total.with_label_values(&[outcome]).inc();
        self.batch_duration_seconds.observe(duration_secs);
    }

    /// Gather all metrics for export.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
