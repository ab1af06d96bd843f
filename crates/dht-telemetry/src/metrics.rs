//! Prometheus metrics for DHT peers.
//!
//! All metrics follow the naming convention: `dht_<component>_<metric>_<unit>`
//!
//! Collectors are process-wide, so several peers in one process report
//! into the same series.

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts,
    Registry, TextEncoder,
};
use std::time::Instant;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // SENDER
    // =========================================================================

    /// Outbound requests written to a channel
    pub static ref REQUESTS_SENT: CounterVec = CounterVec::new(
        Opts::new("dht_sender_requests_sent_total", "Outbound requests sent"),
        &["transport"]  // udp/tcp
    ).expect("metric creation failed");

    /// Outbound requests that did not produce a response
    pub static ref REQUESTS_FAILED: CounterVec = CounterVec::new(
        Opts::new("dht_sender_requests_failed_total", "Outbound requests that failed"),
        &["outcome"]  // timeout/transport/shutdown/rejected
    ).expect("metric creation failed");

    /// Round trip time of successful requests
    pub static ref REQUEST_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "dht_sender_request_duration_seconds",
            "Time from request write to correlated response"
        ).buckets(exponential_buckets(0.0005, 2.0, 14).expect("bucket layout is valid"))
    ).expect("metric creation failed");

    // =========================================================================
    // DISPATCHER
    // =========================================================================

    /// Inbound requests handed to a handler
    pub static ref MESSAGES_DISPATCHED: Counter = Counter::new(
        "dht_dispatcher_messages_dispatched_total",
        "Inbound requests routed to a registered handler"
    ).expect("metric creation failed");

    /// Inbound messages answered with a rejection or dropped
    pub static ref MESSAGES_REJECTED: CounterVec = CounterVec::new(
        Opts::new("dht_dispatcher_messages_rejected_total", "Inbound messages rejected"),
        &["reason"]  // unknown_id/handler_fault/foreign_network/not_request
    ).expect("metric creation failed");

    // =========================================================================
    // CHANNELS
    // =========================================================================

    /// Inbound bytes that failed to decode
    pub static ref DECODE_FAULTS: CounterVec = CounterVec::new(
        Opts::new("dht_channel_decode_faults_total", "Inbound data that failed to decode"),
        &["transport"]
    ).expect("metric creation failed");

    pub static ref CHANNELS_OPENED: CounterVec = CounterVec::new(
        Opts::new("dht_channel_opened_total", "Channels opened"),
        &["transport"]
    ).expect("metric creation failed");

    pub static ref CHANNELS_CLOSED: CounterVec = CounterVec::new(
        Opts::new("dht_channel_closed_total", "Channels closed"),
        &["transport"]
    ).expect("metric creation failed");

    // =========================================================================
    // RESERVATION
    // =========================================================================

    /// Outbound channels currently checked out of the pool
    pub static ref RESERVATION_IN_USE: Gauge = Gauge::new(
        "dht_reservation_channels_in_use",
        "Outbound channels currently in use"
    ).expect("metric creation failed");
}

/// Register all metrics with the global registry.
///
/// Calling it again is harmless; collectors that are already registered are
/// skipped.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Sender
        Box::new(REQUESTS_SENT.clone()),
        Box::new(REQUESTS_FAILED.clone()),
        Box::new(REQUEST_LATENCY.clone()),
        // Dispatcher
        Box::new(MESSAGES_DISPATCHED.clone()),
        Box::new(MESSAGES_REJECTED.clone()),
        // Channels
        Box::new(DECODE_FAULTS.clone()),
        Box::new(CHANNELS_OPENED.clone()),
        Box::new(CHANNELS_CLOSED.clone()),
        // Reservation
        Box::new(RESERVATION_IN_USE.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }
    Ok(())
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: Instant,
    armed: bool,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: Instant::now(),
            armed: true,
        }
    }

    /// Drop without recording, e.g. when the timed operation failed.
    pub fn discard(mut self) {
        self.armed = false;
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        if self.armed {
            self.histogram.observe(self.start.elapsed().as_secs_f64());
        }
    }
}
