//! Prometheus metrics for the tether link.
//!
//! All metrics follow the naming convention: `tether_<component>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., rpc_calls_total)
//! - **Gauge**: Value that can go up or down (e.g., rpc_pending_calls)
//! - **Histogram**: Distribution of values (e.g., rpc_handler_duration_seconds)

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // RPC CLIENT METRICS
    // =========================================================================

    /// Outbound calls by final outcome
    pub static ref RPC_CALLS: IntCounterVec = IntCounterVec::new(
        Opts::new("tether_rpc_calls_total", "Outbound RPC calls by outcome"),
        &["outcome"]  // ok/remote_error/timeout/cancelled/transport
    ).expect("metric creation failed");

    /// Calls currently awaiting a response
    pub static ref RPC_PENDING_CALLS: IntGauge = IntGauge::new(
        "tether_rpc_pending_calls",
        "Number of calls awaiting a response"
    ).expect("metric creation failed");

    /// Responses that arrived for an unknown or expired call id
    pub static ref RPC_STALE_RESPONSES: IntCounter = IntCounter::new(
        "tether_rpc_stale_responses_total",
        "Responses dropped because no call was waiting for them"
    ).expect("metric creation failed");

    // =========================================================================
    // RPC SERVER METRICS
    // =========================================================================

    /// Inbound requests by outcome
    pub static ref RPC_REQUESTS_HANDLED: IntCounterVec = IntCounterVec::new(
        Opts::new("tether_rpc_requests_handled_total", "Inbound RPC requests by outcome"),
        &["outcome"]  // ok/method_not_found/handler/timeout/serialization
    ).expect("metric creation failed");

    /// Handler execution time
    pub static ref RPC_HANDLER_DURATION: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "tether_rpc_handler_duration_seconds",
            "Time spent inside RPC handlers"
        ).buckets(exponential_buckets(0.0001, 2.0, 16).expect("valid buckets"))
    ).expect("metric creation failed");

    // =========================================================================
    // CONNECTION METRICS
    // =========================================================================

    /// Handshake attempts by outcome
    pub static ref HANDSHAKES: IntCounterVec = IntCounterVec::new(
        Opts::new("tether_connection_handshakes_total", "Connection handshakes by outcome"),
        &["outcome"]  // success/failed
    ).expect("metric creation failed");

    /// Satellites currently attached to the host
    pub static ref PEERS_ATTACHED: IntGauge = IntGauge::new(
        "tether_host_peers_attached",
        "Number of satellite channels attached to the host"
    ).expect("metric creation failed");

    // =========================================================================
    // PUB/SUB METRICS
    // =========================================================================

    /// Events published by topic
    pub static ref EVENTS_PUBLISHED: IntCounterVec = IntCounterVec::new(
        Opts::new("tether_bus_events_published_total", "Events published by topic"),
        &["topic"]
    ).expect("metric creation failed");

    /// Handler invocations by topic
    pub static ref EVENTS_DELIVERED: IntCounterVec = IntCounterVec::new(
        Opts::new("tether_bus_events_delivered_total", "Event handler invocations by topic"),
        &["topic"]
    ).expect("metric creation failed");

    // =========================================================================
    // TRANSPORT METRICS
    // =========================================================================

    /// Inbound frames rejected before dispatch
    pub static ref FRAMES_REJECTED: IntCounterVec = IntCounterVec::new(
        Opts::new("tether_transport_frames_rejected_total", "Inbound frames rejected"),
        &["reason"]  // decode/oversize
    ).expect("metric creation failed");

    // =========================================================================
    // REFERENCE METRICS
    // =========================================================================

    /// Reference writes by outcome
    pub static ref REF_WRITES: IntCounterVec = IntCounterVec::new(
        Opts::new("tether_ref_writes_total", "Synchronized reference writes by outcome"),
        &["outcome"]  // applied/rejected
    ).expect("metric creation failed");
}

/// Handle for the registered metrics
pub struct MetricsHandle {
    _registry: Arc<Registry>,
}

/// Register all metrics with the global registry.
///
/// Safe to call more than once; collectors that are already registered are
/// left in place.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // RPC client
        Box::new(RPC_CALLS.clone()),
        Box::new(RPC_PENDING_CALLS.clone()),
        Box::new(RPC_STALE_RESPONSES.clone()),
        // RPC server
        Box::new(RPC_REQUESTS_HANDLED.clone()),
        Box::new(RPC_HANDLER_DURATION.clone()),
        // Connection
        Box::new(HANDSHAKES.clone()),
        Box::new(PEERS_ATTACHED.clone()),
        // Pub/sub
        Box::new(EVENTS_PUBLISHED.clone()),
        Box::new(EVENTS_DELIVERED.clone()),
        // Transport
        Box::new(FRAMES_REJECTED.clone()),
        // References
        Box::new(REF_WRITES.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(MetricsHandle {
        _registry: Arc::new(REGISTRY.clone()),
    })
}

/// Encode all metrics as Prometheus text format.
pub fn gather_metrics() -> Result<String, TelemetryError> {
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
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.observe(duration);
    }
}

/// Start timing for a histogram. Observation happens on drop.
#[macro_export]
macro_rules! time_histogram {
    ($histogram:expr) => {
        $crate::metrics::HistogramTimer::new(&$histogram)
    };
}
