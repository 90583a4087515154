//! Engine metrics, prometheus-backed. The registry is explicit; embedders
//! wire it into whatever exporter they run.

use lazy_static::lazy_static;
use prometheus::exponential_buckets;
use prometheus::Histogram;
use prometheus::HistogramOpts;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;
use tracing::warn;

lazy_static! {
    pub static ref CHANGE_BATCHES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "change_batches_received",
            "Decoded change batches delivered to table watches"
        ),
        &["relation"]
    )
    .expect("metric can not be created");

    pub static ref CHANGE_BATCHES_DROPPED: IntCounter = IntCounter::new(
        "change_batches_dropped",
        "Raw change messages dropped (unwatched relation or undecodable)"
    )
    .expect("metric can not be created");

    pub static ref TRANSPORT_RECEIVE_FAILURES: IntCounter = IntCounter::new(
        "transport_receive_failures",
        "Transport receive errors (retried with backoff)"
    )
    .expect("metric can not be created");

    pub static ref INVALIDATION_RUNS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "invalidation_runs",
            "Cache invalidation handler executions by outcome"
        ),
        &["outcome"]
    )
    .expect("metric can not be created");

    pub static ref INVALIDATION_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "invalidation_duration_seconds",
            "Duration of cache invalidation handler executions"
        )
        .buckets(exponential_buckets(0.001, 2.0, 14).expect("metric can not be created"))
    )
    .expect("metric can not be created");

    pub static ref SIGNALS_COALESCED: IntCounter = IntCounter::new(
        "signals_coalesced",
        "Invalidation signals absorbed into an already pending run"
    )
    .expect("metric can not be created");

    pub static ref LIVE_WATCHES: IntGauge = IntGauge::new(
        "live_watches",
        "Currently live table watches"
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

/// Register the engine's collectors on the shared registry. Idempotent per
/// process: re-registration errors are logged and ignored.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(CHANGE_BATCHES_RECEIVED.clone()),
        Box::new(CHANGE_BATCHES_DROPPED.clone()),
        Box::new(TRANSPORT_RECEIVE_FAILURES.clone()),
        Box::new(INVALIDATION_RUNS.clone()),
        Box::new(INVALIDATION_DURATION_SECONDS.clone()),
        Box::new(SIGNALS_COALESCED.clone()),
        Box::new(LIVE_WATCHES.clone()),
    ];
    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            warn!("metric registration skipped: {e}");
        }
    }
}

/// Snapshot of all engine metric families, for embedders exporting them.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}
