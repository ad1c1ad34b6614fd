//! Metrics for the registration pipeline
//!
//! Each phase (gateway, queue, consumer) defines its own metrics in a
//! dedicated submodule so names stay owned by one place.

pub mod consumer;
pub mod gateway;
pub mod queue;

pub use consumer::ConsumerMetrics;
pub use gateway::GatewayMetrics;
pub use queue::QueueMetrics;

use std::collections::HashSet;
use std::sync::{Once, OnceLock};
use tracing::{info, warn};

static INIT: Once = Once::new();
static HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

/// Initialize the global metrics infrastructure
///
/// Idempotent. Installs a Prometheus recorder, with an HTTP exporter only
/// when DEVICE_PIPELINE_METRICS_ADDR is set, then registers every phase's
/// metric descriptions.
pub fn init_metrics() {
    INIT.call_once(|| {
        let mut builder = metrics_exporter_prometheus::PrometheusBuilder::new();

        if let Ok(addr_str) = std::env::var("DEVICE_PIPELINE_METRICS_ADDR") {
            match addr_str.parse::<std::net::SocketAddr>() {
                Ok(addr) => {
                    builder = builder.with_http_listener(addr);
                    info!("Prometheus HTTP exporter listening on http://{}/metrics", addr);
                }
                Err(e) => warn!("Invalid metrics addr '{}': {}", addr_str, e),
            }
        }

        match builder.install_recorder() {
            Ok(handle) => {
                if HANDLE.set(handle).is_err() {
                    warn!("Prometheus handle was already stored");
                }
                describe_all_phases();
            }
            Err(e) => {
                warn!("Failed to install Prometheus recorder: {}", e);
            }
        }
    });
}

/// Describe every phase's metrics to the recorder and flag names that two
/// phases both claim.
fn describe_all_phases() {
    GatewayMetrics::register_metrics();
    QueueMetrics::register_metrics();
    ConsumerMetrics::register_metrics();

    let docs = all_metric_docs();
    for name in duplicate_metric_names(&docs) {
        warn!("Metric name conflict detected: '{}'", name);
    }
    info!("Registered {} metrics across all phases", docs.len());
}

fn all_metric_docs() -> Vec<MetricDoc> {
    GatewayMetrics::metrics_documentation()
        .into_iter()
        .chain(QueueMetrics::metrics_documentation())
        .chain(ConsumerMetrics::metrics_documentation())
        .collect()
}

fn duplicate_metric_names(docs: &[MetricDoc]) -> Vec<&'static str> {
    let mut seen = HashSet::new();
    docs.iter()
        .map(|d| d.name)
        .filter(|name| !seen.insert(*name))
        .collect()
}

/// Render the current metrics snapshot in Prometheus text format, if a
/// recorder was installed.
pub fn render() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// Trait for phase-specific metrics collections
pub trait PhaseMetrics {
    /// Describe all metrics of this phase to the recorder
    fn register_metrics();

    fn phase_name() -> &'static str;

    fn metrics_documentation() -> Vec<MetricDoc>;
}

/// Documentation for a single metric
#[derive(Debug, Clone)]
pub struct MetricDoc {
    pub name: &'static str,
    pub metric_type: MetricType,
    pub help: &'static str,
}

#[derive(Debug, Clone)]
pub enum MetricType {
    Counter,
    Histogram,
    Gauge,
}

/// Metric names follow devreg_{phase}_{metric_name}[_total]
macro_rules! phase_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("devreg_", $phase, "_", $name, "_total")
    };
    (histogram, $phase:literal, $name:literal) => {
        concat!("devreg_", $phase, "_", $name)
    };
    (gauge, $phase:literal, $name:literal) => {
        concat!("devreg_", $phase, "_", $name)
    };
}

pub(crate) use phase_metric;
