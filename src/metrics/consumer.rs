//! Consumer Phase Metrics
//!
//! Outcomes of registration processing and the latency of downstream
//! ingestion calls.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct ConsumerMetrics;

impl ConsumerMetrics {
    pub fn record_acknowledged(attempts: u32) {
        ::metrics::counter!(phase_metric!(counter, "consumer", "acknowledged")).increment(1);
        ::metrics::histogram!(phase_metric!(histogram, "consumer", "attempts_per_registration"))
            .record(attempts as f64);
    }

    pub fn record_retry() {
        ::metrics::counter!(phase_metric!(counter, "consumer", "retries")).increment(1);
    }

    pub fn record_failed(attempts: u32) {
        ::metrics::counter!(phase_metric!(counter, "consumer", "failed")).increment(1);
        ::metrics::histogram!(phase_metric!(histogram, "consumer", "attempts_per_registration"))
            .record(attempts as f64);
    }

    /// A message dropped without processing (unknown device, duplicate
    /// delivery, unexpected status, undecodable payload)
    pub fn record_discarded(reason: &'static str) {
        ::metrics::counter!(
            phase_metric!(counter, "consumer", "discarded"),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn record_delivery_duration(duration_secs: f64) {
        ::metrics::histogram!(phase_metric!(histogram, "consumer", "delivery_duration_seconds"))
            .record(duration_secs);
    }
}

const DOCS: &[(&str, &str)] = &[
    (
        phase_metric!(counter, "consumer", "acknowledged"),
        "Registrations acknowledged by the ingestion system",
    ),
    (
        phase_metric!(counter, "consumer", "retries"),
        "Failed delivery attempts that were scheduled for retry",
    ),
    (
        phase_metric!(counter, "consumer", "failed"),
        "Registrations that reached the terminal failed status",
    ),
    (
        phase_metric!(counter, "consumer", "discarded"),
        "Messages discarded without processing, by reason",
    ),
];

impl PhaseMetrics for ConsumerMetrics {
    fn register_metrics() {
        use metrics::{describe_counter, describe_histogram};

        for (name, help) in DOCS {
            describe_counter!(*name, *help);
        }
        describe_histogram!(
            phase_metric!(histogram, "consumer", "delivery_duration_seconds"),
            "Duration of calls to the ingestion endpoint"
        );
        describe_histogram!(
            phase_metric!(histogram, "consumer", "attempts_per_registration"),
            "Processing attempts used per finished registration"
        );
    }

    fn phase_name() -> &'static str {
        "consumer"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        let mut docs: Vec<MetricDoc> = DOCS
            .iter()
            .map(|&(name, help)| MetricDoc {
                name,
                metric_type: MetricType::Counter,
                help,
            })
            .collect();
        docs.push(MetricDoc {
            name: phase_metric!(histogram, "consumer", "delivery_duration_seconds"),
            metric_type: MetricType::Histogram,
            help: "Duration of calls to the ingestion endpoint",
        });
        docs.push(MetricDoc {
            name: phase_metric!(histogram, "consumer", "attempts_per_registration"),
            metric_type: MetricType::Histogram,
            help: "Processing attempts used per finished registration",
        });
        docs
    }
}
