//! Gateway Phase Metrics
//!
//! Registrations accepted by the gateway and the reasons requests were
//! turned away.

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

/// Metrics collection for the Registration Gateway phase
pub struct GatewayMetrics;

impl GatewayMetrics {
    /// Record a registration accepted with 202
    pub fn record_registration_accepted(duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "gateway", "registrations_accepted"))
            .increment(1);
        ::metrics::histogram!(phase_metric!(histogram, "gateway", "register_duration_seconds"))
            .record(duration_secs);
    }

    /// Record a rejected registration; `reason` is a short error kind
    pub fn record_registration_rejected(reason: &'static str) {
        ::metrics::counter!(
            phase_metric!(counter, "gateway", "registrations_rejected"),
            "reason" => reason
        )
        .increment(1);
    }

    /// Record a status lookup
    pub fn record_status_lookup(found: bool) {
        let outcome = if found { "found" } else { "not_found" };
        ::metrics::counter!(
            phase_metric!(counter, "gateway", "status_lookups"),
            "outcome" => outcome
        )
        .increment(1);
    }
}

impl PhaseMetrics for GatewayMetrics {
    fn register_metrics() {
        use metrics::{describe_counter, describe_histogram};

        describe_counter!(
            phase_metric!(counter, "gateway", "registrations_accepted"),
            "Total number of registrations accepted and queued"
        );
        describe_counter!(
            phase_metric!(counter, "gateway", "registrations_rejected"),
            "Total number of registration requests rejected, by reason"
        );
        describe_counter!(
            phase_metric!(counter, "gateway", "status_lookups"),
            "Total number of status lookups"
        );
        describe_histogram!(
            phase_metric!(histogram, "gateway", "register_duration_seconds"),
            "Time spent accepting a registration"
        );
    }

    fn phase_name() -> &'static str {
        "gateway"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "gateway", "registrations_accepted"),
                metric_type: MetricType::Counter,
                help: "Total number of registrations accepted and queued",
            },
            MetricDoc {
                name: phase_metric!(counter, "gateway", "registrations_rejected"),
                metric_type: MetricType::Counter,
                help: "Total number of registration requests rejected, by reason",
            },
            MetricDoc {
                name: phase_metric!(counter, "gateway", "status_lookups"),
                metric_type: MetricType::Counter,
                help: "Total number of status lookups",
            },
            MetricDoc {
                name: phase_metric!(histogram, "gateway", "register_duration_seconds"),
                metric_type: MetricType::Histogram,
                help: "Time spent accepting a registration",
            },
        ]
    }
}
