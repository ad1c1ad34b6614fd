//! Queue Phase Metrics

use crate::metrics::{phase_metric, MetricDoc, MetricType, PhaseMetrics};

pub struct QueueMetrics;

impl QueueMetrics {
    pub fn record_enqueued(queue: &str, depth: usize) {
        ::metrics::counter!(
            phase_metric!(counter, "queue", "messages_enqueued"),
            "queue" => queue.to_string()
        )
        .increment(1);
        Self::record_depth(queue, depth);
    }

    pub fn record_dequeued(queue: &str, depth: usize) {
        ::metrics::counter!(
            phase_metric!(counter, "queue", "messages_dequeued"),
            "queue" => queue.to_string()
        )
        .increment(1);
        Self::record_depth(queue, depth);
    }

    pub fn record_full(queue: &str) {
        ::metrics::counter!(
            phase_metric!(counter, "queue", "full_rejections"),
            "queue" => queue.to_string()
        )
        .increment(1);
    }

    fn record_depth(queue: &str, depth: usize) {
        ::metrics::gauge!(phase_metric!(gauge, "queue", "depth"), "queue" => queue.to_string())
            .set(depth as f64);
    }
}

impl PhaseMetrics for QueueMetrics {
    fn register_metrics() {
        use metrics::{describe_counter, describe_gauge};

        describe_counter!(
            phase_metric!(counter, "queue", "messages_enqueued"),
            "Total number of messages enqueued"
        );
        describe_counter!(
            phase_metric!(counter, "queue", "messages_dequeued"),
            "Total number of messages handed to a consumer"
        );
        describe_counter!(
            phase_metric!(counter, "queue", "full_rejections"),
            "Total number of enqueues refused because the queue was full"
        );
        describe_gauge!(
            phase_metric!(gauge, "queue", "depth"),
            "Messages waiting in the queue"
        );
    }

    fn phase_name() -> &'static str {
        "queue"
    }

    fn metrics_documentation() -> Vec<MetricDoc> {
        vec![
            MetricDoc {
                name: phase_metric!(counter, "queue", "messages_enqueued"),
                metric_type: MetricType::Counter,
                help: "Total number of messages enqueued",
            },
            MetricDoc {
                name: phase_metric!(counter, "queue", "messages_dequeued"),
                metric_type: MetricType::Counter,
                help: "Total number of messages handed to a consumer",
            },
            MetricDoc {
                name: phase_metric!(counter, "queue", "full_rejections"),
                metric_type: MetricType::Counter,
                help: "Total number of enqueues refused because the queue was full",
            },
            MetricDoc {
                name: phase_metric!(gauge, "queue", "depth"),
                metric_type: MetricType::Gauge,
                help: "Messages waiting in the queue",
            },
        ]
    }
}
