use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0,
        500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0, 10000.0,
    ]
}

pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: &str,
    service_version: &str,
) -> Result<Option<SdkMeterProvider>> {
    if !enable_metrics {
        return Ok(None);
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "gap-backfill"))
        .with_attribute(KeyValue::new("service.name", "gap-backfill-server"))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
        .with_attribute(KeyValue::new(
            "service.instance.id",
            instance_id.to_string(),
        ))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider.clone());
    Ok(Some(provider))
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the time between its creation and drop on the wrapped metric.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

pub trait AutoIncrement {
    fn increment(&self, labels: &[KeyValue]);
}

impl AutoIncrement for Counter<u64> {
    fn increment(&self, labels: &[KeyValue]) {
        self.add(1, labels);
    }
}

pub struct Increment<'a, T: AutoIncrement + Sync> {
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: AutoIncrement + Sync> Increment<'a, T> {
    pub fn inc(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self { metric, labels }
    }
}

impl<'a, T: AutoIncrement + Sync> Drop for Increment<'a, T> {
    fn drop(&mut self) {
        self.metric.increment(self.labels);
    }
}

/// Status class label for a device method result, e.g. `2xx`.
pub fn status_class(status: u16) -> String {
    format!("{}xx", status / 100)
}

pub mod store {
    use opentelemetry::metrics::{Counter, Histogram};

    use crate::low_latency_boundaries;

    #[derive(Debug, Clone)]
    pub struct Metrics {
        pub operations: Histogram<f64>,
        pub errors: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("gap-engine");

            let operations = meter
                .f64_histogram("gap_backfill.store_operation_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("relational store operation latencies in seconds")
                .build();

            let errors = meter
                .u64_counter("gap_backfill.store_errors")
                .with_description("number of failed relational store operations")
                .build();

            Metrics { operations, errors }
        }
    }
}

pub mod queue {
    use opentelemetry::metrics::Counter;

    #[derive(Debug, Clone)]
    pub struct Metrics {
        pub messages_sent: Counter<u64>,
        pub send_errors: Counter<u64>,
        pub messages_expired: Counter<u64>,
        pub redeliveries: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("queues");

            let messages_sent = meter
                .u64_counter("gap_backfill.queue_messages_sent")
                .with_description("number of messages handed to a queue or stream")
                .build();
            let send_errors = meter
                .u64_counter("gap_backfill.queue_send_errors")
                .with_description("number of failed queue or stream sends")
                .build();
            let messages_expired = meter
                .u64_counter("gap_backfill.queue_messages_expired")
                .with_description("number of queue messages dropped after their time-to-live")
                .build();
            let redeliveries = meter
                .u64_counter("gap_backfill.queue_redeliveries")
                .with_description("number of messages redelivered after a failed invocation")
                .build();

            Metrics {
                messages_sent,
                send_errors,
                messages_expired,
                redeliveries,
            }
        }
    }
}

pub mod pipeline {
    use opentelemetry::metrics::{Counter, Histogram};

    use crate::low_latency_boundaries;

    #[derive(Debug, Clone)]
    pub struct Metrics {
        pub gaps_detected: Counter<u64>,
        pub gap_enqueue_failures: Counter<u64>,
        pub dedup_hits: Counter<u64>,
        pub requests_dispatched: Counter<u64>,
        pub device_calls: Counter<u64>,
        pub retry_attempts: Counter<u64>,
        pub invocation_failures: Counter<u64>,
        pub invocation_duration: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("backfill-pipeline");

            let gaps_detected = meter
                .u64_counter("gap_backfill.gaps_detected")
                .with_description("number of data gaps found by the gap detector")
                .build();
            let gap_enqueue_failures = meter
                .u64_counter("gap_backfill.gap_enqueue_failures")
                .with_description("number of detected gaps that could not be scheduled")
                .build();
            let dedup_hits = meter
                .u64_counter("gap_backfill.dedup_hits")
                .with_description("number of gaps skipped because an active request covers them")
                .build();
            let requests_dispatched = meter
                .u64_counter("gap_backfill.requests_dispatched")
                .with_description("number of backfill requests published for execution")
                .build();
            let device_calls = meter
                .u64_counter("gap_backfill.device_calls")
                .with_description("number of backfill device method calls by status class")
                .build();
            let retry_attempts = meter
                .u64_counter("gap_backfill.retry_attempts")
                .with_description("number of device calls made by the retry handler")
                .build();
            let invocation_failures = meter
                .u64_counter("gap_backfill.invocation_failures")
                .with_description("number of failed component invocations")
                .build();
            let invocation_duration = meter
                .f64_histogram("gap_backfill.invocation_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("component invocation latency in seconds")
                .build();

            Metrics {
                gaps_detected,
                gap_enqueue_failures,
                dedup_hits,
                requests_dispatched,
                device_calls,
                retry_attempts,
                invocation_failures,
                invocation_duration,
            }
        }
    }
}
