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

/// Installs a global meter provider exporting over OTLP. Without it every
/// meter in this crate is a no-op.
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
        .with_attribute(KeyValue::new("service.namespace", "radar"))
        .with_attribute(KeyValue::new("service.name", "radar-pipeline"))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
        .with_attribute(KeyValue::new(
            "radar.instance.id",
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

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

pub mod blob_storage {
    use opentelemetry::metrics::Histogram;

    use crate::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub operations: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("blob-storage");

            let operations = meter
                .f64_histogram("radar.blob_operations_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("blob store latencies in seconds")
                .build();

            Metrics { operations }
        }
    }
}

pub mod pipeline {
    use opentelemetry::{
        metrics::{Counter, Histogram},
        KeyValue,
    };

    use crate::low_latency_boundaries;

    #[derive(Debug, Clone)]
    pub struct Metrics {
        pub records: Counter<u64>,
        pub artifacts_published: Counter<u64>,
        pub blobs_deleted: Counter<u64>,
        pub stage_duration: Histogram<f64>,
        pub run_duration: Histogram<f64>,
        pub failed_runs: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("radar-pipeline");

            let records = meter
                .u64_counter("radar.pipeline_records")
                .with_description("records seen by a stage, labelled by stage and outcome")
                .build();
            let artifacts_published = meter
                .u64_counter("radar.artifacts_published")
                .with_description("number of rendered artifacts uploaded and indexed")
                .build();
            let blobs_deleted = meter
                .u64_counter("radar.blobs_deleted")
                .with_description("number of blobs removed by cleanup")
                .build();
            let stage_duration = meter
                .f64_histogram("radar.stage_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("pipeline stage latencies in seconds")
                .build();
            let run_duration = meter
                .f64_histogram("radar.run_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("end to end run latencies in seconds")
                .build();
            let failed_runs = meter
                .u64_counter("radar.failed_runs")
                .with_description("number of product runs that ended in the failed state")
                .build();

            Metrics {
                records,
                artifacts_published,
                blobs_deleted,
                stage_duration,
                run_duration,
                failed_runs,
            }
        }

        /// Records the attempted/succeeded/skipped tally of one stage.
        pub fn record_stage(&self, stage: &'static str, product: &str, tally: (u64, u64, u64)) {
            let (attempted, succeeded, skipped) = tally;
            for (outcome, value) in [
                ("attempted", attempted),
                ("succeeded", succeeded),
                ("skipped", skipped),
            ] {
                self.records.add(
                    value,
                    &[
                        KeyValue::new("stage", stage),
                        KeyValue::new("product", product.to_string()),
                        KeyValue::new("outcome", outcome),
                    ],
                );
            }
        }
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
