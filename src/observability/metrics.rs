//! OpenTelemetry metrics.
//!
//! Key metrics:
//! - tidings_notifications_total: Counter of dispatches by outcome
//! - tidings_persist_failures_total: Counter of failed history writes
//! - tidings_backlog_replayed_total: Counter of queued notifications replayed
//! - tidings_active_sessions: Up/down counter of live sessions
//! - tidings_fanout_recipients_total: Counter of fan-out recipients by topic

use opentelemetry::metrics::{Counter, Meter, UpDownCounter};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use std::sync::OnceLock;

/// Global metrics instance.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Tidings metrics registry.
#[derive(Debug)]
pub struct Metrics {
    pub notifications_total: Counter<u64>,
    pub persist_failures: Counter<u64>,
    pub backlog_replayed: Counter<u64>,
    pub active_sessions: UpDownCounter<i64>,
    pub fanout_recipients: Counter<u64>,
}

impl Metrics {
    fn new(meter: &Meter) -> Self {
        Self {
            notifications_total: meter
                .u64_counter("tidings_notifications_total")
                .with_description("Notifications dispatched, by outcome (delivered, queued, failed)")
                .with_unit("1")
                .init(),
            persist_failures: meter
                .u64_counter("tidings_persist_failures_total")
                .with_description("Notifications that could not be written to history")
                .with_unit("1")
                .init(),
            backlog_replayed: meter
                .u64_counter("tidings_backlog_replayed_total")
                .with_description("Queued notifications replayed to reconnecting users")
                .with_unit("1")
                .init(),
            active_sessions: meter
                .i64_up_down_counter("tidings_active_sessions")
                .with_description("Live connection sessions")
                .with_unit("1")
                .init(),
            fanout_recipients: meter
                .u64_counter("tidings_fanout_recipients_total")
                .with_description("Subscribers dispatched to by topic fan-out")
                .with_unit("1")
                .init(),
        }
    }
}

fn manual_provider() -> SdkMeterProvider {
    let reader = ManualReader::builder().build();
    SdkMeterProvider::builder().with_reader(reader).build()
}

/// Initialize the metrics system.
///
/// This should be called once at startup. Subsequent calls are ignored.
///
/// # Arguments
///
/// * `otel_endpoint` - Optional OTLP endpoint for metrics export
pub fn init_metrics_with_endpoint(otel_endpoint: Option<&str>) {
    METRICS.get_or_init(|| {
        if let Some(endpoint) = otel_endpoint {
            use opentelemetry_otlp::{Protocol, WithExportConfig};

            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_protocol(Protocol::Grpc);

            match opentelemetry_otlp::new_pipeline()
                .metrics(opentelemetry_sdk::runtime::Tokio)
                .with_exporter(exporter)
                .with_period(std::time::Duration::from_secs(10))
                .build()
            {
                Ok(provider) => {
                    global::set_meter_provider(provider);
                    tracing::info!(endpoint, "OTLP metrics exporter configured");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create OTLP exporter, using no-op metrics");
                    global::set_meter_provider(manual_provider());
                }
            }
        } else {
            // Recorded but not exported
            global::set_meter_provider(manual_provider());
        }

        let meter = global::meter("tidings");
        Metrics::new(&meter)
    });
}

/// Initialize the metrics system without OTLP export.
pub fn init_metrics() {
    init_metrics_with_endpoint(None);
}

/// Record the outcome of one dispatch.
pub fn record_delivery(outcome: &'static str) {
    if let Some(m) = METRICS.get() {
        m.notifications_total
            .add(1, &[KeyValue::new("outcome", outcome)]);
    }
}

pub fn record_persist_failure() {
    if let Some(m) = METRICS.get() {
        m.persist_failures.add(1, &[]);
    }
}

pub fn record_backlog_replayed(count: u64) {
    if let Some(m) = METRICS.get() {
        m.backlog_replayed.add(count, &[]);
    }
}

pub fn record_session_opened() {
    if let Some(m) = METRICS.get() {
        m.active_sessions.add(1, &[]);
    }
}

pub fn record_session_closed() {
    if let Some(m) = METRICS.get() {
        m.active_sessions.add(-1, &[]);
    }
}

/// Record one fan-out of `topic` to `recipients` subscribers.
pub fn record_fanout(topic: &str, recipients: u64) {
    if let Some(m) = METRICS.get() {
        m.fanout_recipients
            .add(recipients, &[KeyValue::new("topic", topic.to_string())]);
    }
}
