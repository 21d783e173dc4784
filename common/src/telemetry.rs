// Telemetry module for structured logging, metrics, and tracing

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "partition-trigger";

/// Initialize structured logging with JSON formatting and trace context
///
/// RUST_LOG takes precedence over `log_level`. When `tracing_endpoint` is set,
/// spans are also exported over OTLP.
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized with JSON formatting"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(
        endpoint = endpoint,
        "OpenTelemetry tracer initialized with OTLP exporter"
    );

    Ok(tracer)
}

/// Flush remaining spans on shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Install the Prometheus exporter and describe all metrics
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "run_requests_emitted_total",
        "Run requests accepted by the executor, per trigger"
    );
    describe_counter!(
        "run_requests_rejected_total",
        "Run requests the executor treated as duplicates, per trigger"
    );
    describe_counter!(
        "trigger_errors_total",
        "Per-key or per-tick trigger errors, by kind"
    );
    describe_counter!("sensor_skips_total", "Sensor ticks that found no new work");
    describe_counter!(
        "missed_intervals_total",
        "Timer intervals skipped because a tick was still running"
    );
    describe_counter!("step_retries_total", "Step attempts retried after a failure");
    describe_counter!("runs_completed_total", "Runs reaching a terminal status");
    describe_histogram!("run_duration_seconds", "Wall-clock duration of runs");

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_request_emitted(trigger: &str) {
    counter!("run_requests_emitted_total", "trigger" => trigger.to_string()).increment(1);
}

#[inline]
pub fn record_request_rejected(trigger: &str) {
    counter!("run_requests_rejected_total", "trigger" => trigger.to_string()).increment(1);
}

#[inline]
pub fn record_trigger_error(trigger: &str, kind: &'static str) {
    counter!(
        "trigger_errors_total",
        "trigger" => trigger.to_string(),
        "kind" => kind
    )
    .increment(1);
}

#[inline]
pub fn record_sensor_skip(sensor: &str) {
    counter!("sensor_skips_total", "sensor" => sensor.to_string()).increment(1);
}

#[inline]
pub fn record_missed_intervals(trigger: &str, missed: u64) {
    counter!("missed_intervals_total", "trigger" => trigger.to_string()).increment(missed);
}

#[inline]
pub fn record_trigger_run_outcome(trigger: &str, status: &'static str) {
    counter!(
        "trigger_runs_completed_total",
        "trigger" => trigger.to_string(),
        "status" => status
    )
    .increment(1);
}

#[inline]
pub fn record_step_retry(step_id: &str) {
    counter!("step_retries_total", "step" => step_id.to_string()).increment(1);
}

#[inline]
pub fn record_run_completed(status: &'static str, duration_seconds: f64) {
    counter!("runs_completed_total", "status" => status).increment(1);
    histogram!("run_duration_seconds", "status" => status).record(duration_seconds);
}
