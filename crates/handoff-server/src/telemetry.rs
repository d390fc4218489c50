//! Logging and OpenTelemetry setup for handoff-server.
//!
//! Logs are structured JSON on stdout so a predecessor and its successor,
//! which share the same stdout, interleave into one readable stream.
//! Traces and metrics are exported over OTLP when a collector is configured.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    trace::SdkTracerProvider,
    Resource,
};
use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Instrumentation scope and default `service.name`.
const SERVICE_NAME: &str = "handoff-server";

/// The global tracer provider, stored for shutdown.
static TRACER_PROVIDER: std::sync::OnceLock<SdkTracerProvider> = std::sync::OnceLock::new();

/// The global meter provider, stored for shutdown.
static METER_PROVIDER: std::sync::OnceLock<SdkMeterProvider> = std::sync::OnceLock::new();

type InitError = Box<dyn std::error::Error + Send + Sync>;

/// Where telemetry goes, decided once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryMode {
    /// JSON logs on stdout only.
    Local,
    /// JSON logs plus traces and metrics exported to an OTLP collector.
    Otlp { endpoint: String },
}

impl TelemetryMode {
    /// `Otlp` when `OTEL_EXPORTER_OTLP_ENDPOINT` is set and non-empty.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        match lookup("OTEL_EXPORTER_OTLP_ENDPOINT") {
            Some(endpoint) if !endpoint.trim().is_empty() => TelemetryMode::Otlp {
                endpoint: endpoint.trim().to_string(),
            },
            _ => TelemetryMode::Local,
        }
    }
}

/// Resource describing this process. Each process in a restart chain
/// reports its own `process.pid`.
///
/// `OTEL_SERVICE_NAME` and `OTEL_SERVICE_VERSION` override the defaults.
fn build_resource(lookup: impl Fn(&str) -> Option<String>) -> Resource {
    let service_name = lookup("OTEL_SERVICE_NAME").unwrap_or_else(|| SERVICE_NAME.to_string());
    let service_version =
        lookup("OTEL_SERVICE_VERSION").unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

    Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", service_name),
            KeyValue::new("service.version", service_version),
            KeyValue::new("process.pid", i64::from(std::process::id())),
        ])
        .build()
}

fn default_filter() -> EnvFilter {
    EnvFilter::new("info,handoff=debug,handoff_server=debug")
}

/// Expand a bare level into a directive for both crates; pass filters through.
fn filter_directive(level_or_filter: &str) -> Option<String> {
    let level_or_filter = level_or_filter.trim();
    if level_or_filter.is_empty() {
        return None;
    }
    if level_or_filter.contains('=') || level_or_filter.contains(',') {
        Some(level_or_filter.to_string())
    } else {
        Some(format!(
            "{level},handoff={level},handoff_server={level}",
            level = level_or_filter
        ))
    }
}

fn build_log_filter() -> EnvFilter {
    let directive = std::env::var("RUST_LOG").ok().or_else(|| {
        std::env::var("HANDOFF_LOG_LEVEL")
            .ok()
            .as_deref()
            .and_then(filter_directive)
    });

    directive
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(default_filter)
}

fn json_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
}

fn otlp_tracer_provider(endpoint: &str, resource: Resource) -> Result<SdkTracerProvider, InitError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}

fn otlp_meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider, InitError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    Ok(SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter).build())
        .with_resource(resource)
        .build())
}

/// Install the global subscriber for `mode`.
///
/// # Configuration
///
/// Environment variables:
/// - `OTEL_SERVICE_NAME`: Service name (default: handoff-server)
/// - `OTEL_SERVICE_VERSION`: Service version (default: crate version)
/// - `RUST_LOG` / `HANDOFF_LOG_LEVEL`: Log filter (default: info)
pub fn init(mode: &TelemetryMode) -> Result<(), InitError> {
    let registry = tracing_subscriber::registry()
        .with(build_log_filter())
        .with(json_layer());

    match mode {
        TelemetryMode::Local => {
            registry.try_init()?;
            tracing::info!("Local telemetry initialized with JSON logging (no OTLP export)");
        }
        TelemetryMode::Otlp { endpoint } => {
            let resource = build_resource(|key| std::env::var(key).ok());
            let tracer_provider = otlp_tracer_provider(endpoint, resource.clone())?;
            let meter_provider = otlp_meter_provider(endpoint, resource)?;

            let tracer = tracer_provider.tracer(SERVICE_NAME);
            let _ = TRACER_PROVIDER.set(tracer_provider);
            let _ = METER_PROVIDER.set(meter_provider.clone());
            opentelemetry::global::set_meter_provider(meter_provider);

            registry
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()?;
            tracing::info!(endpoint = %endpoint, "OpenTelemetry initialized with OTLP export");
        }
    }

    Ok(())
}

/// Flush pending spans and metrics. Call before process exit.
pub fn shutdown() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::error!(error = %e, "Error shutting down tracer provider");
        }
    }

    if let Some(provider) = METER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::error!(error = %e, "Error shutting down meter provider");
        }
    }

    tracing::info!("Telemetry shutdown complete");
}

pub mod metrics {
    use opentelemetry::metrics::Counter;
    use std::sync::OnceLock;

    /// Counter for `/hello` requests served by this process.
    pub fn hello_requests() -> &'static Counter<u64> {
        static COUNTER: OnceLock<Counter<u64>> = OnceLock::new();
        COUNTER.get_or_init(|| {
            opentelemetry::global::meter("handoff-server")
                .u64_counter("http.hello.requests")
                .with_description("Total /hello requests served by this process")
                .with_unit("request")
                .build()
        })
    }
}
