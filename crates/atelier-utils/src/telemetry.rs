use opentelemetry::{KeyValue, trace::TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    trace::{RandomIdGenerator, SdkTracerProvider},
};
use opentelemetry_semantic_conventions::{SCHEMA_URL, resource::SERVICE_VERSION};
use thiserror::Error;
use tracing_log::LogTracer;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

const NO_TELEMETRY_VAR: &str = "ATELIER_NO_TELEMETRY";
const OTLP_ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to set LogTracer: {0}")]
    LogTracer(#[from] log::SetLoggerError),

    #[error("Failed to set tracing subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("OTLP exporter init failed: {0}")]
    Exporter(#[from] opentelemetry_otlp::ExporterBuildError),
}

/// Flushes and shuts down the span exporter when dropped.
///
/// Keep it alive for the lifetime of the process.
#[must_use]
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    pub fn exporting(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Failed to shut down tracer provider: {e}");
        }
    }
}

/// Build a resource with service name & version
fn resource(service_name: &str, service_version: &str) -> Resource {
    Resource::builder()
        .with_service_name(service_name.to_string())
        .with_schema_url(
            [KeyValue::new(SERVICE_VERSION, service_version.to_string())],
            SCHEMA_URL,
        )
        .build()
}

fn init_tracer_provider(
    service_name: &str,
    service_version: &str,
    endpoint: &str,
) -> Result<SdkTracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource(service_name, service_version))
        .with_batch_exporter(exporter)
        .build())
}

/// Where spans go, if anywhere. Export is opt-in: an endpoint must be set and
/// the kill switch must not be.
fn otlp_endpoint(no_telemetry: Option<String>, endpoint: Option<String>) -> Option<String> {
    if no_telemetry.is_some() {
        return None;
    }
    endpoint.filter(|e| !e.trim().is_empty())
}

/// Setup logging and tracing for a binary.
///
/// # Behavior
/// - `log` records are bridged into `tracing` and printed by an fmt layer
///   filtered by `RUST_LOG`
/// - Spans are exported over OTLP/gRPC only when `OTEL_EXPORTER_OTLP_ENDPOINT`
///   is set and `ATELIER_NO_TELEMETRY` is not
///
/// Must be called at most once per process.
pub fn setup_telemetry(
    service_name: &str,
    service_version: &str,
) -> Result<TelemetryGuard, TelemetryError> {
    LogTracer::init()?;

    let fmt_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);
    let filter = EnvFilter::from_default_env();

    let endpoint = otlp_endpoint(
        std::env::var(NO_TELEMETRY_VAR).ok(),
        std::env::var(OTLP_ENDPOINT_VAR).ok(),
    );
    let Some(endpoint) = endpoint else {
        let subscriber = Registry::default().with(filter).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
        return Ok(TelemetryGuard { provider: None });
    };

    let provider = init_tracer_provider(service_name, service_version, &endpoint)?;
    let tracer = provider.tracer("atelier-tracer");

    let subscriber = Registry::default()
        .with(filter)
        .with(fmt_layer)
        .with(OpenTelemetryLayer::new(tracer));
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(TelemetryGuard {
        provider: Some(provider),
    })
}
