//! Tracing initialisation: console logging through `tracing-subscriber`, plus optional
//! OpenTelemetry export.
//!
//! OTLP export is **disabled by default** and is switched on with `enable_otel_export: true`.
//! When enabled, the exporter is configured through the standard OpenTelemetry environment
//! variables:
//!
//! - `OTEL_EXPORTER_OTLP_ENDPOINT` - The OTLP endpoint URL (default `http://localhost:4318`)
//! - `OTEL_EXPORTER_OTLP_PROTOCOL` - `http/protobuf` (default) or `http/json`
//! - `OTEL_EXPORTER_OTLP_HEADERS` - Comma-separated `key=value` pairs; `%20` decodes to a space
//! - `OTEL_SERVICE_NAME` - Service name for resource identification (default `splitter`)
//!
//! Log verbosity follows `RUST_LOG` and defaults to `info`.

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::{Protocol, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Provider kept for shutdown; `tracing-opentelemetry` only holds the tracer, so pending spans
/// can only be flushed through this reference.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Initialize tracing with optional OpenTelemetry support.
///
/// If OTLP export is requested but the exporter cannot be built, console logging is still
/// installed and the failure is logged.
pub fn init_telemetry(enable_otel_export: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if !enable_otel_export {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()?;

        info!("Telemetry initialized (OTLP export disabled)");
        return Ok(());
    }

    match create_otlp_tracer() {
        Ok(tracer) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()?;

            info!("Telemetry initialized with OTLP export enabled");
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()?;

            info!("Telemetry initialized without OTLP export: {}", e);
        }
    }

    Ok(())
}

/// Parse `OTEL_EXPORTER_OTLP_HEADERS` style `key=value,key2=value2` pairs.
fn parse_otlp_headers(raw: &str) -> HashMap<String, String> {
    raw.replace("%20", " ")
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

fn create_otlp_tracer() -> anyhow::Result<opentelemetry_sdk::trace::Tracer> {
    let service_name = std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "splitter".to_string());
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_else(|_| "http://localhost:4318".to_string());

    let headers = std::env::var("OTEL_EXPORTER_OTLP_HEADERS")
        .map(|raw| parse_otlp_headers(&raw))
        .unwrap_or_default();

    let protocol = match std::env::var("OTEL_EXPORTER_OTLP_PROTOCOL").as_deref() {
        Ok("http/json") => Protocol::HttpJson,
        _ => Protocol::HttpBinary,
    };

    eprintln!(
        "[OTLP] service={} endpoint={} headers={}",
        service_name,
        endpoint,
        headers.len()
    );

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(&endpoint)
        .with_protocol(protocol)
        .with_headers(headers)
        .build()?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            opentelemetry_sdk::Resource::builder()
                .with_attribute(KeyValue::new("service.name", service_name.clone()))
                .build(),
        )
        .build();

    let tracer = tracer_provider.tracer(service_name);
    let _ = TRACER_PROVIDER.set(tracer_provider);

    Ok(tracer)
}

/// Flush and shut down the tracer provider, if one was installed.
pub fn shutdown_telemetry() {
    if let Some(provider) = TRACER_PROVIDER.get()
        && let Err(e) = provider.shutdown()
    {
        tracing::error!("Failed to shutdown tracer provider: {}", e);
    }
}
