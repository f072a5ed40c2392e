//! Logging and OpenTelemetry initialization.
//!
//! Events always go to stderr through a compact fmt layer. With an OTLP
//! endpoint the bulk spans, the `txbulk` meter and the log events are
//! exported as well, all under one resource describing this process.

pub mod bulk;
pub mod metrics;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{InstrumentationScope, KeyValue};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

use crate::error::{Error, Result};

/// Instrumentation scope shared by the bulk tracer and meter.
pub(crate) fn scope() -> InstrumentationScope {
    InstrumentationScope::builder("txbulk")
        .with_version(env!("CARGO_PKG_VERSION"))
        .build()
}

/// Configuration for telemetry initialization.
pub struct TelemetryConfig {
    /// Optional OTLP endpoint (e.g. "http://localhost:4317").
    pub endpoint: Option<String>,
    /// The service name reported in telemetry signals.
    pub service_name: String,
    /// Filter used when `RUST_LOG` is not set (e.g. "info", "txbulk=debug").
    pub log_level: String,
}

impl TelemetryConfig {
    /// Build from loaded [`Settings`](crate::config::Settings).
    pub fn from_settings(settings: &crate::config::Settings, service_name: &str) -> Self {
        Self {
            endpoint: settings.otel_endpoint.clone(),
            service_name: service_name.to_string(),
            log_level: settings.log_level.clone(),
        }
    }
}

/// Resource attached to every exported signal of one txbulk process.
fn resource(service_name: &str) -> Resource {
    Resource::builder()
        .with_service_name(service_name.to_string())
        .with_attributes([
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("service.instance.id", uuid::Uuid::new_v4().to_string()),
        ])
        .build()
}

fn exporter_error(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

/// The three OTLP pipelines, built and torn down together.
struct Pipelines {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl Pipelines {
    fn build(endpoint: &str, resource: Resource) -> Result<Self> {
        use opentelemetry_otlp::WithExportConfig as _;

        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("span", e))?;
        let metrics = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("metric", e))?;
        let logs = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| exporter_error("log", e))?;

        Ok(Self {
            tracer: SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(resource.clone())
                .build(),
            meter: SdkMeterProvider::builder()
                .with_periodic_exporter(metrics)
                .with_resource(resource.clone())
                .build(),
            logger: SdkLoggerProvider::builder()
                .with_batch_exporter(logs)
                .with_resource(resource)
                .build(),
        })
    }

    fn force_flush(&self) -> Result<()> {
        let failures: Vec<String> = [
            self.tracer.force_flush().err().map(|e| format!("traces: {e}")),
            self.meter.force_flush().err().map(|e| format!("metrics: {e}")),
            self.logger.force_flush().err().map(|e| format!("logs: {e}")),
        ]
        .into_iter()
        .flatten()
        .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Other(format!("telemetry flush failed: {}", failures.join(", "))))
        }
    }

    fn shutdown(self) {
        // Reverse of build order.
        let _ = self.logger.shutdown();
        let _ = self.meter.shutdown();
        let _ = self.tracer.shutdown();
    }
}

/// Guard that shuts down the OTLP pipelines on drop.
///
/// Hold it for the lifetime of the process.
pub struct TelemetryGuard {
    pipelines: Option<Pipelines>,
}

impl TelemetryGuard {
    /// Whether OTLP export is active.
    pub fn is_exporting(&self) -> bool {
        self.pipelines.is_some()
    }

    /// Push everything buffered so far to the collector.
    pub fn force_flush(&self) -> Result<()> {
        match self.pipelines {
            Some(ref pipelines) => pipelines.force_flush(),
            None => Ok(()),
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(pipelines) = self.pipelines.take() {
            pipelines.shutdown();
        }
    }
}

/// Install the global tracing subscriber and, with an endpoint, the OTLP
/// pipelines and the global meter provider.
///
/// # Errors
///
/// Returns [`Error::Config`] for an unparseable log filter, and
/// [`Error::Other`] when an exporter cannot be built or a global
/// subscriber is already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| Error::Config(format!("bad log level {:?}: {e}", config.log_level)))?;

    let pipelines = config
        .endpoint
        .as_deref()
        .map(|endpoint| Pipelines::build(endpoint, resource(&config.service_name)))
        .transpose()?;

    let trace_layer = pipelines.as_ref().map(|p| {
        tracing_opentelemetry::layer().with_tracer(p.tracer.tracer_with_scope(scope()))
    });
    let log_layer = pipelines.as_ref().map(|p| {
        opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&p.logger)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    if let Some(ref p) = pipelines {
        opentelemetry::global::set_meter_provider(p.meter.clone());
    }

    Ok(TelemetryGuard { pipelines })
}
