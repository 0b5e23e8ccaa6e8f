//! OpenTelemetry initialization and configuration.
//!
//! Every exported signal carries the pipeline's resource: service name,
//! version and namespace, plus the retention and timeout settings the
//! process was started with, so a dashboard can tell two deployments
//! with different replay windows apart. Without an OTLP endpoint only
//! the local fmt layer is installed.

pub mod metrics;
pub mod spans;

use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::{Error, Result};

/// Service name reported by the pipeline binary.
pub const SERVICE_NAME: &str = "observatory";

/// Namespace shared by every process of the pipeline.
pub const SERVICE_NAMESPACE: &str = "agent-observability";

/// Transport crates whose own diagnostics would be fed back into the
/// OTLP log exporter that produced them.
const EXPORTER_TARGETS: [&str; 4] = ["h2", "hyper", "tonic", "tower"];

/// Configuration for telemetry initialization.
pub struct TelemetryConfig {
    /// Optional OTLP endpoint (e.g. "http://localhost:4317").
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter used when `RUST_LOG` is not set (e.g. "info" or "observatory=debug").
    pub default_filter: String,
    /// Attributes added to the resource next to the service identity.
    pub resource_attributes: Vec<KeyValue>,
}

impl TelemetryConfig {
    /// Local-only telemetry: fmt output, no OTLP export.
    pub fn local(service_name: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            service_name: service_name.into(),
            default_filter: "info".to_string(),
            resource_attributes: Vec::new(),
        }
    }

    /// Telemetry for the pipeline process, described by its settings.
    pub fn from_config(config: &Config) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            service_name: SERVICE_NAME.to_string(),
            default_filter: config.log_level.clone(),
            resource_attributes: pipeline_attributes(config),
        }
    }

    fn resource(&self) -> Resource {
        use opentelemetry_semantic_conventions::resource::SERVICE_VERSION;

        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attribute(KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")))
            .with_attribute(KeyValue::new("service.namespace", SERVICE_NAMESPACE))
            .with_attributes(self.resource_attributes.iter().cloned())
            .build()
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.default_filter));
        if self.endpoint.is_some() {
            for target in EXPORTER_TARGETS {
                let directive = format!("{target}=off").parse().map_err(|e| {
                    Error::Other(format!("invalid filter directive for {target}: {e}"))
                })?;
                filter = filter.add_directive(directive);
            }
        }
        Ok(filter)
    }
}

/// Resource attributes describing how the pipeline is tuned.
pub fn pipeline_attributes(config: &Config) -> Vec<KeyValue> {
    vec![
        KeyValue::new("observatory.replay_capacity", as_i64(config.replay_capacity)),
        KeyValue::new(
            "observatory.retained_executions",
            as_i64(config.retained_executions),
        ),
        KeyValue::new(
            "observatory.summary_max_chars",
            as_i64(config.summary_max_chars),
        ),
        KeyValue::new(
            "observatory.write_timeout_ms",
            millis(config.write_timeout),
        ),
        KeyValue::new(
            "observatory.heartbeat_interval_ms",
            millis(config.heartbeat_interval),
        ),
    ]
}

fn as_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn millis(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

struct Providers {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl Providers {
    fn otlp(endpoint: &str, resource: Resource) -> Result<Self> {
        use opentelemetry_otlp::WithExportConfig as _;

        let span_exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| Error::Other(format!("failed to create OTLP span exporter: {e}")))?;
        let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| Error::Other(format!("failed to create OTLP metric exporter: {e}")))?;
        let log_exporter = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| Error::Other(format!("failed to create OTLP log exporter: {e}")))?;

        let providers = Self {
            tracer: SdkTracerProvider::builder()
                .with_batch_exporter(span_exporter)
                .with_resource(resource.clone())
                .build(),
            meter: SdkMeterProvider::builder()
                .with_periodic_exporter(metric_exporter)
                .with_resource(resource.clone())
                .build(),
            logger: SdkLoggerProvider::builder()
                .with_batch_exporter(log_exporter)
                .with_resource(resource)
                .build(),
        };
        opentelemetry::global::set_meter_provider(providers.meter.clone());
        Ok(providers)
    }
}

/// Guard that shuts down OTel providers on drop.
///
/// Must be held for the lifetime of the application. Logs are flushed
/// first so shutdown diagnostics still reach the collector.
pub struct TelemetryGuard {
    providers: Option<Providers>,
}

impl TelemetryGuard {
    /// Whether signals are being exported over OTLP.
    pub fn is_exporting(&self) -> bool {
        self.providers.is_some()
    }

    /// Force-flush all telemetry pipelines.
    pub fn force_flush(&self) {
        if let Some(providers) = &self.providers {
            let _ = providers.tracer.force_flush();
            let _ = providers.meter.force_flush();
            let _ = providers.logger.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(providers) = self.providers.take() {
            let _ = providers.logger.shutdown();
            let _ = providers.meter.shutdown();
            let _ = providers.tracer.shutdown();
        }
    }
}

/// Initialize telemetry (tracing + metrics + logs via OTel).
///
/// # Errors
///
/// Returns an error if any OTLP exporter fails to build or the tracing
/// subscriber cannot be initialized (e.g. if one was already set).
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter = config.env_filter()?;
    let providers = match &config.endpoint {
        Some(endpoint) => Some(Providers::otlp(endpoint, config.resource())?),
        None => None,
    };

    let trace_layer = providers
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer.tracer(SERVICE_NAME)));
    let log_layer = providers.as_ref().map(|p| {
        opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&p.logger)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    Ok(TelemetryGuard { providers })
}
