//! Logging, tracing and metrics setup for the extension binaries
//!
//! Logs go to stdout as JSON (the default) or human readable text. An OTLP
//! endpoint adds span and metric export over gRPC.

use std::fmt;
use std::str::FromStr;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Telemetry setup errors
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter could not be built
    #[error("failed to build OTLP {signal} exporter: {message}")]
    Exporter {
        /// `traces` or `metrics`
        signal: &'static str,
        /// Exporter error
        message: String,
    },

    /// The global subscriber was already set
    #[error("failed to install log subscriber: {0}")]
    Subscriber(String),

    /// Unknown `--log-format` or `--log-level`
    #[error("unknown log {what} {value:?}")]
    UnknownSetting {
        /// `format` or `level`
        what: &'static str,
        /// Value given
        value: String,
    },
}

/// Output format of log lines
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human readable text
    Text,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(LogFormat::Json),
            "text" => Ok(LogFormat::Text),
            other => Err(TelemetryError::UnknownSetting {
                what: "format",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Json => "json",
            LogFormat::Text => "text",
        })
    }
}

/// Verbosity of the extension's own log lines
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Reconcile internals
    Debug,
    /// Operations and their outcome
    #[default]
    Info,
    /// Failures only
    Error,
}

impl FromStr for LogLevel {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "error" => Ok(LogLevel::Error),
            other => Err(TelemetryError::UnknownSetting {
                what: "level",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.directive())
    }
}

impl LogLevel {
    fn directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Error => "error",
        }
    }

    /// Filter for this level: our crates at the level, kube at info at most,
    /// HTTP plumbing at warn
    pub fn filter_directives(&self) -> String {
        let kube = match self {
            LogLevel::Error => "error",
            _ => "info",
        };
        format!(
            "{level},registry_cache_common={level},registry_cache_api={level},\
             registry_cache_controller={level},registry_cache_webhook={level},\
             kube={kube},tower=warn,hyper=warn,rustls=warn",
            level = self.directive(),
        )
    }
}

/// Telemetry settings of one binary
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `service.name` of exported spans and metrics
    pub service_name: String,
    /// Collector to export to; logs only when unset
    pub otlp_endpoint: Option<String>,
    /// Log line format
    pub log_format: LogFormat,
    /// Log verbosity, overridden by `RUST_LOG`
    pub log_level: LogLevel,
}

impl TelemetryConfig {
    /// JSON logs at info for `service_name`, exporting to `otlp_endpoint` if non-empty
    pub fn new(service_name: impl Into<String>, otlp_endpoint: Option<String>) -> Self {
        Self {
            service_name: service_name.into(),
            otlp_endpoint: otlp_endpoint.filter(|e| !e.is_empty()),
            log_format: LogFormat::default(),
            log_level: LogLevel::default(),
        }
    }

    /// Use `format` and `level` for logs
    pub fn with_logging(mut self, format: LogFormat, level: LogLevel) -> Self {
        self.log_format = format;
        self.log_level = level;
        self
    }
}

/// Install the global subscriber, plus OTLP export when configured
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.filter_directives()));

    let logs = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().with_target(true).boxed(),
    };

    let spans = match &config.otlp_endpoint {
        Some(endpoint) => {
            global::set_text_map_propagator(TraceContextPropagator::new());
            let resource = resource(&config.service_name);
            global::set_meter_provider(meter_provider(endpoint, resource.clone())?);
            let provider = tracer_provider(endpoint, resource)?;
            global::set_tracer_provider(provider.clone());
            let tracer = provider.tracer(config.service_name.clone());
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(logs)
        .with(spans)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

/// OTLP resource identifying this replica
fn resource(service_name: &str) -> Resource {
    let pod_attributes = [
        ("POD_NAME", "k8s.pod.name"),
        ("POD_NAMESPACE", "k8s.namespace.name"),
        ("NODE_NAME", "k8s.node.name"),
    ]
    .into_iter()
    .filter_map(|(env, key)| std::env::var(env).ok().map(|v| KeyValue::new(key, v)));

    Resource::new(
        [
            KeyValue::new(SERVICE_NAME, service_name.to_string()),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        ]
        .into_iter()
        .chain(pod_attributes),
    )
}

fn tracer_provider(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "traces",
            message: e.to_string(),
        })?;
    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build())
}

fn meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "metrics",
            message: e.to_string(),
        })?;
    Ok(SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
        .with_resource(resource)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_endpoint_disables_export() {
        let config = TelemetryConfig::new("registry-cache", Some(String::new()));
        assert!(config.otlp_endpoint.is_none());
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.log_level, LogLevel::Info);

        let config = TelemetryConfig::new("registry-cache", Some("http://otel:4317".into()))
            .with_logging(LogFormat::Text, LogLevel::Debug);
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://otel:4317"));
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn log_settings_parse_like_the_flags() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("error".parse::<LogLevel>().unwrap(), LogLevel::Error);
        let err = "yaml".parse::<LogFormat>().unwrap_err();
        assert_eq!(err.to_string(), "unknown log format \"yaml\"");
        assert!("trace".parse::<LogLevel>().is_err());
    }

    #[test]
    fn level_bounds_dependency_noise() {
        let debug = LogLevel::Debug.filter_directives();
        assert!(debug.starts_with("debug,"));
        assert!(debug.contains("registry_cache_controller=debug"));
        assert!(debug.contains("kube=info"));
        assert!(LogLevel::Error.filter_directives().contains("kube=error"));
        assert!(EnvFilter::try_new(debug).is_ok());
    }

    #[test]
    fn resource_names_the_service() {
        let resource = resource("registry-cache-controller");
        let name = resource.get(opentelemetry::Key::new(SERVICE_NAME));
        assert_eq!(name.map(|v| v.to_string()).as_deref(), Some("registry-cache-controller"));
    }
}
