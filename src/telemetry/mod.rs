//! Logging and distributed tracing for the relay
//!
//! Structured logs go through `tracing-subscriber`; spans are exported over
//! OTLP when an endpoint is configured. Trace context rides along with every
//! published event in its message headers, so consumers can continue the
//! trace that produced the delta.
//!
//! ```text
//! guarded request ──► token store ──► delta row
//!                                        │
//! publisher span ──► encode ──► broker publish (traceparent header)
//! ```

use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    trace::{self as sdktrace, RandomIdGenerator, Sampler},
    Resource,
};
use std::time::Duration;
use tracing::Span;
use tracing_opentelemetry::{OpenTelemetryLayer, OpenTelemetrySpanExt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::infra::broker::MessageHeaders;

/// Default service name reported to collectors
pub const SERVICE_NAME: &str = "quote-relay";

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for tracing
    pub service_name: String,
    /// Service version
    pub service_version: String,
    /// OTLP endpoint (e.g., "http://localhost:4317")
    pub otlp_endpoint: Option<String>,
    /// Sample rate (0.0 to 1.0)
    pub sample_rate: f64,
    /// Enable console logging
    pub enable_console: bool,
    /// Enable JSON logging format
    pub json_format: bool,
    /// Log level filter
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: SERVICE_NAME.to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            otlp_endpoint: None,
            sample_rate: 1.0,
            enable_console: true,
            json_format: false,
            log_level: "info".to_string(),
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| SERVICE_NAME.to_string()),
            service_version: std::env::var("OTEL_SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            sample_rate: std::env::var("OTEL_SAMPLE_RATE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1.0),
            enable_console: std::env::var("LOG_CONSOLE")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            json_format: std::env::var("LOG_JSON")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            log_level: std::env::var("LOG_LEVEL")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),
        }
    }
}

/// Initialize telemetry with the given configuration
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), Box<dyn std::error::Error>> {
    // Set up trace context propagation
    global::set_text_map_propagator(TraceContextPropagator::new());

    // Build the subscriber
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    // Add console layer if enabled
    if config.enable_console {
        if config.json_format {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);

            if let Some(endpoint) = &config.otlp_endpoint {
                let tracer_provider = init_tracer_provider(config, endpoint)?;
                let tracer = tracer_provider.tracer(SERVICE_NAME);
                let otel_layer = OpenTelemetryLayer::new(tracer);
                subscriber.with(fmt_layer).with(otel_layer).init();
            } else {
                subscriber.with(fmt_layer).init();
            }
        } else {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact();

            if let Some(endpoint) = &config.otlp_endpoint {
                let tracer_provider = init_tracer_provider(config, endpoint)?;
                let tracer = tracer_provider.tracer(SERVICE_NAME);
                let otel_layer = OpenTelemetryLayer::new(tracer);
                subscriber.with(fmt_layer).with(otel_layer).init();
            } else {
                subscriber.with(fmt_layer).init();
            }
        }
    } else if let Some(endpoint) = &config.otlp_endpoint {
        let tracer_provider = init_tracer_provider(config, endpoint)?;
        let tracer = tracer_provider.tracer(SERVICE_NAME);
        let otel_layer = OpenTelemetryLayer::new(tracer);
        subscriber.with(otel_layer).init();
    } else {
        subscriber.init();
    }

    Ok(())
}

fn init_tracer_provider(
    config: &TelemetryConfig,
    endpoint: &str,
) -> Result<sdktrace::TracerProvider, Box<dyn std::error::Error>> {
    let resource = Resource::new(vec![
        KeyValue::new("service.name", config.service_name.clone()),
        KeyValue::new("service.version", config.service_version.clone()),
        KeyValue::new("deployment.environment",
            std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string())),
    ]);

    let sampler = if config.sample_rate >= 1.0 {
        Sampler::AlwaysOn
    } else if config.sample_rate <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(config.sample_rate)
    };

    let tracer_provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_timeout(Duration::from_secs(5)),
        )
        .with_trace_config(
            sdktrace::Config::default()
                .with_sampler(sampler)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    Ok(tracer_provider)
}

/// Shutdown telemetry (flush pending spans)
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

/// Span names for spans opened by hand
pub mod spans {
    pub const GUARDED_REQUEST: &str = "request.guarded";

    // Publication
    pub const PUBLISH_CYCLE: &str = "publisher.cycle";
    pub const PUBLISH_DOCUMENT: &str = "publisher.document";
    pub const ENCODE_DELTA: &str = "delta.encode";

    // Broker
    pub const BROKER_CONNECT: &str = "broker.connect";
    pub const BROKER_RECONNECT: &str = "broker.reconnect";
    pub const BROKER_PUBLISH: &str = "broker.publish";
}

struct HeaderInjector<'a>(&'a mut MessageHeaders);

impl opentelemetry::propagation::Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

struct HeaderExtractor<'a>(&'a MessageHeaders);

impl opentelemetry::propagation::Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Write the current span's trace context into outgoing message headers
pub fn inject_trace_context(headers: &mut MessageHeaders) {
    inject_context_into_headers(headers, &Span::current().context());
}

/// Write `ctx` into message headers
pub fn inject_context_into_headers(headers: &mut MessageHeaders, ctx: &opentelemetry::Context) {
    use opentelemetry::propagation::TextMapPropagator;

    TraceContextPropagator::new().inject_context(ctx, &mut HeaderInjector(headers));
}

/// Read a trace context out of message headers
pub fn extract_context_from_headers(headers: &MessageHeaders) -> opentelemetry::Context {
    use opentelemetry::propagation::TextMapPropagator;

    TraceContextPropagator::new().extract(&HeaderExtractor(headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{
        SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
    };

    #[test]
    fn test_telemetry_config_default() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "quote-relay");
        assert_eq!(config.sample_rate, 1.0);
        assert!(config.enable_console);
        assert!(!config.json_format);
    }

    #[test]
    fn test_trace_context_round_trips_through_headers() {
        let span_context = SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        let ctx = opentelemetry::Context::new().with_remote_span_context(span_context);

        let mut headers = MessageHeaders::new();
        inject_context_into_headers(&mut headers, &ctx);
        assert_eq!(
            headers.get("traceparent").map(String::as_str),
            Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
        );

        let extracted = extract_context_from_headers(&headers);
        let span = extracted.span();
        assert_eq!(
            span.span_context().trace_id(),
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap()
        );
    }

    #[test]
    fn test_no_active_span_injects_nothing() {
        let mut headers = MessageHeaders::new();
        inject_trace_context(&mut headers);
        assert!(!headers.contains_key("traceparent"));
    }
}
