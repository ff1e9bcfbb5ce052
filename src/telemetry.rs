//! Logging setup and OpenTelemetry spans.
//!
//! Structured logs go through `tracing`; [`init_logging`] installs the
//! subscriber for the binary. Distributed tracing spans wrap tool calls,
//! dispatch batches and rate-limit waits, with OTLP and Noop exporters.

use opentelemetry::global::BoxedSpan;
use opentelemetry::trace::{Span, Status, Tracer};
use opentelemetry::KeyValue;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use serde::{Deserialize, Serialize};

const TRACER_NAME: &str = "agent-governor";

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default `agent_governor=info` filter.
pub fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "agent_governor=info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ---------------------------------------------------------------------------
// Configuration types
// ---------------------------------------------------------------------------

/// Exporter backend for trace data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ExporterType {
    /// Send spans via OTLP over HTTP.
    Otlp,
    /// Discard all spans (noop).
    None,
}

/// Configuration for the tracing subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Service name reported in traces.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Whether tracing is enabled at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Which exporter backend to use.
    #[serde(default = "default_exporter")]
    pub exporter: ExporterType,
    /// Endpoint for the OTLP exporter (ignored for other exporters).
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

fn default_service_name() -> String {
    TRACER_NAME.to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_exporter() -> ExporterType {
    ExporterType::None
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            enabled: default_enabled(),
            exporter: default_exporter(),
            otlp_endpoint: None,
        }
    }
}

// ---------------------------------------------------------------------------
// SpanGuard
// ---------------------------------------------------------------------------

/// RAII guard that ends the wrapped span on drop.
pub struct SpanGuard {
    span: BoxedSpan,
}

impl SpanGuard {
    /// Set the span status to Ok or Error.
    pub fn set_status(&mut self, success: bool, message: &str) {
        if success {
            self.span.set_status(Status::Ok);
        } else {
            self.span.set_status(Status::error(message.to_owned()));
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.span.end();
    }
}

// ---------------------------------------------------------------------------
// GovernorTracer
// ---------------------------------------------------------------------------

/// Owns the tracer provider so it can be flushed and shut down.
pub struct GovernorTracer {
    provider: SdkTracerProvider,
}

impl GovernorTracer {
    /// Build the tracing pipeline and, when enabled, install it as the
    /// global provider so the `trace_*` helpers below export through it.
    ///
    /// # Errors
    /// Returns an error if the OTLP exporter cannot be configured.
    pub fn init(config: &TracingConfig) -> anyhow::Result<Self> {
        let resource = Resource::builder()
            .with_service_name(config.service_name.clone())
            .build();
        let provider = match config.exporter {
            ExporterType::None => SdkTracerProvider::builder().with_resource(resource).build(),
            ExporterType::Otlp => {
                // Does not connect until the first export.
                let mut builder = opentelemetry_otlp::SpanExporter::builder().with_http();

                if let Some(ref endpoint) = config.otlp_endpoint {
                    use opentelemetry_otlp::HasExportConfig;
                    builder.export_config().endpoint = Some(endpoint.clone());
                }

                let exporter = builder.build()?;

                SdkTracerProvider::builder()
                    .with_resource(resource)
                    .with_simple_exporter(exporter)
                    .build()
            }
        };

        if config.enabled {
            opentelemetry::global::set_tracer_provider(provider.clone());
            tracing::debug!(
                service = %config.service_name,
                exporter = ?config.exporter,
                "tracer provider installed"
            );
        }

        Ok(Self { provider })
    }

    /// Flush pending spans and shut down the tracing pipeline.
    pub fn shutdown(&self) {
        if let Err(e) = self.provider.shutdown() {
            tracing::debug!(error = %e, "tracer provider shutdown failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Span helpers
// ---------------------------------------------------------------------------

fn global_span(name: String, attributes: Vec<KeyValue>) -> SpanGuard {
    let tracer = opentelemetry::global::tracer(TRACER_NAME);
    let mut span = tracer.start(name);
    for kv in attributes {
        span.set_attribute(kv);
    }
    SpanGuard { span }
}

/// Span around one tool invocation.
pub fn trace_tool_call(tool_name: &str, call_id: &str) -> SpanGuard {
    global_span(
        format!("tool_call/{tool_name}"),
        vec![
            KeyValue::new("tool.name", tool_name.to_owned()),
            KeyValue::new("tool.call_id", call_id.to_owned()),
        ],
    )
}

/// Span around a dispatched batch.
pub fn trace_dispatch(calls: usize, workers: usize) -> SpanGuard {
    global_span(
        "tool_dispatch".to_owned(),
        vec![
            KeyValue::new("dispatch.calls", calls as i64),
            KeyValue::new("dispatch.workers", workers as i64),
        ],
    )
}

/// Span around a blocking rate-limit wait.
pub fn trace_rate_limit_wait(key: &str) -> SpanGuard {
    global_span(
        "rate_limit/wait".to_owned(),
        vec![KeyValue::new("rate_limit.key", key.to_owned())],
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
