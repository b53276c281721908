//! Tracing subscriber initialization for the `paws` binary.
//!
//! Log lines always go to stderr so that `--json` reports on stdout stay
//! machine-readable. Spans can additionally be exported through
//! OpenTelemetry (stdout exporter).
//!
//! # Usage
//!
//! ```no_run
//! use paws_observe::tracing_setup::{init_tracing, shutdown_tracing, TracingOptions};
//!
//! init_tracing(&TracingOptions::new("info").with_otel(true)).unwrap();
//! // ... run the workflow ...
//! shutdown_tracing();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Instrumentation scope name for exported spans.
const TRACER_NAME: &str = "paws";

/// Kept for `shutdown_tracing`.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingOptions {
    /// Filter used when `RUST_LOG` is unset or invalid.
    pub default_directive: String,
    /// Emit one JSON object per log line.
    pub json: bool,
    /// Bridge spans to OpenTelemetry.
    pub otel: bool,
}

impl TracingOptions {
    pub fn new(default_directive: impl Into<String>) -> Self {
        Self {
            default_directive: default_directive.into(),
            json: false,
            otel: false,
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn with_otel(mut self, otel: bool) -> Self {
        self.otel = otel;
        self
    }

    /// `RUST_LOG` when set and valid, else the default directive.
    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.default_directive))
    }
}

/// Stderr formatting layer, text or JSON.
fn fmt_layer<S>(json: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::CLOSE);
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(options: &TracingOptions) -> Result<(), Box<dyn std::error::Error>> {
    let otel_layer = options.otel.then(|| {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer(TRACER_NAME);
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        tracing_opentelemetry::layer().with_tracer(tracer)
    });

    tracing_subscriber::registry()
        .with(options.filter())
        .with(fmt_layer(options.json))
        .with(otel_layer)
        .try_init()?;

    tracing::debug!(
        json = options.json,
        otel = options.otel,
        "tracing initialized"
    );
    Ok(())
}

/// Flush and shut down the OpenTelemetry provider, if one was installed.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let options = TracingOptions::new("warn").with_json(true);
        assert_eq!(options.default_directive, "warn");
        assert!(options.json);
        assert!(!options.otel);
    }

    #[test]
    fn test_shutdown_without_otel_is_noop() {
        shutdown_tracing();
        assert!(TRACER_PROVIDER.get().is_none());
    }
}
