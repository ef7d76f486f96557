//! Telemetry and structured logging for the render worker.

use crate::job::RenderMode;
use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use tracing::{info, warn};

const TRACER_NAME: &str = "skin-render-worker";

/// Renders slower than this are reported.
const SLOW_RENDER_MS: u64 = 5000;

/// Summary of one answered request.
#[derive(Debug, Clone)]
pub struct JobReport<'a> {
    pub worker_name: &'a str,
    pub correlation_id: Option<&'a str>,
    pub mode: Option<RenderMode>,
    pub size: Option<(u32, u32)>,
    /// `None` on success, otherwise the failure kind.
    pub failure: Option<&'a str>,
    pub elapsed_ms: u64,
}

/// Records a span and log line for an answered request.
pub fn record_job_telemetry(report: &JobReport<'_>) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("render_job");

    span.set_attribute(KeyValue::new("worker", report.worker_name.to_string()));
    span.set_attribute(KeyValue::new("elapsed_ms", report.elapsed_ms as i64));
    span.set_attribute(KeyValue::new(
        "status",
        if report.failure.is_some() { "failed" } else { "complete" },
    ));
    if let Some(correlation_id) = report.correlation_id {
        span.set_attribute(KeyValue::new("correlation_id", correlation_id.to_string()));
    }
    if let Some(mode) = report.mode {
        span.set_attribute(KeyValue::new("mode", mode.to_string()));
    }
    if let Some((width, height)) = report.size {
        span.set_attribute(KeyValue::new("width", width as i64));
        span.set_attribute(KeyValue::new("height", height as i64));
    }

    match report.failure {
        None => info!(
            worker = report.worker_name,
            correlation_id = ?report.correlation_id,
            elapsed_ms = report.elapsed_ms,
            "Render job completed"
        ),
        Some(kind) => {
            span.set_attribute(KeyValue::new("error", kind.to_string()));
            warn!(
                worker = report.worker_name,
                correlation_id = ?report.correlation_id,
                elapsed_ms = report.elapsed_ms,
                error = kind,
                "Render job failed"
            );
        }
    }

    if report.elapsed_ms > SLOW_RENDER_MS {
        warn!(
            correlation_id = ?report.correlation_id,
            elapsed_ms = report.elapsed_ms,
            "Render exceeded performance threshold ({SLOW_RENDER_MS}ms)"
        );
    }

    span.end();
}

/// Records a worker heartbeat with the number of jobs waiting.
pub fn record_worker_heartbeat(worker_name: &str, queued: usize) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("worker_heartbeat");

    span.set_attribute(KeyValue::new("worker", worker_name.to_string()));
    span.set_attribute(KeyValue::new("queued", queued as i64));
    span.end();

    info!(worker = worker_name, queued, "Worker heartbeat");
}

/// Initializes OpenTelemetry with an OTLP exporter.
///
/// Reads `OTEL_EXPORTER_OTLP_ENDPOINT` (default http://localhost:4317) and
/// `OTEL_SERVICE_NAME` (default skin-render-worker).
pub fn init_telemetry() -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string());

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| TRACER_NAME.to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    if let Some(provider) = tracer.provider() {
        global::set_tracer_provider(provider);
    }

    info!("Telemetry initialized: endpoint={}", endpoint);
    Ok(())
}
