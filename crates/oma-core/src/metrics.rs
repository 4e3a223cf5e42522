use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use tracing::info;

struct StepMetrics {
    runs: Counter<u64>,
    duration_ms: Histogram<f64>,
    tool_failures: Counter<u64>,
}

static METRICS: OnceCell<StepMetrics> = OnceCell::new();

fn handles() -> &'static StepMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("oma.steps");
        StepMetrics {
            runs: meter
                .u64_counter("oma_step_runs_total")
                .with_description("Task executor runs by agent, backend and status")
                .init(),
            duration_ms: meter
                .f64_histogram("oma_step_duration_ms")
                .with_description("Task executor runtime in milliseconds")
                .init(),
            tool_failures: meter
                .u64_counter("oma_tool_resolution_failures_total")
                .with_description("Runs rejected because a requested tool was unknown")
                .init(),
        }
    })
}

/// Point operators at external OTLP configuration when the endpoint variable is set.
pub fn init_metrics_from_env(service_name: &str) {
    if std::env::var("OMA_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            target = "telemetry",
            "OMA_OTEL_METRICS_ENDPOINT detected for {service_name}. Configure an OTLP meter provider in your deployment to export step metrics."
        );
    }
}

/// Record one executor run. A no-op until a meter provider is installed.
pub fn record_step_metrics(agent_id: &str, backend: &str, status: &str, duration_ms: u64) {
    let metrics = handles();
    let attrs = [
        KeyValue::new("agent_id", agent_id.to_string()),
        KeyValue::new("backend", backend.to_string()),
        KeyValue::new("status", status.to_string()),
    ];

    metrics.runs.add(1, &attrs);
    metrics.duration_ms.record(duration_ms as f64, &attrs);
    if status == "tool_resolution" {
        metrics.tool_failures.add(1, &attrs[..2]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_provider_is_harmless() {
        record_step_metrics("pdf_parser", "crew", "success", 42);
        record_step_metrics("pdf_parser", "crew", "tool_resolution", 1);
    }
}
