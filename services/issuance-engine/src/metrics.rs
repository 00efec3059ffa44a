use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    // Pipeline metrics
    pub static ref PIPELINE_RUNS: IntCounterVec = register_int_counter_vec!(
        "issuance_pipeline_runs_total",
        "Pipeline runs by flow and outcome",
        &["flow", "outcome"]
    )
    .expect("metric can be created");

    pub static ref PIPELINE_DURATION: HistogramVec = register_histogram_vec!(
        "issuance_pipeline_duration_seconds",
        "End-to-end pipeline duration in seconds",
        &["flow"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("metric can be created");

    // Collaborator metrics
    pub static ref LEDGER_OPERATIONS: IntCounterVec = register_int_counter_vec!(
        "issuance_ledger_operations_total",
        "Ledger operations by operation and status",
        &["operation", "status"]
    )
    .expect("metric can be created");

    pub static ref AUDIT_SUBMISSIONS: IntCounterVec = register_int_counter_vec!(
        "issuance_audit_submissions_total",
        "Audit topic submissions by status",
        &["status"]
    )
    .expect("metric can be created");

    pub static ref WEBHOOK_REJECTIONS: IntCounterVec = register_int_counter_vec!(
        "issuance_webhook_rejections_total",
        "Deposit callbacks rejected before processing",
        &["reason"]
    )
    .expect("metric can be created");
}

/// Renders the default registry in the Prometheus text format
pub fn metrics_handler() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_exported() {
        PIPELINE_RUNS.with_label_values(&["deposit", "completed"]).inc();
        LEDGER_OPERATIONS.with_label_values(&["mint", "SUCCESS"]).inc();

        let output = metrics_handler().unwrap();
        assert!(output.contains("issuance_pipeline_runs_total"));
        assert!(output.contains("issuance_ledger_operations_total"));
    }
}
