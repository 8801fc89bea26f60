use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};

pub static ORCHESTRATOR_METRICS: Lazy<OrchestratorMetrics> = Lazy::new(OrchestratorMetrics::register);

pub struct OrchestratorMetrics {
    pub successful_job_operations: Counter<u64>,
    pub failed_job_operations: Counter<u64>,
    pub failed_jobs: Counter<u64>,
    pub jobs_response_time: Histogram<f64>,
    pub db_calls_response_time: Histogram<f64>,
}

impl OrchestratorMetrics {
    pub fn register() -> Self {
        let meter: Meter = global::meter("compute.orchestrator.opentelemetry");

        let successful_job_operations = meter
            .u64_counter("successful_job_operations")
            .with_description("Count of successful job operations over time")
            .with_unit("jobs")
            .build();

        let failed_job_operations = meter
            .u64_counter("failed_job_operations")
            .with_description("Count of failed job operations over time")
            .with_unit("jobs")
            .build();

        let failed_jobs =
            meter.u64_counter("failed_jobs").with_description("Count of failed jobs over time").with_unit("jobs").build();

        let jobs_response_time = meter
            .f64_histogram("jobs_response_time")
            .with_description("Response time of job operations over time")
            .with_unit("s")
            .build();

        let db_calls_response_time = meter
            .f64_histogram("db_calls_response_time")
            .with_description("Response time of DB calls over time")
            .with_unit("s")
            .build();

        Self { successful_job_operations, failed_job_operations, failed_jobs, jobs_response_time, db_calls_response_time }
    }
}
