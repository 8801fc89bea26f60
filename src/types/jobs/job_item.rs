use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::{chrono_datetime_as_bson_datetime, uuid_1_as_binary};
use mongodb::bson::Document;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::jobs::types::{GpuState, JobState, JobStateGroup, StepState};

/// Cancellation bookkeeping for a job
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancellationInfo {
    /// Whether cancellation has been requested for this job
    pub is_cancelled: bool,
    /// Timestamp when cancellation was requested
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub request_time: Option<DateTime<Utc>>,
    /// Timestamp when the job actually reached `Cancelled`
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub cancel_time: Option<DateTime<Utc>>,
    /// Whether the job should be deleted once terminal (and its cost, if
    /// any, has been reported)
    pub delete_job: bool,
}

/// Execution bookkeeping for one arm of the lifecycle (main or revert)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionRecord {
    /// Present iff the job is currently in flight toward `Scheduled` (or
    /// `RevertScheduled`) or being cancelled; sweepers compare this against a
    /// time threshold to find stuck jobs
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub process_start_time: Option<DateTime<Utc>>,
    /// Launch plan identifier handed back by the execution backend
    pub launch_plan_id: Option<String>,
    /// Execution identifier handed back by the execution backend
    pub execution_id: Option<String>,
    /// Number of times a stuck scheduling attempt was swept back
    pub start_retry_counter: u64,
    /// Number of times a stuck cancellation attempt was swept back
    pub cancel_retry_counter: u64,
}

/// The two independent execution records of the two-phase lifecycle
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobExecutions {
    #[serde(default)]
    pub main: ExecutionRecord,
    #[serde(default)]
    pub revert: ExecutionRecord,
}

/// One task step of a job, reported by the execution backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDetails {
    pub task_id: String,
    pub state: StepState,
    /// Completion fraction in `[0.0, 1.0]`
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub warning: Option<String>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub end_time: Option<DateTime<Utc>>,
}

impl StepDetails {
    /// A fresh step in `Waiting` with nothing reported yet
    pub fn waiting(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            state: StepState::Waiting,
            progress: None,
            message: None,
            warning: None,
            start_time: None,
            end_time: None,
        }
    }
}

/// A billable resource consumed by a job, keyed by the service that billed it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumedResource {
    pub service: String,
    pub amount: f64,
    pub unit: Option<String>,
}

/// Cost bookkeeping; deletion of a job is gated on `reported`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobCost {
    #[serde(default)]
    pub consumed: Vec<ConsumedResource>,
    pub reported: bool,
}

/// GPU reservation bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GpuInfo {
    pub state: GpuState,
}

/// A job document, one per submitted unit of work.
///
/// Created by the external submission path in `Submitted`; mutated
/// exclusively through [`crate::lifecycle::JobStateMachine`]. The
/// `organization_id`/`workspace_id` pair is the collection's tenant routing
/// key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobItem {
    /// an uuid to identify a job
    #[serde(with = "uuid_1_as_binary")]
    pub id: Uuid,
    pub organization_id: String,
    pub workspace_id: String,
    pub project_id: String,
    /// the type of job, ex: training, import, export
    pub job_type: String,
    /// opaque job-type data, interpreted only by the execution backend
    #[serde(default)]
    pub payload: Document,
    /// mutable key/value map; merged additively, never replaced wholesale
    #[serde(default)]
    pub metadata: Document,
    pub state: JobState,
    pub state_group: JobStateGroup,
    #[serde(default)]
    pub cancellation_info: CancellationInfo,
    #[serde(default)]
    pub executions: JobExecutions,
    #[serde(default)]
    pub step_details: Vec<StepDetails>,
    pub cost: Option<JobCost>,
    pub gpu: Option<GpuInfo>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub end_time: Option<DateTime<Utc>>,
    /// helps to keep track of the version of the item for optimistic locking
    pub version: i32,
    /// timestamp when the job was created
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    /// timestamp when the job was last updated
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}
