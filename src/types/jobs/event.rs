use chrono::{DateTime, Utc};
use mongodb::bson::Document;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::jobs::job_item::JobItem;

/// The three lifecycle events published on terminal transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum JobEventKind {
    Finished,
    Failed,
    Cancelled,
}

impl JobEventKind {
    /// Topic the event is published on
    pub fn topic_name(&self) -> &'static str {
        match self {
            Self::Finished => "on_job_finished",
            Self::Failed => "on_job_failed",
            Self::Cancelled => "on_job_cancelled",
        }
    }
}

/// Payload carried by every lifecycle event.
///
/// `end_time` is the terminal timestamp of the transition that produced the
/// event: `end_time` for finished/failed jobs, `cancel_time` for cancelled
/// ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEventPayload {
    pub workspace_id: String,
    pub job_type: String,
    pub job_payload: Document,
    pub job_metadata: Document,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub end_time: Option<DateTime<Utc>>,
}

/// A lifecycle event, keyed by job id for partitioning. Delivery is
/// at-least-once; consumers must dedupe on the job id.
#[derive(Debug, Clone, PartialEq)]
pub struct JobLifecycleEvent {
    pub kind: JobEventKind,
    pub job_id: Uuid,
    pub payload: JobEventPayload,
}

impl JobLifecycleEvent {
    pub fn finished(job: &JobItem) -> Self {
        Self::from_job(JobEventKind::Finished, job, job.end_time)
    }

    pub fn failed(job: &JobItem) -> Self {
        Self::from_job(JobEventKind::Failed, job, job.end_time)
    }

    pub fn cancelled(job: &JobItem) -> Self {
        Self::from_job(JobEventKind::Cancelled, job, job.cancellation_info.cancel_time)
    }

    fn from_job(kind: JobEventKind, job: &JobItem, end_time: Option<DateTime<Utc>>) -> Self {
        Self {
            kind,
            job_id: job.id,
            payload: JobEventPayload {
                workspace_id: job.workspace_id.clone(),
                job_type: job.job_type.clone(),
                job_payload: job.payload.clone(),
                job_metadata: job.metadata.clone(),
                start_time: job.start_time,
                end_time,
            },
        }
    }
}
