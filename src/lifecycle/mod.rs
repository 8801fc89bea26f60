//! Job lifecycle state machine.
//!
//! Every mutation of a job document goes through [`JobStateMachine`]. Each
//! operation is a single atomic store call; claims use
//! `find_one_and_update` so that concurrent scheduler replicas race on the
//! document filter instead of taking locks. Terminal transitions additionally
//! publish a lifecycle event after the write commits.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use mongodb::bson::{doc, Bson, Document};
use opentelemetry::KeyValue;
use uuid::Uuid;

use crate::core::client::database::{DatabaseError, JobStore};
use crate::core::client::publisher::EventPublisher;
use crate::error::{JobError, JobResult};
use crate::types::jobs::event::JobLifecycleEvent;
use crate::types::jobs::job_item::{ConsumedResource, JobExecutions, JobItem, StepDetails};
use crate::types::jobs::step_updates::StepDetailsUpdate;
use crate::types::jobs::types::{GpuState, JobState, JobStateGroup, StepState};
use crate::utils::metrics::ORCHESTRATOR_METRICS;

/// Coordinates all job state transitions against the job store and the
/// event publisher. Stateless itself; safe to share across replicas.
pub struct JobStateMachine {
    store: Arc<dyn JobStore>,
    publisher: Arc<dyn EventPublisher>,
}

impl JobStateMachine {
    pub fn new(store: Arc<dyn JobStore>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { store, publisher }
    }

    fn id_filter(job_id: Uuid) -> Document {
        doc! { "id": mongodb::bson::Uuid::from(job_id) }
    }

    /// Whether a terminal transition must fold a GPU release into its write
    fn gpu_release_pending(job: &JobItem) -> bool {
        matches!(&job.gpu, Some(gpu) if gpu.state == GpuState::Reserved)
    }

    async fn get_job(&self, job_id: Uuid) -> JobResult<JobItem> {
        self.store.get_job_by_id(job_id).await?.ok_or(JobError::JobNotFound { id: job_id })
    }

    /// Insert a freshly submitted job
    #[tracing::instrument(skip_all, fields(job_id = %job.id, job_type = %job.job_type), err)]
    pub async fn create_job(&self, job: JobItem) -> JobResult<JobItem> {
        let job = self.store.create_job(job).await?;
        tracing::info!(job_id = %job.id, "job created");
        Ok(job)
    }

    // ------------------------------------------------------------------
    // Scheduling arm
    // ------------------------------------------------------------------

    /// Atomically claim one job that is ready for scheduling.
    ///
    /// The claimed job moves to `Scheduling` with a fresh
    /// `process_start_time` so a sweeper can detect the claim going stale.
    /// Jobs flagged for cancellation are never claimed. Returns `None` when
    /// nothing is claimable, including when a competing replica won the
    /// race.
    #[tracing::instrument(skip(self), err)]
    pub async fn find_and_lock_job_for_scheduling(&self) -> JobResult<Option<JobItem>> {
        let start = Instant::now();
        let filter = doc! {
            "state": JobState::ReadyForScheduling,
            "cancellation_info.is_cancelled": false,
        };
        let update = doc! {
            "$set": {
                "state": JobState::Scheduling,
                "state_group": JobStateGroup::Scheduled,
                "executions.main.process_start_time": Utc::now().timestamp(),
            }
        };
        let job = self.store.find_one_and_update(filter, update, None).await?;

        if let Some(job) = &job {
            tracing::info!(job_id = %job.id, job_type = %job.job_type, "claimed job for scheduling");
            let attributes = [KeyValue::new("operation_type", "find_and_lock_job_for_scheduling")];
            ORCHESTRATOR_METRICS.successful_job_operations.add(1, &attributes);
            ORCHESTRATOR_METRICS.jobs_response_time.record(start.elapsed().as_secs_f64(), &attributes);
        }
        Ok(job)
    }

    /// Sweep jobs stuck in `Scheduling` back to `Submitted`.
    ///
    /// A job is stuck when its claim's `process_start_time` predates the
    /// threshold. Returns the number of jobs reset.
    #[tracing::instrument(skip(self), err)]
    pub async fn reset_scheduling_jobs(&self, threshold: DateTime<Utc>) -> JobResult<u64> {
        let filter = doc! {
            "state": JobState::Scheduling,
            "executions.main.process_start_time": { "$lt": threshold.timestamp() },
        };
        let update = doc! {
            "$set": { "state": JobState::Submitted },
            "$unset": { "executions.main.process_start_time": "" },
            "$inc": { "executions.main.start_retry_counter": 1 },
        };
        let count = self.store.update_many(filter, update).await?;
        if count > 0 {
            tracing::warn!(count, "reset stuck scheduling jobs");
        }
        Ok(count)
    }

    /// Reset one `Scheduling` job back to `Submitted`, used when a
    /// scheduler gives up on a claim it still holds
    #[tracing::instrument(skip(self), err)]
    pub async fn reset_scheduling_job(&self, job_id: Uuid) -> JobResult<bool> {
        let mut filter = Self::id_filter(job_id);
        filter.insert("state", JobState::Scheduling);
        let update = doc! {
            "$set": { "state": JobState::Submitted },
            "$unset": { "executions.main.process_start_time": "" },
            "$inc": { "executions.main.start_retry_counter": 1 },
        };
        Ok(self.store.update_one(filter, update, None).await? > 0)
    }

    /// Record the execution identifiers handed back by the backend and move
    /// the job to `Scheduled`. Only valid from `Scheduling`; the claim's
    /// `process_start_time` is cleared since the claim has concluded.
    #[tracing::instrument(skip(self, steps), err)]
    pub async fn set_scheduled_state(
        &self,
        job_id: Uuid,
        launch_plan_id: String,
        execution_id: String,
        steps: Vec<StepDetails>,
    ) -> JobResult<bool> {
        let mut filter = Self::id_filter(job_id);
        filter.insert("state", JobState::Scheduling);
        let update = doc! {
            "$set": {
                "state": JobState::Scheduled,
                "state_group": JobStateGroup::Scheduled,
                "executions.main.launch_plan_id": launch_plan_id,
                "executions.main.execution_id": execution_id,
                "step_details": mongodb::bson::to_bson(&steps).map_err(DatabaseError::SerializationError)?,
            },
            "$unset": { "executions.main.process_start_time": "" },
        };
        Ok(self.store.update_one(filter, update, None).await? > 0)
    }

    /// Move a `Scheduled` job to `Running` and stamp its start time
    #[tracing::instrument(skip(self), err)]
    pub async fn set_running_state(&self, job_id: Uuid) -> JobResult<bool> {
        let mut filter = Self::id_filter(job_id);
        filter.insert("state", JobState::Scheduled);
        let update = doc! {
            "$set": {
                "state": JobState::Running,
                "state_group": JobStateGroup::Running,
                "start_time": Utc::now().timestamp(),
            }
        };
        Ok(self.store.update_one(filter, update, None).await? > 0)
    }

    /// Patch one step of a job, matched by task id. Only the fields present
    /// in the patch are written.
    #[tracing::instrument(skip(self, patch), err)]
    pub async fn set_step_details(&self, job_id: Uuid, task_id: &str, patch: StepDetailsUpdate) -> JobResult<bool> {
        let patch = patch.build()?;

        let mut set = Document::new();
        if let Some(state) = patch.state {
            set.insert("step_details.$[step].state", state);
        }
        if let Some(progress) = patch.progress {
            set.insert("step_details.$[step].progress", progress);
        }
        if let Some(message) = patch.message {
            set.insert("step_details.$[step].message", message);
        }
        if let Some(warning) = patch.warning {
            set.insert("step_details.$[step].warning", warning);
        }
        if let Some(start_time) = patch.start_time {
            set.insert("step_details.$[step].start_time", start_time.timestamp());
        }
        if let Some(end_time) = patch.end_time {
            set.insert("step_details.$[step].end_time", end_time.timestamp());
        }

        let array_filters = vec![doc! { "step.task_id": task_id }];
        let modified =
            self.store.update_one(Self::id_filter(job_id), doc! { "$set": set }, Some(array_filters)).await?;
        Ok(modified > 0)
    }

    /// Merge keys into the job's metadata map. Existing keys are
    /// overwritten, absent keys are left untouched.
    #[tracing::instrument(skip(self, metadata), err)]
    pub async fn update_metadata(&self, job_id: Uuid, metadata: Document) -> JobResult<bool> {
        if metadata.is_empty() {
            return Err(JobError::NoUpdateFound);
        }
        let mut set = Document::new();
        for (key, value) in metadata {
            set.insert(format!("metadata.{}", key), value);
        }
        Ok(self.store.update_one(Self::id_filter(job_id), doc! { "$set": set }, None).await? > 0)
    }

    // ------------------------------------------------------------------
    // Cost and GPU bookkeeping
    // ------------------------------------------------------------------

    /// Append consumed resources to the job's cost record, deduplicated by
    /// service name.
    ///
    /// Each new resource is pushed with a filter guarding against the
    /// service already being present, so concurrent reporters cannot
    /// double-bill. Returns `true` if anything was actually appended.
    #[tracing::instrument(skip(self, resources), err)]
    pub async fn update_cost_consumed(&self, job_id: Uuid, resources: Vec<ConsumedResource>) -> JobResult<bool> {
        let job = self.get_job(job_id).await?;
        let cost = job.cost.ok_or(JobError::MissingCost { id: job_id })?;

        let existing: HashSet<&str> = cost.consumed.iter().map(|r| r.service.as_str()).collect();
        let new_resources: Vec<_> = resources.into_iter().filter(|r| !existing.contains(r.service.as_str())).collect();
        if new_resources.is_empty() {
            return Ok(false);
        }

        let mut any_pushed = false;
        for resource in new_resources {
            let mut filter = Self::id_filter(job_id);
            filter.insert("cost.consumed.service", doc! { "$ne": &resource.service });
            let update = doc! {
                "$push": {
                    "cost.consumed": mongodb::bson::to_bson(&resource).map_err(DatabaseError::SerializationError)?,
                }
            };
            any_pushed |= self.store.update_one(filter, update, None).await? > 0;
        }
        Ok(any_pushed)
    }

    /// Mark the job's cost as reported to the billing pipeline. No-op on
    /// jobs without cost information.
    #[tracing::instrument(skip(self), err)]
    pub async fn set_cost_reported(&self, job_id: Uuid) -> JobResult<bool> {
        let mut filter = Self::id_filter(job_id);
        filter.insert("cost", doc! { "$ne": Bson::Null });
        let update = doc! { "$set": { "cost.reported": true } };
        Ok(self.store.update_one(filter, update, None).await? > 0)
    }

    /// Release the job's GPU reservation. Only transitions
    /// `Reserved -> Released`; releasing twice is a no-op.
    #[tracing::instrument(skip(self), err)]
    pub async fn set_gpu_state_released(&self, job_id: Uuid) -> JobResult<bool> {
        let mut filter = Self::id_filter(job_id);
        filter.insert("gpu.state", GpuState::Reserved);
        let update = doc! { "$set": { "gpu.state": GpuState::Released } };
        Ok(self.store.update_one(filter, update, None).await? > 0)
    }

    // ------------------------------------------------------------------
    // Terminal transitions
    // ------------------------------------------------------------------

    /// Move the job to `Finished`, release its GPU reservation if one is
    /// still held, and publish the finished event.
    ///
    /// The event is published after the write commits; a publish failure
    /// surfaces to the caller but does not roll the transition back.
    #[tracing::instrument(skip(self), err)]
    pub async fn set_and_publish_finished_state(&self, job_id: Uuid) -> JobResult<JobItem> {
        let start = Instant::now();
        let job = self.get_job(job_id).await?;

        let mut set = doc! {
            "state": JobState::Finished,
            "state_group": JobStateGroup::Finished,
            "end_time": Utc::now().timestamp(),
        };
        if Self::gpu_release_pending(&job) {
            set.insert("gpu.state", GpuState::Released);
        }

        let updated = self
            .store
            .find_one_and_update(Self::id_filter(job_id), doc! { "$set": set }, None)
            .await?
            .ok_or(JobError::JobNotFound { id: job_id })?;

        self.publisher.publish(JobLifecycleEvent::finished(&updated)).await?;
        tracing::info!(job_id = %job_id, "job finished");

        let attributes = [KeyValue::new("operation_type", "set_and_publish_finished_state")];
        ORCHESTRATOR_METRICS.successful_job_operations.add(1, &attributes);
        ORCHESTRATOR_METRICS.jobs_response_time.record(start.elapsed().as_secs_f64(), &attributes);
        Ok(updated)
    }

    /// Move the job to `Failed`, close out any still-running steps, clear
    /// both execution timers, release the GPU if held, and publish the
    /// failed event.
    #[tracing::instrument(skip(self), err)]
    pub async fn set_and_publish_failed_state(&self, job_id: Uuid) -> JobResult<JobItem> {
        let start = Instant::now();
        let job = self.get_job(job_id).await?;

        let mut set = doc! {
            "state": JobState::Failed,
            "state_group": JobStateGroup::Failed,
            "end_time": Utc::now().timestamp(),
            "step_details.$[step].state": StepState::Finished,
        };
        if Self::gpu_release_pending(&job) {
            set.insert("gpu.state", GpuState::Released);
        }
        let update = doc! {
            "$set": set,
            "$unset": {
                "executions.main.process_start_time": "",
                "executions.revert.process_start_time": "",
            },
        };
        let array_filters = vec![doc! { "step.state": StepState::Running }];

        let updated = self
            .store
            .find_one_and_update(Self::id_filter(job_id), update, Some(array_filters))
            .await?
            .ok_or(JobError::JobNotFound { id: job_id })?;

        self.publisher.publish(JobLifecycleEvent::failed(&updated)).await?;
        tracing::error!(job_id = %job_id, job_type = %updated.job_type, "job failed");

        let attributes = [
            KeyValue::new("operation_type", "set_and_publish_failed_state"),
            KeyValue::new("job_type", updated.job_type.clone()),
        ];
        ORCHESTRATOR_METRICS.failed_jobs.add(1, &attributes);
        ORCHESTRATOR_METRICS.jobs_response_time.record(start.elapsed().as_secs_f64(), &attributes);
        Ok(updated)
    }

    /// Move the job to `Cancelled`, mark waiting and running steps as
    /// cancelled, stamp the cancel time, release the GPU if held, and
    /// publish the cancelled event.
    #[tracing::instrument(skip(self), err)]
    pub async fn set_and_publish_cancelled_state(&self, job_id: Uuid) -> JobResult<JobItem> {
        let start = Instant::now();
        let job = self.get_job(job_id).await?;

        let mut set = doc! {
            "state": JobState::Cancelled,
            "state_group": JobStateGroup::Cancelled,
            "cancellation_info.cancel_time": Utc::now().timestamp(),
            "step_details.$[step].state": StepState::Cancelled,
        };
        if Self::gpu_release_pending(&job) {
            set.insert("gpu.state", GpuState::Released);
        }
        let update = doc! {
            "$set": set,
            "$unset": { "executions.main.process_start_time": "" },
        };
        let array_filters = vec![doc! { "step.state": { "$in": [StepState::Waiting, StepState::Running] } }];

        let updated = self
            .store
            .find_one_and_update(Self::id_filter(job_id), update, Some(array_filters))
            .await?
            .ok_or(JobError::JobNotFound { id: job_id })?;

        self.publisher.publish(JobLifecycleEvent::cancelled(&updated)).await?;
        tracing::info!(job_id = %job_id, "job cancelled");

        let attributes = [KeyValue::new("operation_type", "set_and_publish_cancelled_state")];
        ORCHESTRATOR_METRICS.successful_job_operations.add(1, &attributes);
        ORCHESTRATOR_METRICS.jobs_response_time.record(start.elapsed().as_secs_f64(), &attributes);
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Cancellation arm
    // ------------------------------------------------------------------

    /// Flag a job for cancellation and record whether it should be deleted
    /// once terminal. The flag is honored by the claim filters; the actual
    /// transition happens through [`Self::find_and_lock_job_for_canceling`].
    #[tracing::instrument(skip(self), err)]
    pub async fn mark_cancelled_and_deleted(&self, job_id: Uuid, delete_job: bool) -> JobResult<bool> {
        let update = doc! {
            "$set": {
                "cancellation_info.is_cancelled": true,
                "cancellation_info.request_time": Utc::now().timestamp(),
                "cancellation_info.delete_job": delete_job,
            }
        };
        Ok(self.store.update_one(Self::id_filter(job_id), update, None).await? > 0)
    }

    /// Atomically claim one flagged job for cancellation.
    ///
    /// Only `Scheduled` and `Running` jobs are eligible; `state_group` is
    /// deliberately left untouched so a failed cancellation can restore the
    /// job to where it was.
    #[tracing::instrument(skip(self), err)]
    pub async fn find_and_lock_job_for_canceling(&self) -> JobResult<Option<JobItem>> {
        let filter = doc! {
            "state": { "$in": [JobState::Scheduled, JobState::Running] },
            "cancellation_info.is_cancelled": true,
        };
        let update = doc! {
            "$set": {
                "state": JobState::Canceling,
                "executions.main.process_start_time": Utc::now().timestamp(),
            }
        };
        let job = self.store.find_one_and_update(filter, update, None).await?;
        if let Some(job) = &job {
            tracing::info!(job_id = %job.id, "claimed job for canceling");
        }
        Ok(job)
    }

    /// Sweep jobs stuck in `Canceling` back to their pre-cancel state,
    /// recovered from `state_group`. Returns the number of jobs reset.
    #[tracing::instrument(skip(self), err)]
    pub async fn reset_canceling_jobs(&self, threshold: DateTime<Utc>) -> JobResult<u64> {
        let mut total = 0;
        for (group, state) in [(JobStateGroup::Scheduled, JobState::Scheduled), (JobStateGroup::Running, JobState::Running)] {
            let filter = doc! {
                "state": JobState::Canceling,
                "state_group": group,
                "executions.main.process_start_time": { "$lt": threshold.timestamp() },
            };
            let update = doc! {
                "$set": { "state": state },
                "$unset": { "executions.main.process_start_time": "" },
                "$inc": { "executions.main.cancel_retry_counter": 1 },
            };
            total += self.store.update_many(filter, update).await?;
        }
        if total > 0 {
            tracing::warn!(count = total, "reset stuck canceling jobs");
        }
        Ok(total)
    }

    /// Reset one `Canceling` job back to its pre-cancel state
    #[tracing::instrument(skip(self), err)]
    pub async fn reset_canceling_job(&self, job_id: Uuid) -> JobResult<bool> {
        let mut reset = false;
        for (group, state) in [(JobStateGroup::Scheduled, JobState::Scheduled), (JobStateGroup::Running, JobState::Running)] {
            let mut filter = Self::id_filter(job_id);
            filter.insert("state", JobState::Canceling);
            filter.insert("state_group", group);
            let update = doc! {
                "$set": { "state": state },
                "$unset": { "executions.main.process_start_time": "" },
                "$inc": { "executions.main.cancel_retry_counter": 1 },
            };
            reset |= self.store.update_one(filter, update, None).await? > 0;
        }
        Ok(reset)
    }

    /// Abort a cancellation: restore the job to its pre-cancel state and
    /// clear the cancellation flag so claims see it again.
    #[tracing::instrument(skip(self), err)]
    pub async fn drop_cancelled_flag(&self, job_id: Uuid) -> JobResult<bool> {
        let mut dropped = false;
        for (group, state) in [(JobStateGroup::Scheduled, JobState::Scheduled), (JobStateGroup::Running, JobState::Running)] {
            let mut filter = Self::id_filter(job_id);
            filter.insert("state", JobState::Canceling);
            filter.insert("state_group", group);
            let update = doc! {
                "$set": { "state": state, "cancellation_info.is_cancelled": false },
                "$unset": { "executions.main.process_start_time": "" },
            };
            dropped |= self.store.update_one(filter, update, None).await? > 0;
        }
        Ok(dropped)
    }

    // ------------------------------------------------------------------
    // Revert arm
    // ------------------------------------------------------------------

    /// Mark the job as eligible for a compensating (revert) run
    #[tracing::instrument(skip(self), err)]
    pub async fn set_ready_for_revert_state(&self, job_id: Uuid) -> JobResult<bool> {
        let update = doc! {
            "$set": { "state": JobState::ReadyForRevert, "state_group": JobStateGroup::Scheduled }
        };
        Ok(self.store.update_one(Self::id_filter(job_id), update, None).await? > 0)
    }

    /// Atomically claim one job that is ready for reverting. Mirrors the
    /// scheduling claim but tracks its timer on the revert execution record.
    #[tracing::instrument(skip(self), err)]
    pub async fn find_and_lock_job_for_reverting(&self) -> JobResult<Option<JobItem>> {
        let filter = doc! {
            "state": JobState::ReadyForRevert,
            "cancellation_info.is_cancelled": false,
        };
        let update = doc! {
            "$set": {
                "state": JobState::RevertScheduling,
                "state_group": JobStateGroup::Scheduled,
                "executions.revert.process_start_time": Utc::now().timestamp(),
            }
        };
        let job = self.store.find_one_and_update(filter, update, None).await?;
        if let Some(job) = &job {
            tracing::info!(job_id = %job.id, "claimed job for reverting");
        }
        Ok(job)
    }

    /// Sweep jobs stuck in `RevertScheduling` back to `ReadyForRevert`
    #[tracing::instrument(skip(self), err)]
    pub async fn reset_revert_scheduling_jobs(&self, threshold: DateTime<Utc>) -> JobResult<u64> {
        let filter = doc! {
            "state": JobState::RevertScheduling,
            "executions.revert.process_start_time": { "$lt": threshold.timestamp() },
        };
        let update = doc! {
            "$set": { "state": JobState::ReadyForRevert },
            "$unset": { "executions.revert.process_start_time": "" },
            "$inc": { "executions.revert.start_retry_counter": 1 },
        };
        let count = self.store.update_many(filter, update).await?;
        if count > 0 {
            tracing::warn!(count, "reset stuck revert scheduling jobs");
        }
        Ok(count)
    }

    /// Reset one `RevertScheduling` job back to `ReadyForRevert`
    #[tracing::instrument(skip(self), err)]
    pub async fn reset_revert_scheduling_job(&self, job_id: Uuid) -> JobResult<bool> {
        let mut filter = Self::id_filter(job_id);
        filter.insert("state", JobState::RevertScheduling);
        let update = doc! {
            "$set": { "state": JobState::ReadyForRevert },
            "$unset": { "executions.revert.process_start_time": "" },
            "$inc": { "executions.revert.start_retry_counter": 1 },
        };
        Ok(self.store.update_one(filter, update, None).await? > 0)
    }

    /// Record the revert execution identifiers and move the job to
    /// `RevertScheduled`. Step details are replaced with the revert run's
    /// steps.
    #[tracing::instrument(skip(self, steps), err)]
    pub async fn set_revert_scheduled_state(
        &self,
        job_id: Uuid,
        launch_plan_id: String,
        execution_id: String,
        steps: Vec<StepDetails>,
    ) -> JobResult<bool> {
        let mut filter = Self::id_filter(job_id);
        filter.insert("state", JobState::RevertScheduling);
        let update = doc! {
            "$set": {
                "state": JobState::RevertScheduled,
                "state_group": JobStateGroup::Scheduled,
                "executions.revert.launch_plan_id": launch_plan_id,
                "executions.revert.execution_id": execution_id,
                "step_details": mongodb::bson::to_bson(&steps).map_err(DatabaseError::SerializationError)?,
            },
            "$unset": { "executions.revert.process_start_time": "" },
        };
        Ok(self.store.update_one(filter, update, None).await? > 0)
    }

    /// Move a `RevertScheduled` job to `RevertRunning`. The original
    /// `start_time` is preserved; it records the forward run's start.
    #[tracing::instrument(skip(self), err)]
    pub async fn set_revert_running_state(&self, job_id: Uuid) -> JobResult<bool> {
        let mut filter = Self::id_filter(job_id);
        filter.insert("state", JobState::RevertScheduled);
        let update = doc! {
            "$set": { "state": JobState::RevertRunning, "state_group": JobStateGroup::Running }
        };
        Ok(self.store.update_one(filter, update, None).await? > 0)
    }

    // ------------------------------------------------------------------
    // Queries and maintenance
    // ------------------------------------------------------------------

    /// Find one terminal job that was flagged for deletion and whose cost,
    /// if any, has been reported
    #[tracing::instrument(skip(self), err)]
    pub async fn get_job_to_delete(&self) -> JobResult<Option<JobItem>> {
        let terminal: Vec<Bson> = JobState::terminal_states().into_iter().map(Bson::from).collect();
        let filter = doc! {
            "state": { "$in": terminal },
            "cancellation_info.delete_job": true,
            "$or": [
                { "cost": Bson::Null },
                { "cost.reported": true },
            ],
        };
        Ok(self.store.find_one(filter).await?)
    }

    /// Find one job flagged for cancellation, optionally narrowed to a set
    /// of states
    #[tracing::instrument(skip(self, states), err)]
    pub async fn get_cancelled_job(&self, states: Option<&[JobState]>) -> JobResult<Option<JobItem>> {
        let mut filter = doc! { "cancellation_info.is_cancelled": true };
        if let Some(states) = states {
            let states: Vec<Bson> = states.iter().copied().map(Bson::from).collect();
            filter.insert("state", doc! { "$in": states });
        }
        Ok(self.store.find_one(filter).await?)
    }

    /// All jobs at or past `Scheduled` that neither arm has finished with.
    /// Cancelled is excluded explicitly since its ordinal sits below
    /// `Finished`.
    #[tracing::instrument(skip(self), err)]
    pub async fn get_scheduled_jobs_not_in_final_state(&self) -> JobResult<Vec<JobItem>> {
        let filter = doc! {
            "state": { "$gte": JobState::Scheduled, "$lt": JobState::Finished, "$ne": JobState::Cancelled },
        };
        Ok(self.store.find_many(filter, None).await?)
    }

    /// Distinct workspace ids that still have live jobs, used to decide
    /// which sessions must stay up
    #[tracing::instrument(skip(self), err)]
    pub async fn get_session_ids_with_jobs_not_in_final_state(&self) -> JobResult<Vec<String>> {
        let filter = doc! {
            "state": { "$lt": JobState::Finished, "$ne": JobState::Cancelled },
        };
        Ok(self.store.distinct("workspace_id", filter).await?)
    }

    /// Hard-reset a job to `Submitted`, wiping its step details and both
    /// execution records. Operator escape hatch; no state guard on purpose.
    #[tracing::instrument(skip(self), err)]
    pub async fn reset_job_to_submitted_state(&self, job_id: Uuid) -> JobResult<bool> {
        let update = doc! {
            "$set": {
                "state": JobState::Submitted,
                "state_group": JobStateGroup::Scheduled,
                "step_details": Bson::Array(vec![]),
                "executions": mongodb::bson::to_bson(&JobExecutions::default()).map_err(DatabaseError::SerializationError)?,
            }
        };
        Ok(self.store.update_one(Self::id_filter(job_id), update, None).await? > 0)
    }
}
