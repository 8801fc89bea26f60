use std::sync::Arc;

use chrono::{Duration, Utc};
use mongodb::bson::{doc, Bson};
use rstest::rstest;
use uuid::Uuid;

use crate::core::client::database::MockJobStore;
use crate::core::client::publisher::MockEventPublisher;
use crate::error::JobError;
use crate::lifecycle::JobStateMachine;
use crate::tests::utils::{build_job_item, consumed_resource, with_cost, with_gpu, with_steps};
use crate::types::jobs::event::JobEventKind;
use crate::types::jobs::step_updates::StepDetailsUpdate;
use crate::types::jobs::types::{GpuState, JobState, JobStateGroup, StepState};

fn machine(store: MockJobStore, publisher: MockEventPublisher) -> JobStateMachine {
    JobStateMachine::new(Arc::new(store), Arc::new(publisher))
}

#[tokio::test]
async fn scheduling_claim_targets_ready_uncancelled_jobs() {
    let mut store = MockJobStore::new();
    let job = build_job_item(JobState::Scheduling, JobStateGroup::Scheduled);
    let returned = job.clone();

    store
        .expect_find_one_and_update()
        .withf(|filter, update, array_filters| {
            let set = update.get_document("$set").unwrap();
            filter.get_i32("state").unwrap() == JobState::ReadyForScheduling.as_i32()
                && !filter.get_bool("cancellation_info.is_cancelled").unwrap()
                && set.get_i32("state").unwrap() == JobState::Scheduling.as_i32()
                && set.get_str("state_group").unwrap() == "Scheduled"
                && set.contains_key("executions.main.process_start_time")
                && array_filters.is_none()
        })
        .times(1)
        .returning(move |_, _, _| Ok(Some(returned.clone())));

    let machine = machine(store, MockEventPublisher::new());
    let claimed = machine.find_and_lock_job_for_scheduling().await.unwrap();
    assert_eq!(claimed.unwrap().id, job.id);
}

#[tokio::test]
async fn scheduling_claim_passes_through_empty_result() {
    let mut store = MockJobStore::new();
    store.expect_find_one_and_update().times(1).returning(|_, _, _| Ok(None));

    let machine = machine(store, MockEventPublisher::new());
    assert!(machine.find_and_lock_job_for_scheduling().await.unwrap().is_none());
}

#[tokio::test]
async fn reset_scheduling_jobs_sweeps_claims_older_than_threshold() {
    let threshold = Utc::now() - Duration::minutes(10);
    let mut store = MockJobStore::new();

    store
        .expect_update_many()
        .withf(move |filter, update| {
            let stale = filter.get_document("executions.main.process_start_time").unwrap();
            filter.get_i32("state").unwrap() == JobState::Scheduling.as_i32()
                && stale.get_i64("$lt").unwrap() == threshold.timestamp()
                && update.get_document("$set").unwrap().get_i32("state").unwrap() == JobState::Submitted.as_i32()
                && update.get_document("$unset").unwrap().contains_key("executions.main.process_start_time")
                && update.get_document("$inc").unwrap().get_i32("executions.main.start_retry_counter").unwrap() == 1
        })
        .times(1)
        .returning(|_, _| Ok(3));

    let machine = machine(store, MockEventPublisher::new());
    assert_eq!(machine.reset_scheduling_jobs(threshold).await.unwrap(), 3);
}

#[tokio::test]
async fn set_scheduled_state_records_execution_identifiers() {
    let job_id = Uuid::new_v4();
    let steps = vec![
        crate::types::jobs::job_item::StepDetails::waiting("prepare"),
        crate::types::jobs::job_item::StepDetails::waiting("train"),
    ];
    let mut store = MockJobStore::new();

    store
        .expect_update_one()
        .withf(|filter, update, _| {
            let set = update.get_document("$set").unwrap();
            filter.get_i32("state").unwrap() == JobState::Scheduling.as_i32()
                && set.get_i32("state").unwrap() == JobState::Scheduled.as_i32()
                && set.get_str("executions.main.launch_plan_id").unwrap() == "lp-1"
                && set.get_str("executions.main.execution_id").unwrap() == "exec-1"
                && set.get_array("step_details").unwrap().len() == 2
                && update.get_document("$unset").unwrap().contains_key("executions.main.process_start_time")
        })
        .times(1)
        .returning(|_, _, _| Ok(1));

    let machine = machine(store, MockEventPublisher::new());
    assert!(machine.set_scheduled_state(job_id, "lp-1".to_string(), "exec-1".to_string(), steps).await.unwrap());
}

#[rstest]
#[case::gpu_reserved(true)]
#[case::no_gpu(false)]
#[tokio::test]
async fn finishing_folds_gpu_release_into_the_same_write(#[case] gpu_reserved: bool) {
    let mut job = build_job_item(JobState::Running, JobStateGroup::Running);
    if gpu_reserved {
        job = with_gpu(job, GpuState::Reserved);
    }
    let job_id = job.id;

    let mut updated = job.clone();
    updated.state = JobState::Finished;
    updated.state_group = JobStateGroup::Finished;
    updated.end_time = Some(Utc::now());

    let mut store = MockJobStore::new();
    let fetched = job.clone();
    store.expect_get_job_by_id().times(1).returning(move |_| Ok(Some(fetched.clone())));
    let returned = updated.clone();
    store
        .expect_find_one_and_update()
        .withf(move |_, update, _| {
            let set = update.get_document("$set").unwrap();
            set.get_i32("state").unwrap() == JobState::Finished.as_i32()
                && set.get_str("state_group").unwrap() == "Finished"
                && set.contains_key("end_time")
                && set.contains_key("gpu.state") == gpu_reserved
        })
        .times(1)
        .returning(move |_, _, _| Ok(Some(returned.clone())));

    let mut publisher = MockEventPublisher::new();
    publisher
        .expect_publish()
        .withf(move |event| event.kind == JobEventKind::Finished && event.job_id == job_id)
        .times(1)
        .returning(|_| Ok(()));

    let machine = machine(store, publisher);
    let result = machine.set_and_publish_finished_state(job_id).await.unwrap();
    assert_eq!(result.state, JobState::Finished);
}

#[tokio::test]
async fn finishing_a_missing_job_fails_without_writing_or_publishing() {
    let job_id = Uuid::new_v4();
    let mut store = MockJobStore::new();
    store.expect_get_job_by_id().times(1).returning(|_| Ok(None));

    // No update or publish expectations; the mocks panic if either happens.
    let machine = machine(store, MockEventPublisher::new());
    let err = machine.set_and_publish_finished_state(job_id).await.unwrap_err();
    assert!(matches!(err, JobError::JobNotFound { id } if id == job_id));
}

#[tokio::test]
async fn failing_closes_running_steps_and_clears_both_timers() {
    let job = with_steps(
        build_job_item(JobState::Running, JobStateGroup::Running),
        vec![("prepare", StepState::Finished), ("train", StepState::Running)],
    );
    let job_id = job.id;
    let mut updated = job.clone();
    updated.state = JobState::Failed;
    updated.state_group = JobStateGroup::Failed;

    let mut store = MockJobStore::new();
    let fetched = job.clone();
    store.expect_get_job_by_id().times(1).returning(move |_| Ok(Some(fetched.clone())));
    let returned = updated.clone();
    store
        .expect_find_one_and_update()
        .withf(|_, update, array_filters| {
            let set = update.get_document("$set").unwrap();
            let unset = update.get_document("$unset").unwrap();
            set.get_i32("state").unwrap() == JobState::Failed.as_i32()
                && set.get_str("step_details.$[step].state").unwrap() == "Finished"
                && unset.contains_key("executions.main.process_start_time")
                && unset.contains_key("executions.revert.process_start_time")
                && array_filters == &Some(vec![doc! { "step.state": "Running" }])
        })
        .times(1)
        .returning(move |_, _, _| Ok(Some(returned.clone())));

    let mut publisher = MockEventPublisher::new();
    publisher
        .expect_publish()
        .withf(move |event| event.kind == JobEventKind::Failed && event.job_id == job_id)
        .times(1)
        .returning(|_| Ok(()));

    let machine = machine(store, publisher);
    let result = machine.set_and_publish_failed_state(job_id).await.unwrap();
    assert_eq!(result.state_group, JobStateGroup::Failed);
}

#[tokio::test]
async fn cancelling_marks_pending_steps_and_reports_cancel_time() {
    let job = with_steps(
        build_job_item(JobState::Canceling, JobStateGroup::Running),
        vec![("prepare", StepState::Finished), ("train", StepState::Running), ("export", StepState::Waiting)],
    );
    let job_id = job.id;
    let cancel_time = Utc::now() - Duration::seconds(1);
    let mut updated = job.clone();
    updated.state = JobState::Cancelled;
    updated.state_group = JobStateGroup::Cancelled;
    updated.cancellation_info.cancel_time = Some(cancel_time);

    let mut store = MockJobStore::new();
    let fetched = job.clone();
    store.expect_get_job_by_id().times(1).returning(move |_| Ok(Some(fetched.clone())));
    let returned = updated.clone();
    store
        .expect_find_one_and_update()
        .withf(|_, update, array_filters| {
            let set = update.get_document("$set").unwrap();
            set.get_i32("state").unwrap() == JobState::Cancelled.as_i32()
                && set.get_str("step_details.$[step].state").unwrap() == "Cancelled"
                && set.contains_key("cancellation_info.cancel_time")
                && array_filters == &Some(vec![doc! { "step.state": { "$in": ["Waiting", "Running"] } }])
        })
        .times(1)
        .returning(move |_, _, _| Ok(Some(returned.clone())));

    let mut publisher = MockEventPublisher::new();
    publisher
        .expect_publish()
        .withf(move |event| {
            event.kind == JobEventKind::Cancelled
                && event.payload.end_time.map(|t| t.timestamp()) == Some(cancel_time.timestamp())
        })
        .times(1)
        .returning(|_| Ok(()));

    let machine = machine(store, publisher);
    machine.set_and_publish_cancelled_state(job_id).await.unwrap();
}

#[rstest]
#[case::delete(true)]
#[case::keep(false)]
#[tokio::test]
async fn cancellation_request_records_deletion_intent(#[case] delete_job: bool) {
    let job_id = Uuid::new_v4();
    let mut store = MockJobStore::new();

    store
        .expect_update_one()
        .withf(move |_, update, _| {
            let set = update.get_document("$set").unwrap();
            set.get_bool("cancellation_info.is_cancelled").unwrap()
                && set.contains_key("cancellation_info.request_time")
                && set.get_bool("cancellation_info.delete_job").unwrap() == delete_job
        })
        .times(1)
        .returning(|_, _, _| Ok(1));

    let machine = machine(store, MockEventPublisher::new());
    assert!(machine.mark_cancelled_and_deleted(job_id, delete_job).await.unwrap());
}

#[tokio::test]
async fn canceling_claim_leaves_state_group_untouched() {
    let mut store = MockJobStore::new();
    let job = build_job_item(JobState::Canceling, JobStateGroup::Running);
    let returned = job.clone();

    store
        .expect_find_one_and_update()
        .withf(|filter, update, _| {
            let eligible = filter.get_document("state").unwrap().get_array("$in").unwrap();
            let set = update.get_document("$set").unwrap();
            eligible == &vec![Bson::Int32(3), Bson::Int32(4)]
                && filter.get_bool("cancellation_info.is_cancelled").unwrap()
                && set.get_i32("state").unwrap() == JobState::Canceling.as_i32()
                && !set.contains_key("state_group")
        })
        .times(1)
        .returning(move |_, _, _| Ok(Some(returned.clone())));

    let machine = machine(store, MockEventPublisher::new());
    let claimed = machine.find_and_lock_job_for_canceling().await.unwrap().unwrap();
    assert_eq!(claimed.state_group, JobStateGroup::Running);
}

#[tokio::test]
async fn reset_canceling_job_restores_state_from_its_group() {
    let job_id = Uuid::new_v4();
    let mut store = MockJobStore::new();

    store
        .expect_update_one()
        .withf(|filter, update, _| {
            let group = filter.get_str("state_group").unwrap();
            let restored = update.get_document("$set").unwrap().get_i32("state").unwrap();
            let expected = match group {
                "Scheduled" => JobState::Scheduled.as_i32(),
                "Running" => JobState::Running.as_i32(),
                _ => return false,
            };
            filter.get_i32("state").unwrap() == JobState::Canceling.as_i32()
                && restored == expected
                && update.get_document("$inc").unwrap().contains_key("executions.main.cancel_retry_counter")
        })
        .times(2)
        .returning(|filter, _, _| Ok(u64::from(filter.get_str("state_group").unwrap() == "Running")));

    let machine = machine(store, MockEventPublisher::new());
    assert!(machine.reset_canceling_job(job_id).await.unwrap());
}

#[tokio::test]
async fn dropping_the_cancelled_flag_reopens_the_job_for_claims() {
    let job_id = Uuid::new_v4();
    let mut store = MockJobStore::new();

    store
        .expect_update_one()
        .withf(|filter, update, _| {
            let set = update.get_document("$set").unwrap();
            filter.get_i32("state").unwrap() == JobState::Canceling.as_i32()
                && !set.get_bool("cancellation_info.is_cancelled").unwrap()
                && update.get_document("$unset").unwrap().contains_key("executions.main.process_start_time")
        })
        .times(2)
        .returning(|filter, _, _| Ok(u64::from(filter.get_str("state_group").unwrap() == "Scheduled")));

    let machine = machine(store, MockEventPublisher::new());
    assert!(machine.drop_cancelled_flag(job_id).await.unwrap());
}

#[tokio::test]
async fn cost_updates_require_a_cost_record() {
    let job = build_job_item(JobState::Running, JobStateGroup::Running);
    let job_id = job.id;
    let mut store = MockJobStore::new();
    store.expect_get_job_by_id().times(1).returning(move |_| Ok(Some(job.clone())));

    let machine = machine(store, MockEventPublisher::new());
    let err = machine.update_cost_consumed(job_id, vec![consumed_resource("compute", 2.5)]).await.unwrap_err();
    assert!(matches!(err, JobError::MissingCost { id } if id == job_id));
}

#[tokio::test]
async fn cost_updates_skip_services_already_recorded() {
    let job = with_cost(
        build_job_item(JobState::Running, JobStateGroup::Running),
        vec![consumed_resource("compute", 2.5)],
        false,
    );
    let job_id = job.id;
    let mut store = MockJobStore::new();
    store.expect_get_job_by_id().times(1).returning(move |_| Ok(Some(job.clone())));

    // No update_one expectation; pushing a known service would panic the mock.
    let machine = machine(store, MockEventPublisher::new());
    assert!(!machine.update_cost_consumed(job_id, vec![consumed_resource("compute", 9.0)]).await.unwrap());
}

#[tokio::test]
async fn cost_updates_push_new_services_with_a_duplicate_guard() {
    let job = with_cost(
        build_job_item(JobState::Running, JobStateGroup::Running),
        vec![consumed_resource("compute", 2.5)],
        false,
    );
    let job_id = job.id;
    let mut store = MockJobStore::new();
    store.expect_get_job_by_id().times(1).returning(move |_| Ok(Some(job.clone())));

    store
        .expect_update_one()
        .withf(|filter, update, _| {
            let guard = filter.get_document("cost.consumed.service").unwrap();
            let pushed = update.get_document("$push").unwrap().get_document("cost.consumed").unwrap();
            guard.get_str("$ne").unwrap() == "storage" && pushed.get_str("service").unwrap() == "storage"
        })
        .times(1)
        .returning(|_, _, _| Ok(1));

    let machine = machine(store, MockEventPublisher::new());
    let resources = vec![consumed_resource("compute", 9.0), consumed_resource("storage", 1.0)];
    assert!(machine.update_cost_consumed(job_id, resources).await.unwrap());
}

#[tokio::test]
async fn cost_reporting_skips_jobs_without_cost() {
    let job_id = Uuid::new_v4();
    let mut store = MockJobStore::new();

    store
        .expect_update_one()
        .withf(|filter, update, _| {
            filter.get_document("cost").unwrap().get("$ne") == Some(&Bson::Null)
                && update.get_document("$set").unwrap().get_bool("cost.reported").unwrap()
        })
        .times(1)
        .returning(|_, _, _| Ok(0));

    let machine = machine(store, MockEventPublisher::new());
    assert!(!machine.set_cost_reported(job_id).await.unwrap());
}

#[tokio::test]
async fn empty_step_patch_is_rejected_before_touching_the_store() {
    let machine = machine(MockJobStore::new(), MockEventPublisher::new());
    let err = machine.set_step_details(Uuid::new_v4(), "train", StepDetailsUpdate::new()).await.unwrap_err();
    assert!(matches!(err, JobError::NoUpdateFound));
}

#[tokio::test]
async fn step_patch_writes_only_the_fields_it_carries() {
    let job_id = Uuid::new_v4();
    let patch = StepDetailsUpdate::new().update_state(StepState::Running).update_progress(0.5);
    let mut store = MockJobStore::new();

    store
        .expect_update_one()
        .withf(|_, update, array_filters| {
            let set = update.get_document("$set").unwrap();
            set.get_str("step_details.$[step].state").unwrap() == "Running"
                && set.get_f64("step_details.$[step].progress").unwrap() == 0.5
                && !set.contains_key("step_details.$[step].message")
                && array_filters == &Some(vec![doc! { "step.task_id": "train" }])
        })
        .times(1)
        .returning(|_, _, _| Ok(1));

    let machine = machine(store, MockEventPublisher::new());
    assert!(machine.set_step_details(job_id, "train", patch).await.unwrap());
}

#[tokio::test]
async fn metadata_updates_merge_keys_instead_of_replacing_the_map() {
    let job_id = Uuid::new_v4();
    let mut store = MockJobStore::new();

    store
        .expect_update_one()
        .withf(|_, update, _| {
            let set = update.get_document("$set").unwrap();
            set.get_str("metadata.checkpoint").unwrap() == "chk-42" && !set.contains_key("metadata")
        })
        .times(1)
        .returning(|_, _, _| Ok(1));

    let machine = machine(store, MockEventPublisher::new());
    assert!(machine.update_metadata(job_id, doc! { "checkpoint": "chk-42" }).await.unwrap());

    let machine = JobStateMachine::new(Arc::new(MockJobStore::new()), Arc::new(MockEventPublisher::new()));
    let err = machine.update_metadata(job_id, doc! {}).await.unwrap_err();
    assert!(matches!(err, JobError::NoUpdateFound));
}

#[tokio::test]
async fn revert_claim_tracks_its_timer_on_the_revert_record() {
    let mut store = MockJobStore::new();
    let job = build_job_item(JobState::RevertScheduling, JobStateGroup::Scheduled);
    let returned = job.clone();

    store
        .expect_find_one_and_update()
        .withf(|filter, update, _| {
            let set = update.get_document("$set").unwrap();
            filter.get_i32("state").unwrap() == JobState::ReadyForRevert.as_i32()
                && !filter.get_bool("cancellation_info.is_cancelled").unwrap()
                && set.get_i32("state").unwrap() == JobState::RevertScheduling.as_i32()
                && set.contains_key("executions.revert.process_start_time")
                && !set.contains_key("executions.main.process_start_time")
        })
        .times(1)
        .returning(move |_, _, _| Ok(Some(returned.clone())));

    let machine = machine(store, MockEventPublisher::new());
    assert!(machine.find_and_lock_job_for_reverting().await.unwrap().is_some());
}

#[tokio::test]
async fn revert_running_keeps_the_forward_start_time() {
    let job_id = Uuid::new_v4();
    let mut store = MockJobStore::new();

    store
        .expect_update_one()
        .withf(|filter, update, _| {
            let set = update.get_document("$set").unwrap();
            filter.get_i32("state").unwrap() == JobState::RevertScheduled.as_i32()
                && set.get_i32("state").unwrap() == JobState::RevertRunning.as_i32()
                && set.get_str("state_group").unwrap() == "Running"
                && !set.contains_key("start_time")
        })
        .times(1)
        .returning(|_, _, _| Ok(1));

    let machine = machine(store, MockEventPublisher::new());
    assert!(machine.set_revert_running_state(job_id).await.unwrap());
}

#[tokio::test]
async fn deletion_candidates_must_be_terminal_with_settled_cost() {
    let mut store = MockJobStore::new();

    store
        .expect_find_one()
        .withf(|filter| {
            let states = filter.get_document("state").unwrap().get_array("$in").unwrap();
            let cost_settled = filter.get_array("$or").unwrap();
            states == &vec![Bson::Int32(6), Bson::Int32(11), Bson::Int32(12)]
                && filter.get_bool("cancellation_info.delete_job").unwrap()
                && cost_settled.len() == 2
        })
        .times(1)
        .returning(|_| Ok(None));

    let machine = machine(store, MockEventPublisher::new());
    assert!(machine.get_job_to_delete().await.unwrap().is_none());
}

#[tokio::test]
async fn live_job_queries_exclude_cancelled_despite_its_low_ordinal() {
    let mut store = MockJobStore::new();

    store
        .expect_find_many()
        .withf(|filter, _| {
            let range = filter.get_document("state").unwrap();
            range.get_i32("$gte").unwrap() == JobState::Scheduled.as_i32()
                && range.get_i32("$lt").unwrap() == JobState::Finished.as_i32()
                && range.get_i32("$ne").unwrap() == JobState::Cancelled.as_i32()
        })
        .times(1)
        .returning(|_, _| Ok(vec![]));

    store
        .expect_distinct()
        .withf(|field, filter| {
            let range = filter.get_document("state").unwrap();
            field == "workspace_id"
                && range.get_i32("$lt").unwrap() == JobState::Finished.as_i32()
                && range.get_i32("$ne").unwrap() == JobState::Cancelled.as_i32()
        })
        .times(1)
        .returning(|_, _| Ok(vec!["ws-1".to_string()]));

    let machine = machine(store, MockEventPublisher::new());
    assert!(machine.get_scheduled_jobs_not_in_final_state().await.unwrap().is_empty());
    assert_eq!(machine.get_session_ids_with_jobs_not_in_final_state().await.unwrap(), vec!["ws-1".to_string()]);
}

#[tokio::test]
async fn hard_reset_wipes_steps_and_both_execution_records() {
    let job_id = Uuid::new_v4();
    let mut store = MockJobStore::new();

    store
        .expect_update_one()
        .withf(|_, update, _| {
            let set = update.get_document("$set").unwrap();
            set.get_i32("state").unwrap() == JobState::Submitted.as_i32()
                && set.get_array("step_details").unwrap().is_empty()
                && set.get_document("executions").unwrap().contains_key("main")
        })
        .times(1)
        .returning(|_, _, _| Ok(1));

    let machine = machine(store, MockEventPublisher::new());
    assert!(machine.reset_job_to_submitted_state(job_id).await.unwrap());
}
