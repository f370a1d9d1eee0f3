//! Scheduling engine end-to-end tests (hermetic).
//!
//! Each test drives the full engine over in-memory buckets and enqueuers
//! with a fixed clock: 2021-04-02 10:30 UTC, intake max age 1h, aggregation
//! period 3h, grace period 1h. The aggregation window is therefore
//! `[2021-04-02 06:00, 2021-04-02 09:00)`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use tally_core::clock::FixedClock;
use tally_core::storage::{Bucket, MemoryObjectStore, ObjectStore};
use tally_flow::dispatch::memory::InMemoryEnqueuer;
use tally_flow::error::Error;
use tally_flow::kubernetes::JobSummary;
use tally_flow::scheduler::{
    ScheduleConfig, ScheduleInputs, ScheduleSummary, WorkflowScheduler,
};
use tally_flow::task::{AggregationTask, IntakeTask, Task, Timestamp};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 4, 2, 10, 30, 0).unwrap()
}

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 4, 2, h, m, 0).unwrap()
}

fn scheduler(is_first: bool) -> WorkflowScheduler {
    WorkflowScheduler::new(
        Arc::new(FixedClock(now())),
        ScheduleConfig {
            is_first,
            max_age: Duration::hours(1),
            aggregation_period: Duration::hours(3),
            grace_period: Duration::hours(1),
        },
    )
}

fn siblings(aggregation_id: &str, h: u32, m: u32, id: &str, infix: &str) -> Vec<String> {
    let stem = format!("{aggregation_id}/2021/04/02/{h:02}/{m:02}/{id}");
    vec![
        format!("{stem}.{infix}"),
        format!("{stem}.{infix}.avro"),
        format!("{stem}.{infix}.sig"),
    ]
}

fn job_map(names: &[String]) -> BTreeMap<String, JobSummary> {
    names
        .iter()
        .map(|name| {
            (
                name.clone(),
                JobSummary {
                    name: name.clone(),
                    active: 1,
                    succeeded: 0,
                },
            )
        })
        .collect()
}

struct RunOutcome {
    summary: ScheduleSummary,
    intake_tasks: Vec<IntakeTask>,
    aggregation_tasks: Vec<AggregationTask>,
}

async fn run(
    scheduler: &WorkflowScheduler,
    inputs: &ScheduleInputs,
    store: &Arc<MemoryObjectStore>,
) -> RunOutcome {
    let bucket = Bucket::new(Arc::clone(store) as Arc<dyn ObjectStore>, "gs://own-validation", false);
    let intake_enqueuer = InMemoryEnqueuer::new();
    let aggregation_enqueuer = InMemoryEnqueuer::new();

    let summary = scheduler
        .schedule_tasks(inputs, &bucket, &intake_enqueuer, &aggregation_enqueuer)
        .await
        .expect("scheduling should succeed");

    RunOutcome {
        summary,
        intake_tasks: intake_enqueuer.published(),
        aggregation_tasks: aggregation_enqueuer.published(),
    }
}

#[tokio::test]
async fn s1_happy_intake_emits_task_and_marker() {
    let store = Arc::new(MemoryObjectStore::new());
    let inputs = ScheduleInputs {
        intake_files: siblings("agg1", 10, 0, "uuid-AAAA", "batch"),
        ..ScheduleInputs::default()
    };

    let outcome = run(&scheduler(true), &inputs, &store).await;

    assert_eq!(
        outcome.intake_tasks,
        vec![IntakeTask {
            aggregation_id: "agg1".to_owned(),
            batch_id: "uuid-AAAA".to_owned(),
            date: Timestamp::from(at(10, 0)),
        }]
    );
    assert!(store.contains("task-markers/intake-agg1-2021-04-02-10-00-uuid-AAAA"));
    assert_eq!(outcome.summary.intake.scheduled, 1);
    assert_eq!(outcome.summary.intake.started, 1);
    assert!(outcome.aggregation_tasks.is_empty());
}

#[tokio::test]
async fn s2_stale_batch_is_skipped_without_side_effects() {
    let store = Arc::new(MemoryObjectStore::new());
    let inputs = ScheduleInputs {
        intake_files: siblings("agg1", 8, 0, "uuid-AAAA", "batch"),
        ..ScheduleInputs::default()
    };

    let outcome = run(&scheduler(true), &inputs, &store).await;

    assert!(outcome.intake_tasks.is_empty());
    assert_eq!(outcome.summary.intake.skipped_out_of_window, 1);
    assert_eq!(outcome.summary.intake.scheduled, 0);
    assert!(store.list().await.expect("list should succeed").is_empty());
}

#[tokio::test]
async fn s3_existing_marker_suppresses_emission() {
    let store = Arc::new(MemoryObjectStore::new());
    let inputs = ScheduleInputs {
        intake_files: siblings("agg1", 10, 0, "uuid-AAAA", "batch"),
        own_validation_files: vec![
            "task-markers/intake-agg1-2021-04-02-10-00-uuid-AAAA".to_owned(),
        ],
        ..ScheduleInputs::default()
    };

    let outcome = run(&scheduler(true), &inputs, &store).await;

    assert!(outcome.intake_tasks.is_empty());
    assert_eq!(outcome.summary.intake.skipped_due_to_marker, 1);
    assert!(store.list().await.expect("list should succeed").is_empty());
}

#[tokio::test]
async fn s4_aggregation_over_both_parties_validations() {
    let store = Arc::new(MemoryObjectStore::new());
    let inputs = ScheduleInputs {
        own_validation_files: siblings("agg1", 7, 0, "uuid-B", "validity_0"),
        peer_validation_files: siblings("agg1", 7, 0, "uuid-B", "validity_1"),
        ..ScheduleInputs::default()
    };

    let outcome = run(&scheduler(true), &inputs, &store).await;

    assert_eq!(outcome.aggregation_tasks.len(), 1);
    let task = &outcome.aggregation_tasks[0];
    assert_eq!(task.aggregation_id, "agg1");
    assert_eq!(task.aggregation_start, Timestamp::from(at(6, 0)));
    assert_eq!(task.aggregation_end, Timestamp::from(at(9, 0)));
    assert_eq!(task.batches.len(), 1);
    assert_eq!(task.batches[0].id, "uuid-B");
    assert_eq!(task.batches[0].time, Timestamp::from(at(7, 0)));
    assert!(store.contains("task-markers/aggregate-agg1-2021-04-02-06-00-2021-04-02-09-00"));
    assert_eq!(outcome.summary.aggregation.started, 1);
}

#[tokio::test]
async fn s4_peer_instance_swaps_validity_infixes() {
    // The second party owns validity_1 and treats validity_0 as peer.
    let store = Arc::new(MemoryObjectStore::new());
    let inputs = ScheduleInputs {
        own_validation_files: siblings("agg1", 7, 0, "uuid-B", "validity_1"),
        peer_validation_files: siblings("agg1", 7, 0, "uuid-B", "validity_0"),
        ..ScheduleInputs::default()
    };

    let outcome = run(&scheduler(false), &inputs, &store).await;
    assert_eq!(outcome.aggregation_tasks.len(), 1);
}

#[tokio::test]
async fn s5_missing_peer_validation_blocks_aggregation() {
    let store = Arc::new(MemoryObjectStore::new());
    let inputs = ScheduleInputs {
        own_validation_files: siblings("agg1", 7, 0, "uuid-B", "validity_0"),
        ..ScheduleInputs::default()
    };

    let outcome = run(&scheduler(true), &inputs, &store).await;

    assert!(outcome.aggregation_tasks.is_empty());
    assert_eq!(outcome.summary.aggregation.scheduled, 0);
}

#[tokio::test]
async fn s6_existing_job_without_marker_is_healed() {
    let store = Arc::new(MemoryObjectStore::new());
    let expected_task = IntakeTask {
        aggregation_id: "agg1".to_owned(),
        batch_id: "uuid-AAAA".to_owned(),
        date: Timestamp::from(at(10, 0)),
    };
    let inputs = ScheduleInputs {
        intake_files: siblings("agg1", 10, 0, "uuid-AAAA", "batch"),
        existing_jobs: job_map(&[expected_task.job_name()]),
        ..ScheduleInputs::default()
    };

    let outcome = run(&scheduler(true), &inputs, &store).await;

    assert!(outcome.intake_tasks.is_empty());
    assert_eq!(outcome.summary.intake.healed_existing_job, 1);
    assert_eq!(outcome.summary.intake.scheduled, 0);
    assert!(store.contains("task-markers/intake-agg1-2021-04-02-10-00-uuid-AAAA"));
}

#[tokio::test]
async fn aggregation_window_is_half_open() {
    // 05:00 predates the window, 09:00 is the exclusive end; only 06:00 and
    // 07:00 fall inside [06:00, 09:00).
    let store = Arc::new(MemoryObjectStore::new());
    let mut own = Vec::new();
    let mut peer = Vec::new();
    for (h, id) in [(5, "uuid-V"), (6, "uuid-W"), (7, "uuid-X"), (9, "uuid-Y")] {
        own.extend(siblings("agg1", h, 0, id, "validity_0"));
        peer.extend(siblings("agg1", h, 0, id, "validity_1"));
    }
    let inputs = ScheduleInputs {
        own_validation_files: own,
        peer_validation_files: peer,
        ..ScheduleInputs::default()
    };

    let outcome = run(&scheduler(true), &inputs, &store).await;

    assert_eq!(outcome.aggregation_tasks.len(), 1);
    let mut ids: Vec<&str> = outcome.aggregation_tasks[0]
        .batches
        .iter()
        .map(|b| b.id.as_str())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["uuid-W", "uuid-X"]);
}

#[tokio::test]
async fn aggregation_groups_are_homogeneous() {
    let store = Arc::new(MemoryObjectStore::new());
    let mut own = Vec::new();
    let mut peer = Vec::new();
    for (agg, id) in [("agg1", "uuid-A"), ("agg1", "uuid-B"), ("agg2", "uuid-C")] {
        own.extend(siblings(agg, 7, 0, id, "validity_0"));
        peer.extend(siblings(agg, 7, 0, id, "validity_1"));
    }
    let inputs = ScheduleInputs {
        own_validation_files: own,
        peer_validation_files: peer,
        ..ScheduleInputs::default()
    };

    let outcome = run(&scheduler(true), &inputs, &store).await;

    assert_eq!(outcome.aggregation_tasks.len(), 2);
    for task in &outcome.aggregation_tasks {
        match task.aggregation_id.as_str() {
            "agg1" => assert_eq!(task.batches.len(), 2),
            "agg2" => assert_eq!(task.batches.len(), 1),
            other => panic!("unexpected aggregation id {other}"),
        }
    }
}

#[tokio::test]
async fn second_run_with_markers_visible_emits_nothing() {
    let store = Arc::new(MemoryObjectStore::new());
    let mut inputs = ScheduleInputs {
        intake_files: siblings("agg1", 10, 0, "uuid-AAAA", "batch"),
        own_validation_files: siblings("agg1", 7, 0, "uuid-B", "validity_0"),
        peer_validation_files: siblings("agg1", 7, 0, "uuid-B", "validity_1"),
        ..ScheduleInputs::default()
    };

    let first = run(&scheduler(true), &inputs, &store).await;
    assert_eq!(first.summary.intake.scheduled, 1);
    assert_eq!(first.summary.aggregation.scheduled, 1);

    // The second invocation sees the first run's markers in its
    // own-validation listing.
    inputs
        .own_validation_files
        .extend(store.list().await.expect("list should succeed"));

    let second = run(&scheduler(true), &inputs, &store).await;
    assert!(second.intake_tasks.is_empty());
    assert!(second.aggregation_tasks.is_empty());
    assert_eq!(second.summary.intake.scheduled, 0);
    assert_eq!(second.summary.aggregation.scheduled, 0);
    assert_eq!(second.summary.intake.skipped_due_to_marker, 1);
    assert_eq!(second.summary.aggregation.skipped_due_to_marker, 1);
}

#[tokio::test]
async fn failed_publish_leaves_no_marker() {
    let store = Arc::new(MemoryObjectStore::new());
    let bucket = Bucket::new(Arc::clone(&store) as Arc<dyn ObjectStore>, "gs://own-validation", false);
    let inputs = ScheduleInputs {
        intake_files: siblings("agg1", 10, 0, "uuid-AAAA", "batch"),
        ..ScheduleInputs::default()
    };

    let intake_enqueuer = InMemoryEnqueuer::new();
    intake_enqueuer.fail_publishes();
    let aggregation_enqueuer = InMemoryEnqueuer::new();

    let summary = scheduler(true)
        .schedule_tasks(&inputs, &bucket, &intake_enqueuer, &aggregation_enqueuer)
        .await
        .expect("publish failures are not fatal");

    assert_eq!(summary.intake.scheduled, 1);
    assert_eq!(summary.intake.started, 0);
    assert!(store.list().await.expect("list should succeed").is_empty());
}

#[tokio::test]
async fn dry_run_publishes_and_writes_nothing() {
    let store = Arc::new(MemoryObjectStore::new());
    let bucket = Bucket::new(Arc::clone(&store) as Arc<dyn ObjectStore>, "gs://own-validation", true);
    let inputs = ScheduleInputs {
        intake_files: siblings("agg1", 10, 0, "uuid-AAAA", "batch"),
        ..ScheduleInputs::default()
    };

    let intake_enqueuer = InMemoryEnqueuer::new();
    let aggregation_enqueuer = InMemoryEnqueuer::new();
    let summary = scheduler(true)
        .schedule_tasks(&inputs, &bucket, &intake_enqueuer, &aggregation_enqueuer)
        .await
        .expect("scheduling should succeed");

    // The task still flows through the enqueuer (which would itself be in
    // dry-run mode in production), but the bucket write is suppressed.
    assert_eq!(summary.intake.started, 1);
    assert!(store.list().await.expect("list should succeed").is_empty());
}

#[tokio::test]
async fn diverging_validation_timestamps_are_fatal() {
    let store = Arc::new(MemoryObjectStore::new());
    let bucket = Bucket::new(Arc::clone(&store) as Arc<dyn ObjectStore>, "gs://own-validation", false);
    let inputs = ScheduleInputs {
        own_validation_files: siblings("agg1", 7, 0, "uuid-B", "validity_0"),
        peer_validation_files: siblings("agg1", 7, 30, "uuid-B", "validity_1"),
        ..ScheduleInputs::default()
    };

    let intake_enqueuer = InMemoryEnqueuer::<IntakeTask>::new();
    let aggregation_enqueuer = InMemoryEnqueuer::<AggregationTask>::new();
    let result = scheduler(true)
        .schedule_tasks(&inputs, &bucket, &intake_enqueuer, &aggregation_enqueuer)
        .await;

    assert!(matches!(
        result,
        Err(Error::ValidationTimeMismatch { .. })
    ));
}
