//! The scheduling engine.
//!
//! One invocation evaluates bucket listings and cluster state, then emits
//! intake and aggregation tasks exactly once per logical unit of work:
//!
//! 1. Parse ready intake batches from the ingestor listing
//! 2. Collect task markers from the own-validation listing
//! 3. Window intake batches to `[now - max_age, now + 24h)`
//! 4. Emit intake tasks for unmarked batches without a live job
//! 5. Parse own and peer validation batches and intersect them by batch ID
//! 6. Window the intersection to the current aggregation interval
//! 7. Group by aggregation ID and emit one aggregation task per group
//! 8. Wait for both enqueuers to drain before returning
//!
//! Correctness rests on the marker protocol: a marker is written only after
//! a successful publish acknowledgement (inside the completion), or
//! synchronously when a pre-existing job is discovered without a marker (a
//! healing write, whose failure is fatal). A failed publish leaves no
//! marker, so the next invocation retries; downstream consumers are
//! expected to treat duplicate tasks as no-ops.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use serde::Serialize;
use tracing::{info, warn};

use tally_core::clock::{aggregation_interval, Clock, Interval, TIMESTAMP_FORMAT};
use tally_core::storage::{Bucket, TASK_MARKER_PREFIX};

use crate::batch_path::{ready_batches, within_interval, BatchPath};
use crate::dispatch::{Completion, Enqueuer};
use crate::error::{Error, Result};
use crate::kubernetes::JobSummary;
use crate::metrics::{labels, names};
use crate::task::{AggregationTask, Batch, IntakeTask, Task, Timestamp};

/// Infix discriminator for intake batch listings.
const INTAKE_INFIX: &str = "batch";

/// Scheduling parameters, fixed for the lifetime of one invocation.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleConfig {
    /// Whether this instance is the "first" party, selecting which validity
    /// infix is treated as our own.
    pub is_first: bool,
    /// Maximum age for intake batches to be worth processing.
    pub max_age: Duration,
    /// Length of each aggregation window.
    pub aggregation_period: Duration,
    /// Delay applied before scheduling an aggregation, allowing
    /// late-arriving validations to land.
    pub grace_period: Duration,
}

/// Point-in-time observations of external state, gathered before the engine
/// runs.
#[derive(Debug, Clone, Default)]
pub struct ScheduleInputs {
    /// Listing of the ingestor bucket.
    pub intake_files: Vec<String>,
    /// Listing of the own-validation bucket (includes task markers).
    pub own_validation_files: Vec<String>,
    /// Listing of the peer-validation bucket.
    pub peer_validation_files: Vec<String>,
    /// Existing jobs in the worker namespace, keyed by job name.
    pub existing_jobs: BTreeMap<String, JobSummary>,
}

/// Outcome counters for the intake emission phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntakeSummary {
    /// Tasks handed to the enqueuer.
    pub scheduled: u64,
    /// Tasks whose publish was acknowledged and marker written.
    pub started: u64,
    /// Batches outside the intake window entirely.
    pub skipped_out_of_window: u64,
    /// Batches older than the age limit at emission time.
    pub skipped_due_to_age: u64,
    /// Batches whose task marker already existed.
    pub skipped_due_to_marker: u64,
    /// Batches with a live job but no marker; a marker was written.
    pub healed_existing_job: u64,
}

/// Outcome counters for the aggregation emission phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregationSummary {
    /// Tasks handed to the enqueuer.
    pub scheduled: u64,
    /// Tasks whose publish was acknowledged and marker written.
    pub started: u64,
    /// Groups whose task marker already existed.
    pub skipped_due_to_marker: u64,
    /// Groups with a live job but no marker; a marker was written.
    pub healed_existing_job: u64,
}

/// Outcome of one scheduler invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleSummary {
    /// Intake emission counters.
    pub intake: IntakeSummary,
    /// Aggregation emission counters.
    pub aggregation: AggregationSummary,
}

/// The scheduling engine. See the module documentation for the protocol.
pub struct WorkflowScheduler {
    clock: Arc<dyn Clock>,
    config: ScheduleConfig,
}

impl WorkflowScheduler {
    /// Creates a scheduler over the given clock and parameters.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, config: ScheduleConfig) -> Self {
        Self { clock, config }
    }

    /// Evaluates bucket contents and cluster state, emitting new tasks to
    /// the two enqueuers and task markers to the own-validation bucket.
    ///
    /// Returns only after both enqueuers have drained, so every completion
    /// (and therefore every post-publish marker write) has finished.
    ///
    /// # Errors
    ///
    /// Listing parse failures, intersection inconsistencies, and healing
    /// marker-write failures are fatal. Asynchronous publish failures are
    /// logged and suppressed; the affected tasks are retried next
    /// invocation.
    pub async fn schedule_tasks(
        &self,
        inputs: &ScheduleInputs,
        own_validation_bucket: &Bucket,
        intake_enqueuer: &dyn Enqueuer<IntakeTask>,
        aggregation_enqueuer: &dyn Enqueuer<AggregationTask>,
    ) -> Result<ScheduleSummary> {
        let intake_batches = ready_batches(&inputs.intake_files, INTAKE_INFIX)?;

        // Set of tasks for which marker objects exist, for cheap lookup.
        let task_markers: HashSet<&str> = inputs
            .own_validation_files
            .iter()
            .filter_map(|object| object.strip_prefix(TASK_MARKER_PREFIX))
            .collect();

        let now = self.clock.now();
        let intake_window = Interval::new(now - self.config.max_age, now + Duration::hours(24));
        let total_intake = intake_batches.len();
        let current_intake = within_interval(intake_batches, &intake_window);
        let skipped_out_of_window = (total_intake - current_intake.len()) as u64;
        info!(skipped = skipped_out_of_window, "skipping batches as too old");

        let intakes_started = Arc::new(AtomicU64::new(0));
        let mut intake = self
            .enqueue_intake_tasks(
                current_intake,
                &task_markers,
                &inputs.existing_jobs,
                own_validation_bucket,
                intake_enqueuer,
                &intakes_started,
            )
            .await?;
        intake.skipped_out_of_window = skipped_out_of_window;

        let own_infix = format!("validity_{}", validity_index(self.config.is_first));
        let own_validations = ready_batches(&inputs.own_validation_files, &own_infix)?;
        info!(count = own_validations.len(), "found own validations");

        let peer_infix = format!("validity_{}", validity_index(!self.config.is_first));
        let peer_validations = ready_batches(&inputs.peer_validation_files, &peer_infix)?;
        info!(count = peer_validations.len(), "found peer validations");

        let aggregation_batches = intersect_validations(own_validations, peer_validations)?;

        let interval = aggregation_interval(
            self.clock.as_ref(),
            self.config.aggregation_period,
            self.config.grace_period,
        );
        info!(interval = %interval, "looking for batches to aggregate");
        let in_window = within_interval(aggregation_batches, &interval);
        let grouped = group_by_aggregation_id(in_window);

        let aggregations_started = Arc::new(AtomicU64::new(0));
        let mut aggregation = self
            .enqueue_aggregation_tasks(
                grouped,
                &interval,
                &task_markers,
                &inputs.existing_jobs,
                own_validation_bucket,
                aggregation_enqueuer,
                &aggregations_started,
            )
            .await?;

        // Ensure both task enqueuers have completed their asynchronous work
        // before allowing the process to exit.
        intake_enqueuer.stop().await;
        aggregation_enqueuer.stop().await;

        intake.started = intakes_started.load(Ordering::Relaxed);
        aggregation.started = aggregations_started.load(Ordering::Relaxed);
        Ok(ScheduleSummary {
            intake,
            aggregation,
        })
    }

    async fn enqueue_intake_tasks(
        &self,
        batches: Vec<BatchPath>,
        task_markers: &HashSet<&str>,
        existing_jobs: &BTreeMap<String, JobSummary>,
        own_validation_bucket: &Bucket,
        enqueuer: &dyn Enqueuer<IntakeTask>,
        started: &Arc<AtomicU64>,
    ) -> Result<IntakeSummary> {
        let mut summary = IntakeSummary::default();
        let now = self.clock.now();

        for batch in batches {
            if now - batch.time > self.config.max_age {
                summary.skipped_due_to_age += 1;
                counter!(names::TASKS_SKIPPED_TOTAL, labels::KIND => "intake", labels::REASON => "age")
                    .increment(1);
                continue;
            }

            let task = IntakeTask {
                aggregation_id: batch.aggregation_id.clone(),
                batch_id: batch.id.clone(),
                date: Timestamp::from(batch.time),
            };
            let marker = task.marker();

            if task_markers.contains(marker.as_str()) {
                summary.skipped_due_to_marker += 1;
                counter!(names::TASKS_SKIPPED_TOTAL, labels::KIND => "intake", labels::REASON => "marker")
                    .increment(1);
                continue;
            }

            if existing_jobs.contains_key(&task.job_name()) {
                // A job for this task exists but no marker does, most likely
                // created by an older scheduler version. Write the marker so
                // the job can be reaped safely when it finishes.
                summary.healed_existing_job += 1;
                counter!(names::TASKS_SKIPPED_TOTAL, labels::KIND => "intake", labels::REASON => "existing_job")
                    .increment(1);
                own_validation_bucket.write_task_marker(&marker).await?;
                continue;
            }

            info!(batch = %batch, "scheduling intake task");
            summary.scheduled += 1;
            enqueuer.enqueue(
                task,
                marker_completion(
                    own_validation_bucket.clone(),
                    marker,
                    Arc::clone(started),
                    names::INTAKE_TASKS_STARTED_TOTAL,
                    "intake",
                ),
            );
        }

        info!(
            skipped_due_to_age = summary.skipped_due_to_age,
            skipped_due_to_marker = summary.skipped_due_to_marker,
            healed_existing_job = summary.healed_existing_job,
            scheduled = summary.scheduled,
            "intake emission complete"
        );
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn enqueue_aggregation_tasks(
        &self,
        batches_by_id: BTreeMap<String, Vec<BatchPath>>,
        interval: &Interval,
        task_markers: &HashSet<&str>,
        existing_jobs: &BTreeMap<String, JobSummary>,
        own_validation_bucket: &Bucket,
        enqueuer: &dyn Enqueuer<AggregationTask>,
        started: &Arc<AtomicU64>,
    ) -> Result<AggregationSummary> {
        let mut summary = AggregationSummary::default();
        if batches_by_id.is_empty() {
            info!("no batches to aggregate");
            return Ok(summary);
        }

        for (aggregation_id, group) in batches_by_id {
            let mut batches = Vec::with_capacity(group.len());
            for batch_path in &group {
                // All batches in a group must share the aggregation ID;
                // anything else is upstream corruption.
                if batch_path.aggregation_id != aggregation_id {
                    return Err(Error::AggregationIdMismatch {
                        found: batch_path.aggregation_id.clone(),
                        wanted: aggregation_id,
                    });
                }
                batches.push(Batch {
                    id: batch_path.id.clone(),
                    time: Timestamp::from(batch_path.time),
                });
            }

            let batch_count = batches.len();
            let task = AggregationTask {
                aggregation_id: aggregation_id.clone(),
                aggregation_start: Timestamp::from(interval.begin),
                aggregation_end: Timestamp::from(interval.end),
                batches,
            };
            let marker = task.marker();

            if task_markers.contains(marker.as_str()) {
                summary.skipped_due_to_marker += 1;
                counter!(names::TASKS_SKIPPED_TOTAL, labels::KIND => "aggregation", labels::REASON => "marker")
                    .increment(1);
                continue;
            }

            let job_name = task.job_name();
            if existing_jobs.contains_key(&job_name) {
                // Same healing path as for intake tasks: the job predates
                // markers, so write one rather than re-emitting the task.
                summary.healed_existing_job += 1;
                counter!(names::TASKS_SKIPPED_TOTAL, labels::KIND => "aggregation", labels::REASON => "existing_job")
                    .increment(1);
                own_validation_bucket.write_task_marker(&marker).await?;
                continue;
            }

            info!(
                %job_name,
                interval = %interval,
                %aggregation_id,
                batch_count,
                "scheduling aggregation task"
            );
            summary.scheduled += 1;
            enqueuer.enqueue(
                task,
                marker_completion(
                    own_validation_bucket.clone(),
                    marker,
                    Arc::clone(started),
                    names::AGGREGATION_TASKS_STARTED_TOTAL,
                    "aggregation",
                ),
            );
        }

        info!(
            skipped_due_to_marker = summary.skipped_due_to_marker,
            healed_existing_job = summary.healed_existing_job,
            scheduled = summary.scheduled,
            "aggregation emission complete"
        );
        Ok(summary)
    }
}

/// Builds the completion that orders the marker write after a successful
/// publish. A failed publish writes no marker; a failed marker write after a
/// successful publish is logged and tolerated (the next invocation may
/// re-publish and downstream consumers are idempotent).
fn marker_completion(
    bucket: Bucket,
    marker: String,
    started: Arc<AtomicU64>,
    started_counter: &'static str,
    kind: &'static str,
) -> Completion {
    Box::new(move |result| {
        Box::pin(async move {
            if let Err(err) = result {
                warn!(%err, kind, "failed to enqueue task");
                return;
            }
            if let Err(err) = bucket.write_task_marker(&marker).await {
                warn!(%err, kind, %marker, "failed to write task marker");
                return;
            }
            started.fetch_add(1, Ordering::Relaxed);
            counter!(started_counter).increment(1);
        })
    })
}

/// Selects which validity infix index belongs to this instance.
const fn validity_index(own: bool) -> u8 {
    if own {
        0
    } else {
        1
    }
}

/// Intersects own and peer validations by batch ID.
///
/// The returned descriptors are the peer ones; own and peer must agree on
/// each shared batch's timestamp, and a divergence is treated as upstream
/// corruption rather than silently preferring either side.
fn intersect_validations(
    own: Vec<BatchPath>,
    peer: Vec<BatchPath>,
) -> Result<Vec<BatchPath>> {
    let own_times: HashMap<&str, DateTime<Utc>> =
        own.iter().map(|batch| (batch.id.as_str(), batch.time)).collect();

    let mut intersection = Vec::new();
    for peer_batch in peer {
        match own_times.get(peer_batch.id.as_str()) {
            None => {}
            Some(own_time) if *own_time != peer_batch.time => {
                return Err(Error::ValidationTimeMismatch {
                    batch_id: peer_batch.id,
                    own: own_time.format(TIMESTAMP_FORMAT).to_string(),
                    peer: peer_batch.time.format(TIMESTAMP_FORMAT).to_string(),
                });
            }
            Some(_) => intersection.push(peer_batch),
        }
    }
    Ok(intersection)
}

/// Groups batches by aggregation ID, in deterministic order.
fn group_by_aggregation_id(batches: Vec<BatchPath>) -> BTreeMap<String, Vec<BatchPath>> {
    let mut grouped: BTreeMap<String, Vec<BatchPath>> = BTreeMap::new();
    for batch in batches {
        grouped
            .entry(batch.aggregation_id.clone())
            .or_default()
            .push(batch);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn batch(aggregation_id: &str, id: &str, hour: u32) -> BatchPath {
        BatchPath {
            aggregation_id: aggregation_id.to_owned(),
            time: Utc.with_ymd_and_hms(2021, 4, 2, hour, 0, 0).unwrap(),
            id: id.to_owned(),
        }
    }

    #[test]
    fn validity_index_is_zero_for_first() {
        assert_eq!(validity_index(true), 0);
        assert_eq!(validity_index(false), 1);
    }

    #[test]
    fn intersection_keeps_shared_ids_only() {
        let own = vec![batch("agg1", "a", 7), batch("agg1", "b", 7)];
        let peer = vec![batch("agg1", "b", 7), batch("agg1", "c", 7)];

        let shared = intersect_validations(own, peer).expect("should intersect");
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].id, "b");
    }

    #[test]
    fn intersection_fails_loud_on_time_divergence() {
        let own = vec![batch("agg1", "a", 7)];
        let peer = vec![batch("agg1", "a", 8)];

        let result = intersect_validations(own, peer);
        assert!(matches!(
            result,
            Err(Error::ValidationTimeMismatch { .. })
        ));
    }

    #[test]
    fn grouping_is_deterministic_and_keyed_by_aggregation_id() {
        let grouped = group_by_aggregation_id(vec![
            batch("agg2", "c", 7),
            batch("agg1", "a", 7),
            batch("agg1", "b", 7),
        ]);

        let keys: Vec<&String> = grouped.keys().collect();
        assert_eq!(keys, vec!["agg1", "agg2"]);
        assert_eq!(grouped["agg1"].len(), 2);
        assert_eq!(grouped["agg2"].len(), 1);
    }
}
