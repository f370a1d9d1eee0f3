//! Task payloads sent to downstream workers, their markers and job names.
//!
//! A *task* is a work item at the aggregation-pipeline application layer
//! (intake of one batch, or aggregation of many batches); the name is chosen
//! to distinguish it from the Kubernetes-level *jobs* that execute tasks.
//!
//! Every task derives two identities from its payload:
//!
//! - a **marker** name, written to the own-validation bucket after a
//!   successful publish so later invocations skip the task
//! - a **job name**, a legal DNS label under which the downstream worker
//!   creates its Kubernetes job, used to detect work that is already running

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use tally_core::clock::TIMESTAMP_FORMAT;

const MARKER_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M";

/// A UTC timestamp with minute precision that serializes as
/// `YYYY/MM/DD/HH/MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Returns the timestamp as rendered into task markers and job names,
    /// `YYYY-MM-DD-HH-MM`.
    #[must_use]
    pub fn marker_string(&self) -> String {
        self.0.format(MARKER_TIMESTAMP_FORMAT).to_string()
    }

    /// Returns the wrapped instant.
    #[must_use]
    pub const fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(instant: DateTime<Utc>) -> Self {
        Self(instant)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let parsed = NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT)
            .map_err(serde::de::Error::custom)?;
        Ok(Self(parsed.and_utc()))
    }
}

/// A task that can be enqueued into an
/// [`Enqueuer`](crate::dispatch::Enqueuer).
pub trait Task: Serialize + Send + Sync + 'static {
    /// Returns the name used when writing out a marker for this task.
    fn marker(&self) -> String;

    /// Returns the Kubernetes job name under which the downstream worker
    /// will execute this task. Always a legal DNS label.
    fn job_name(&self) -> String;
}

/// Intake of one batch from the ingestion bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeTask {
    /// The identifier for the aggregation.
    #[serde(rename = "aggregation-id")]
    pub aggregation_id: String,
    /// The identifier of the batch. Typically a UUID.
    #[serde(rename = "batch-id")]
    pub batch_id: String,
    /// The timestamp on the batch.
    pub date: Timestamp,
}

impl Task for IntakeTask {
    fn marker(&self) -> String {
        format!(
            "intake-{}-{}-{}",
            self.aggregation_id,
            self.date.marker_string(),
            self.batch_id
        )
    }

    // Job names must be valid DNS labels: at most 63 characters. The batch
    // timestamp is 16 characters and the 'i' plus separators take another 4,
    // leaving 43: 16 for half the de-dashed batch UUID and 27 for the
    // aggregation ID fragment.
    fn job_name(&self) -> String {
        let uuid_fragment: String = self
            .batch_id
            .chars()
            .filter(|c| *c != '-')
            .take(16)
            .collect();
        format!(
            "i-{}-{}-{}",
            job_name_fragment(&self.aggregation_id, 27),
            uuid_fragment,
            self.date.marker_string()
        )
    }
}

/// One batch included in an aggregation task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// The batch ID. Typically a UUID.
    pub id: String,
    /// The timestamp on the batch.
    pub time: Timestamp,
}

/// Aggregation over the batches validated by both parties in one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationTask {
    /// The identifier for the aggregation.
    #[serde(rename = "aggregation-id")]
    pub aggregation_id: String,
    /// Start of the range of time covered by the aggregation.
    #[serde(rename = "aggregation-start")]
    pub aggregation_start: Timestamp,
    /// End of the range of time covered by the aggregation.
    #[serde(rename = "aggregation-end")]
    pub aggregation_end: Timestamp,
    /// The batch ID and timestamp pairs aggregated by this task.
    pub batches: Vec<Batch>,
}

impl Task for AggregationTask {
    fn marker(&self) -> String {
        format!(
            "aggregate-{}-{}-{}",
            self.aggregation_id,
            self.aggregation_start.marker_string(),
            self.aggregation_end.marker_string()
        )
    }

    fn job_name(&self) -> String {
        format!(
            "a-{}-{}",
            job_name_fragment(&self.aggregation_id, 30),
            self.aggregation_start.marker_string()
        )
    }
}

/// Generates a job-name-safe fragment from an aggregation ID: characters
/// outside `[A-Za-z0-9-]` become `-`, the result is truncated to
/// `max_length` and lowercased.
#[must_use]
pub fn job_name_fragment(aggregation_id: &str, max_length: usize) -> String {
    aggregation_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .take(max_length)
        .collect()
}
