//! Observability metrics for the workflow manager.
//!
//! Metrics are exposed via the `metrics` crate facade; the binary installs a
//! Prometheus push-gateway exporter when one is configured.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `tally_intake_tasks_started_total` | Counter | - | Intake tasks successfully published |
//! | `tally_aggregation_tasks_started_total` | Counter | - | Aggregation tasks successfully published |
//! | `tally_tasks_skipped_total` | Counter | `kind`, `reason` | Tasks not emitted and why |

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: intake tasks successfully published.
    pub const INTAKE_TASKS_STARTED_TOTAL: &str = "tally_intake_tasks_started_total";
    /// Counter: aggregation tasks successfully published.
    pub const AGGREGATION_TASKS_STARTED_TOTAL: &str = "tally_aggregation_tasks_started_total";
    /// Counter: tasks not emitted, labeled by kind and reason.
    pub const TASKS_SKIPPED_TOTAL: &str = "tally_tasks_skipped_total";
}

/// Metric label keys.
pub mod labels {
    /// Task kind: `intake` or `aggregation`.
    pub const KIND: &str = "kind";
    /// Skip reason: `age`, `marker`, or `existing_job`.
    pub const REASON: &str = "reason";
}
