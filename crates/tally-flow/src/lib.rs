//! # tally-flow
//!
//! Workflow manager for the tally two-party aggregation pipeline.
//!
//! A single invocation observes the state of three buckets and a Kubernetes
//! namespace, and schedules two kinds of downstream work onto a task queue:
//!
//! - **Intake tasks**: one per ready batch found in the ingestor bucket
//! - **Aggregation tasks**: one per aggregation ID over the batches validated
//!   by both parties within the current aggregation window
//!
//! ## Guarantees
//!
//! - **Idempotent**: Re-running against the same bucket state (with the
//!   previous run's task markers visible) emits nothing new
//! - **At-least-once**: A task marker is only written after its publish is
//!   durably acknowledged, so a failed publish is retried next invocation
//! - **Concurrency-safe**: Overlapping invocations need no coordination;
//!   markers and downstream idempotence bound the duplication
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use chrono::Duration;
//! use tally_core::clock::SystemClock;
//! use tally_core::storage::{Bucket, MemoryObjectStore};
//! use tally_flow::dispatch::memory::InMemoryEnqueuer;
//! use tally_flow::scheduler::{ScheduleConfig, ScheduleInputs, WorkflowScheduler};
//!
//! # async fn run() -> tally_flow::error::Result<()> {
//! let scheduler = WorkflowScheduler::new(
//!     Arc::new(SystemClock),
//!     ScheduleConfig {
//!         is_first: true,
//!         max_age: Duration::hours(1),
//!         aggregation_period: Duration::hours(3),
//!         grace_period: Duration::hours(1),
//!     },
//! );
//!
//! let own_validation = Bucket::new(Arc::new(MemoryObjectStore::new()), "gs://own", false);
//! let intake_enqueuer = InMemoryEnqueuer::new();
//! let aggregation_enqueuer = InMemoryEnqueuer::new();
//! let inputs = ScheduleInputs {
//!     intake_files: Vec::new(),
//!     own_validation_files: Vec::new(),
//!     peer_validation_files: Vec::new(),
//!     existing_jobs: BTreeMap::new(),
//! };
//!
//! let summary = scheduler
//!     .schedule_tasks(&inputs, &own_validation, &intake_enqueuer, &aggregation_enqueuer)
//!     .await?;
//! assert_eq!(summary.intake.scheduled, 0);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod batch_path;
pub mod dispatch;
pub mod error;
pub mod kubernetes;
pub mod metrics;
pub mod scheduler;
pub mod task;
