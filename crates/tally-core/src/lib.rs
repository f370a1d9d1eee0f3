//! # tally-core
//!
//! Core abstractions for the tally privacy-preserving aggregation pipeline.
//!
//! This crate provides the foundational types and traits shared by pipeline
//! components:
//!
//! - **Object storage**: A backend-agnostic object store contract with
//!   GCS, S3, and in-memory implementations, plus the bucket handle used for
//!   listings and task-marker writes
//! - **Clock + intervals**: A testable time source and half-open interval
//!   arithmetic for aggregation windowing
//! - **Error types**: Shared error definitions and result types
//! - **Observability**: Structured-logging bootstrap
//!
//! ## Example
//!
//! ```rust
//! use tally_core::prelude::*;
//!
//! let url: BucketUrl = "gs://ingestor-bucket/prefix".parse().unwrap();
//! assert_eq!(url.bucket, "ingestor-bucket");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod error;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use tally_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::clock::{aggregation_interval, Clock, FixedClock, Interval, SystemClock};
    pub use crate::error::{Error, Result};
    pub use crate::storage::{
        Bucket, BucketScheme, BucketUrl, MemoryObjectStore, ObjectStore, TASK_MARKER_PREFIX,
    };
}
