//! Task-queue enqueuers for workflow tasks.
//!
//! This module provides:
//!
//! - [`Enqueuer`]: Trait for publishing tasks to a queue transport
//! - [`pubsub::PubSubEnqueuer`]: GCP Pub/Sub transport (`gcp` feature)
//! - [`sns::SnsEnqueuer`]: AWS SNS transport (`aws` feature)
//! - [`memory::InMemoryEnqueuer`]: In-memory transport for testing
//!
//! ## Design Principles
//!
//! - **Backend agnostic**: The engine sees the same contract for every
//!   transport; implementations own their concurrency
//! - **At-least-once**: Completions only run after a durable publish
//!   acknowledgement (or an unretryable failure), so callers can order
//!   side effects after the publish
//! - **Barrier on shutdown**: [`Enqueuer::stop`] returns only once every
//!   completion has finished, making it safe to exit the process

pub mod memory;

#[cfg(feature = "gcp")]
pub mod pubsub;
#[cfg(feature = "aws")]
pub mod sns;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Result;
use crate::task::Task;

/// Completion invoked exactly once per enqueued task, with the publish
/// outcome. Runs on a transport-owned execution context; callers must not
/// assume it runs before the next `enqueue` call on the same object. The
/// only synchronization with completions is [`Enqueuer::stop`].
pub type Completion = Box<dyn FnOnce(Result<()>) -> BoxFuture<'static, ()> + Send + 'static>;

/// Publishes tasks to a queue transport.
#[async_trait]
pub trait Enqueuer<T: Task>: Send + Sync {
    /// Submits one task for publication and returns immediately.
    ///
    /// `completion` is invoked exactly once, when the publish is durably
    /// acknowledged (`Ok`) or has failed unretryably (`Err`).
    fn enqueue(&self, task: T, completion: Completion);

    /// Barrier: returns only after every prior `enqueue` call's completion
    /// has returned. The enqueuer is unusable afterwards.
    async fn stop(&self);
}
