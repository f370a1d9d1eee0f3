//! In-memory enqueuer implementation for testing.
//!
//! Records every published task and supports failure injection so tests can
//! exercise the publish-error path. NOT suitable for production: nothing is
//! durable and nothing crosses process boundaries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::task::TaskTracker;

use super::{Completion, Enqueuer};
use crate::error::Error;
use crate::task::Task;

/// In-memory enqueuer for tests.
#[derive(Debug, Default)]
pub struct InMemoryEnqueuer<T> {
    published: Arc<Mutex<Vec<T>>>,
    fail_publishes: Arc<AtomicBool>,
    tracker: TaskTracker,
}

impl<T: Task + Clone> InMemoryEnqueuer<T> {
    /// Creates a new enqueuer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            fail_publishes: Arc::new(AtomicBool::new(false)),
            tracker: TaskTracker::new(),
        }
    }

    /// Makes every subsequent publish fail with a synthetic error.
    pub fn fail_publishes(&self) {
        self.fail_publishes.store(true, Ordering::SeqCst);
    }

    /// Returns the tasks published so far.
    #[must_use]
    pub fn published(&self) -> Vec<T> {
        self.published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl<T: Task + Clone> Enqueuer<T> for InMemoryEnqueuer<T> {
    fn enqueue(&self, task: T, completion: Completion) {
        let published = Arc::clone(&self.published);
        let fail = self.fail_publishes.load(Ordering::SeqCst);
        self.tracker.spawn(async move {
            let result = if fail {
                Err(Error::dispatch("synthetic publish failure"))
            } else {
                if let Ok(mut published) = published.lock() {
                    published.push(task);
                }
                Ok(())
            };
            completion(result).await;
        });
    }

    async fn stop(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{IntakeTask, Timestamp};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;

    fn task() -> IntakeTask {
        IntakeTask {
            aggregation_id: "agg1".to_owned(),
            batch_id: "uuid-AAAA".to_owned(),
            date: Timestamp::from(Utc.with_ymd_and_hms(2021, 4, 2, 10, 0, 0).unwrap()),
        }
    }

    #[tokio::test]
    async fn stop_waits_for_completions() {
        let enqueuer = InMemoryEnqueuer::new();
        let completions = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let completions = Arc::clone(&completions);
            enqueuer.enqueue(
                task(),
                Box::new(move |result| {
                    Box::pin(async move {
                        assert!(result.is_ok());
                        completions.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            );
        }
        enqueuer.stop().await;

        assert_eq!(completions.load(Ordering::SeqCst), 4);
        assert_eq!(enqueuer.published().len(), 4);
    }

    #[tokio::test]
    async fn failure_injection_reaches_completion() {
        let enqueuer = InMemoryEnqueuer::new();
        enqueuer.fail_publishes();
        let saw_error = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&saw_error);
        enqueuer.enqueue(
            task(),
            Box::new(move |result| {
                Box::pin(async move {
                    flag.store(result.is_err(), Ordering::SeqCst);
                })
            }),
        );
        enqueuer.stop().await;

        assert!(saw_error.load(Ordering::SeqCst));
        assert!(enqueuer.published().is_empty());
    }
}
