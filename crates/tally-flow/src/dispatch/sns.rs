//! AWS SNS enqueuer implementation.
//!
//! `sns:Publish` blocks until the message has been saved by SNS, so there is
//! no separate acknowledgement to wait for; the publish is still performed
//! on a spawned task so `enqueue` returns immediately and [`Enqueuer::stop`]
//! retains its barrier semantics.
//!
//! This module is only compiled when the `aws` feature is enabled.

use async_trait::async_trait;
use tokio_util::task::TaskTracker;
use tracing::info;

use super::{Completion, Enqueuer};
use crate::error::{Error, Result};
use crate::task::Task;
use tally_core::storage::s3::aws_sdk_config;

/// AWS SNS enqueuer for one topic.
#[derive(Debug)]
pub struct SnsEnqueuer {
    client: aws_sdk_sns::Client,
    topic_arn: String,
    tracker: TaskTracker,
    dry_run: bool,
}

impl SnsEnqueuer {
    /// Creates an enqueuer publishing to the given topic ARN in the given
    /// region. When an identity (IAM role ARN) is supplied, it is assumed
    /// via STS before publishing.
    pub async fn new(
        region: &str,
        identity: Option<&str>,
        topic_arn: &str,
        dry_run: bool,
    ) -> Self {
        let config = aws_sdk_config(identity, Some(region.to_owned())).await;
        Self {
            client: aws_sdk_sns::Client::new(&config),
            topic_arn: topic_arn.to_owned(),
            tracker: TaskTracker::new(),
            dry_run,
        }
    }

    async fn publish(client: aws_sdk_sns::Client, topic_arn: String, payload: String) -> Result<()> {
        client
            .publish()
            .topic_arn(&topic_arn)
            .message(payload)
            .send()
            .await
            .map_err(|e| Error::dispatch(format!("publishing to {topic_arn}: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl<T: Task> Enqueuer<T> for SnsEnqueuer {
    fn enqueue(&self, task: T, completion: Completion) {
        let client = self.client.clone();
        let topic_arn = self.topic_arn.clone();
        let dry_run = self.dry_run;

        self.tracker.spawn(async move {
            let result = async {
                let payload = serde_json::to_string(&task)?;
                if dry_run {
                    info!(topic = %topic_arn, "dry run, not enqueuing task");
                    return Ok(());
                }
                Self::publish(client, topic_arn, payload).await
            }
            .await;
            completion(result).await;
        });
    }

    async fn stop(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
