//! GCP Pub/Sub enqueuer implementation.
//!
//! Publishes tasks over the Pub/Sub REST API with application-default
//! credentials. Each `enqueue` call spawns its own publish so multiple
//! publishes proceed in parallel; [`Enqueuer::stop`] waits for all of them.
//!
//! This module is only compiled when the `gcp` feature is enabled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use gcp_auth::TokenProvider;
use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;
use tracing::info;

use super::{Completion, Enqueuer};
use crate::error::{Error, Result};
use crate::task::Task;

const PUBSUB_API_BASE_URL: &str = "https://pubsub.googleapis.com";

/// Oauth scope for Pub/Sub publishes and administration.
const PUBSUB_SCOPE: &str = "https://www.googleapis.com/auth/pubsub";

/// Ack deadline configured on auto-created subscriptions, in seconds.
/// Matches the visibility window downstream workers need for one task.
const SUBSCRIPTION_ACK_DEADLINE_SECONDS: u32 = 600;

/// Pub/Sub publish request body.
/// <https://cloud.google.com/pubsub/docs/reference/rest/v1/projects.topics/publish>
#[derive(Debug, Serialize)]
struct PublishRequest {
    messages: Vec<PubSubMessage>,
}

#[derive(Debug, Serialize)]
struct PubSubMessage {
    /// Base64-encoded payload.
    data: String,
}

/// Pub/Sub API error response.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
    status: String,
}

/// GCP Pub/Sub enqueuer for one topic.
pub struct PubSubEnqueuer {
    project_id: String,
    topic_id: String,
    client: reqwest::Client,
    token_provider: Arc<dyn TokenProvider>,
    tracker: TaskTracker,
    dry_run: bool,
}

impl std::fmt::Debug for PubSubEnqueuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubEnqueuer")
            .field("project_id", &self.project_id)
            .field("topic_id", &self.topic_id)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

impl PubSubEnqueuer {
    /// Creates an enqueuer for the given project and topic.
    ///
    /// Clients should reuse a single instance as much as possible so the
    /// underlying HTTP connections are shared across publishes.
    ///
    /// # Errors
    ///
    /// Returns an error if GCP credentials cannot be discovered or the HTTP
    /// client cannot be constructed.
    pub async fn new(project_id: &str, topic_id: &str, dry_run: bool) -> Result<Self> {
        let token_provider = gcp_auth::provider().await.map_err(|e| {
            Error::dispatch(format!("failed to initialize GCP auth: {e}"))
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::dispatch(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            project_id: project_id.to_owned(),
            topic_id: topic_id.to_owned(),
            client,
            token_provider,
            tracker: TaskTracker::new(),
            dry_run,
        })
    }

    /// Creates the topic, and a subscription with the same name that a
    /// downstream worker can consume from. The subscription never expires.
    ///
    /// # Errors
    ///
    /// Returns an error if either creation call fails, including when the
    /// topic already exists.
    pub async fn create_topic_with_subscription(project_id: &str, topic_id: &str) -> Result<()> {
        let token_provider = gcp_auth::provider().await.map_err(|e| {
            Error::dispatch(format!("failed to initialize GCP auth: {e}"))
        })?;
        let token = token_provider
            .token(&[PUBSUB_SCOPE])
            .await
            .map_err(|e| Error::dispatch(format!("failed to get GCP access token: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::dispatch(format!("failed to create HTTP client: {e}")))?;

        let topic_path = format!("projects/{project_id}/topics/{topic_id}");
        let response = client
            .put(format!("{PUBSUB_API_BASE_URL}/v1/{topic_path}"))
            .bearer_auth(token.as_str())
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| Error::dispatch(format!("creating topic {topic_path}: {e}")))?;
        check_response(&topic_path, response).await?;

        let subscription_path = format!("projects/{project_id}/subscriptions/{topic_id}");
        let response = client
            .put(format!("{PUBSUB_API_BASE_URL}/v1/{subscription_path}"))
            .bearer_auth(token.as_str())
            .json(&serde_json::json!({
                "topic": topic_path,
                "ackDeadlineSeconds": SUBSCRIPTION_ACK_DEADLINE_SECONDS,
                "expirationPolicy": {},
            }))
            .send()
            .await
            .map_err(|e| {
                Error::dispatch(format!("creating subscription {subscription_path}: {e}"))
            })?;
        check_response(&subscription_path, response).await
    }

    async fn publish(
        client: reqwest::Client,
        token_provider: Arc<dyn TokenProvider>,
        project_id: String,
        topic_id: String,
        payload: Vec<u8>,
    ) -> Result<()> {
        let token = token_provider
            .token(&[PUBSUB_SCOPE])
            .await
            .map_err(|e| Error::dispatch(format!("failed to get GCP access token: {e}")))?;

        let topic_path = format!("projects/{project_id}/topics/{topic_id}");
        let request = PublishRequest {
            messages: vec![PubSubMessage {
                data: BASE64_STANDARD.encode(&payload),
            }],
        };

        let response = client
            .post(format!("{PUBSUB_API_BASE_URL}/v1/{topic_path}:publish"))
            .bearer_auth(token.as_str())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::dispatch(format!("publishing to {topic_path}: {e}")))?;

        check_response(&topic_path, response).await
    }
}

/// Maps a non-success API response to a dispatch error, decoding the
/// structured error body when present.
async fn check_response(context: &str, response: reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_owned());
    if let Ok(decoded) = serde_json::from_str::<ApiErrorResponse>(&body) {
        Err(Error::dispatch(format!(
            "{context}: {} ({})",
            decoded.error.message, decoded.error.status
        )))
    } else {
        Err(Error::dispatch(format!("{context}: {status} - {body}")))
    }
}

#[async_trait]
impl<T: Task> Enqueuer<T> for PubSubEnqueuer {
    fn enqueue(&self, task: T, completion: Completion) {
        let client = self.client.clone();
        let token_provider = Arc::clone(&self.token_provider);
        let project_id = self.project_id.clone();
        let topic_id = self.topic_id.clone();
        let dry_run = self.dry_run;

        self.tracker.spawn(async move {
            let result = async {
                let payload = serde_json::to_vec(&task)?;
                if dry_run {
                    info!(topic = %topic_id, "dry run, not enqueuing task");
                    return Ok(());
                }
                Self::publish(client, token_provider, project_id, topic_id, payload).await
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_request_wire_format() {
        let request = PublishRequest {
            messages: vec![PubSubMessage {
                data: BASE64_STANDARD.encode(b"{\"aggregation-id\":\"agg1\"}"),
            }],
        };
        let json = serde_json::to_string(&request).expect("should serialize");
        assert_eq!(
            json,
            r#"{"messages":[{"data":"eyJhZ2dyZWdhdGlvbi1pZCI6ImFnZzEifQ=="}]}"#
        );
    }

    #[test]
    fn decodes_structured_api_error() {
        let body = r#"{"error":{"code":404,"message":"Topic not found","status":"NOT_FOUND"}}"#;
        let decoded: ApiErrorResponse = serde_json::from_str(body).expect("should decode");
        assert_eq!(decoded.error.message, "Topic not found");
        assert_eq!(decoded.error.status, "NOT_FOUND");
    }
}
