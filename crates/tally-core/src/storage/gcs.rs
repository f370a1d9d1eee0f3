//! Google Cloud Storage backend over the JSON API.
//!
//! Authenticates with application-default credentials discovered from the
//! environment. When an identity (service-account email) is configured, an
//! access token for that account is minted through the IAM Credentials
//! `generateAccessToken` API, so the workflow manager can act against
//! buckets owned by a different service account.
//!
//! This module is only compiled when the `gcp` feature is enabled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use gcp_auth::TokenProvider;
use serde::Deserialize;

use super::{BucketUrl, ObjectStore};
use crate::error::{Error, Result};

const STORAGE_API_BASE_URL: &str = "https://storage.googleapis.com";
const IAM_CREDENTIALS_API_BASE_URL: &str = "https://iamcredentials.googleapis.com";

/// Oauth scope for GCS reads and writes.
/// <https://developers.google.com/identity/protocols/oauth2/scopes#storage>
const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";

/// GCS object store for one bucket and key prefix.
pub struct GcsObjectStore {
    bucket: String,
    prefix: String,
    client: reqwest::Client,
    token_provider: Arc<dyn TokenProvider>,
    impersonated_account: Option<String>,
}

impl std::fmt::Debug for GcsObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsObjectStore")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("impersonated_account", &self.impersonated_account)
            .finish_non_exhaustive()
    }
}

/// One page of an objects listing.
/// <https://cloud.google.com/storage/docs/json_api/v1/objects/list>
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<ObjectResource>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectResource {
    name: String,
}

/// Response from the IAM Credentials `generateAccessToken` API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAccessTokenResponse {
    access_token: String,
}

impl GcsObjectStore {
    /// Creates a store for the given bucket URL.
    ///
    /// # Errors
    ///
    /// Returns an error if GCP credentials cannot be discovered or the HTTP
    /// client cannot be constructed.
    pub async fn new(url: &BucketUrl, identity: Option<&str>) -> Result<Self> {
        let token_provider = gcp_auth::provider()
            .await
            .map_err(|e| Error::auth(format!("failed to initialize GCP auth: {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::storage_with_source("failed to create HTTP client", e))?;

        Ok(Self {
            bucket: url.bucket.clone(),
            prefix: url.prefix.clone(),
            client,
            token_provider,
            impersonated_account: identity.map(str::to_owned),
        })
    }

    /// Returns an access token for the storage API, impersonating the
    /// configured service account if one was supplied.
    async fn access_token(&self) -> Result<String> {
        let token = self
            .token_provider
            .token(&[STORAGE_SCOPE])
            .await
            .map_err(|e| Error::auth(format!("failed to get GCP access token: {e}")))?;

        let Some(account) = &self.impersonated_account else {
            return Ok(token.as_str().to_owned());
        };

        // https://cloud.google.com/iam/docs/reference/credentials/rest/v1/projects.serviceAccounts/generateAccessToken
        let url = format!(
            "{IAM_CREDENTIALS_API_BASE_URL}/v1/projects/-/serviceAccounts/{account}:generateAccessToken"
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(token.as_str())
            .json(&serde_json::json!({ "scope": [STORAGE_SCOPE] }))
            .send()
            .await
            .map_err(|e| Error::auth(format!("impersonating {account}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "unknown error".to_owned());
            return Err(Error::auth(format!(
                "impersonating {account}: {status} - {body}"
            )));
        }

        let minted: GenerateAccessTokenResponse = response
            .json()
            .await
            .map_err(|e| Error::auth(format!("decoding impersonation response: {e}")))?;
        Ok(minted.access_token)
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    async fn list(&self) -> Result<Vec<String>> {
        let url = format!(
            "{STORAGE_API_BASE_URL}/storage/v1/b/{}/o",
            self.bucket
        );

        let mut keys = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let token = self.access_token().await?;
            let mut request = self
                .client
                .get(&url)
                .bearer_auth(token)
                .query(&[
                    ("prefix", self.prefix.as_str()),
                    ("fields", "items/name,nextPageToken"),
                ]);
            if let Some(page) = &page_token {
                request = request.query(&[("pageToken", page.as_str())]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::storage_with_source(format!("listing gs://{}", self.bucket), e))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|_| "unknown error".to_owned());
                return Err(Error::storage(format!(
                    "listing gs://{}: {status} - {body}",
                    self.bucket
                )));
            }

            let page: ListResponse = response
                .json()
                .await
                .map_err(|e| Error::storage_with_source("decoding GCS listing", e))?;

            keys.extend(page.items.into_iter().map(|object| {
                object
                    .name
                    .strip_prefix(&self.prefix)
                    .map_or(object.name.clone(), str::to_owned)
            }));

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(keys)
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let object = format!("{}{key}", self.prefix);
        let url = format!(
            "{STORAGE_API_BASE_URL}/upload/storage/v1/b/{}/o",
            self.bucket
        );

        let token = self.access_token().await?;
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .query(&[("uploadType", "media"), ("name", object.as_str())])
            .body(data)
            .send()
            .await
            .map_err(|e| {
                Error::storage_with_source(format!("writing gs://{}/{object}", self.bucket), e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "unknown error".to_owned());
            return Err(Error::storage(format!(
                "writing gs://{}/{object}: {status} - {body}",
                self.bucket
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_listing_page() {
        let body = r#"{
            "items": [
                {"name": "prefix/agg1/2021/04/02/10/00/uuid.batch"},
                {"name": "prefix/task-markers/intake-agg1"}
            ],
            "nextPageToken": "abc"
        }"#;

        let page: ListResponse = serde_json::from_str(body).expect("should decode");
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_page_token.as_deref(), Some("abc"));
    }

    #[test]
    fn decodes_listing_page_without_items() {
        let page: ListResponse = serde_json::from_str("{}").expect("should decode");
        assert!(page.items.is_empty());
        assert!(page.next_page_token.is_none());
    }
}
