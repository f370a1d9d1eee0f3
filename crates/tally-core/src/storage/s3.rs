//! Amazon S3 backend.
//!
//! Credentials come from the default AWS provider chain (environment,
//! profile, instance metadata). When an identity (IAM role ARN) is
//! configured, the role is assumed through STS before any bucket operation.
//!
//! This module is only compiled when the `aws` feature is enabled.

use async_trait::async_trait;
use aws_config::sts::AssumeRoleProvider;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;

use super::{BucketUrl, ObjectStore};
use crate::error::{Error, Result};

/// Session name reported to STS when assuming a role.
const STS_SESSION_NAME: &str = "tally-workflow-manager";

/// Loads an SDK configuration, assuming `identity` via STS when provided.
pub async fn aws_sdk_config(identity: Option<&str>, region: Option<String>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(Region::new(region));
    }
    if let Some(role_arn) = identity {
        let provider = AssumeRoleProvider::builder(role_arn)
            .session_name(STS_SESSION_NAME)
            .build()
            .await;
        loader = loader.credentials_provider(provider);
    }
    loader.load().await
}

/// S3 object store for one bucket and key prefix.
#[derive(Debug)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3ObjectStore {
    /// Creates a store for the given bucket URL.
    ///
    /// The region comes from the ambient AWS configuration.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for parity with other backends.
    pub async fn new(url: &BucketUrl, identity: Option<&str>) -> Result<Self> {
        let config = aws_sdk_config(identity, None).await;
        Ok(Self {
            client: aws_sdk_s3::Client::new(&config),
            bucket: url.bucket.clone(),
            prefix: url.prefix.clone(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_continuation_token(continuation_token.take());
            if !self.prefix.is_empty() {
                request = request.prefix(&self.prefix);
            }

            let response = request.send().await.map_err(|e| {
                Error::storage_with_source(format!("listing s3://{}", self.bucket), e)
            })?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    keys.push(
                        key.strip_prefix(&self.prefix)
                            .map_or_else(|| key.to_owned(), str::to_owned),
                    );
                }
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated() == Some(true) => {
                    continuation_token = Some(token.to_owned());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let full_key = format!("{}{key}", self.prefix);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| {
                Error::storage_with_source(
                    format!("writing s3://{}/{full_key}", self.bucket),
                    e,
                )
            })?;
        Ok(())
    }
}
