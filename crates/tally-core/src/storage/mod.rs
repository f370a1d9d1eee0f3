//! Object storage for batch listings and task markers.
//!
//! This module defines the storage contract the workflow manager depends on:
//! a point-in-time recursive listing of a bucket, and idempotent writes of
//! content-free task-marker objects. The bucket URL scheme (`gs://` vs
//! `s3://`) selects the backend; identity strings select credentials.
//!
//! ## Multi-Cloud Compatibility
//!
//! Backends return keys relative to the configured prefix so callers never
//! see provider-specific path shapes. Listing staleness against subsequent
//! marker writes is tolerated: marker checks are advisory and downstream
//! consumers must be idempotent.

pub mod memory;

#[cfg(feature = "gcp")]
pub mod gcs;
#[cfg(feature = "aws")]
pub mod s3;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use crate::error::{Error, Result};

pub use memory::MemoryObjectStore;

/// Key prefix under which task markers are stored in the own-validation
/// bucket. A marker's mere existence asserts that the corresponding task has
/// already been scheduled.
pub const TASK_MARKER_PREFIX: &str = "task-markers/";

/// Storage backend trait for object storage.
///
/// All backends (GCS, S3, memory) implement this trait. Keys are relative to
/// the backend's configured prefix.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns a full recursive listing of the bucket.
    ///
    /// The listing is a point-in-time snapshot; ordering is
    /// backend-dependent.
    async fn list(&self) -> Result<Vec<String>>;

    /// Writes an object unconditionally.
    ///
    /// Concurrent writes of the same key are safe; any winner suffices.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;
}

/// Scheme of a bucket URL, selecting the storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketScheme {
    /// Google Cloud Storage (`gs://`).
    Gs,
    /// Amazon S3 (`s3://`).
    S3,
}

/// A parsed bucket URL: `gs://<bucket>[/<prefix>]` or
/// `s3://<bucket>[/<prefix>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketUrl {
    /// The backend selected by the URL scheme.
    pub scheme: BucketScheme,
    /// The bucket name.
    pub bucket: String,
    /// Optional key prefix; empty, or normalized to end with `/`.
    pub prefix: String,
}

impl FromStr for BucketUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, rest) = if let Some(rest) = s.strip_prefix("gs://") {
            (BucketScheme::Gs, rest)
        } else if let Some(rest) = s.strip_prefix("s3://") {
            (BucketScheme::S3, rest)
        } else {
            return Err(Error::InvalidBucketUrl {
                message: format!("{s}: URL must begin with gs:// or s3://"),
            });
        };

        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(Error::InvalidBucketUrl {
                message: format!("{s}: missing bucket name"),
            });
        }

        let prefix = if prefix.is_empty() || prefix.ends_with('/') {
            prefix.to_owned()
        } else {
            format!("{prefix}/")
        };

        Ok(Self {
            scheme,
            bucket: bucket.to_owned(),
            prefix,
        })
    }
}

impl fmt::Display for BucketUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            BucketScheme::Gs => "gs",
            BucketScheme::S3 => "s3",
        };
        write!(f, "{scheme}://{}/{}", self.bucket, self.prefix)
    }
}

/// Handle to one bucket: listings plus task-marker writes.
///
/// Cheap to clone; completions executing on transport-owned tasks hold their
/// own clone for the post-publish marker write.
#[derive(Clone)]
pub struct Bucket {
    store: Arc<dyn ObjectStore>,
    url: String,
    dry_run: bool,
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("url", &self.url)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

impl Bucket {
    /// Creates a bucket handle over an existing store.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, url: impl Into<String>, dry_run: bool) -> Self {
        Self {
            store,
            url: url.into(),
            dry_run,
        }
    }

    /// Creates a bucket from a `gs://` or `s3://` URL.
    ///
    /// The identity string is backend-specific: a service-account email to
    /// impersonate for GCS, an IAM role ARN to assume for S3. In dry-run
    /// mode all writes are suppressed.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is unparseable or the backend cannot be
    /// constructed (including builds without the matching cloud feature).
    pub async fn from_url(url: &str, identity: Option<&str>, dry_run: bool) -> Result<Self> {
        let parsed: BucketUrl = url.parse()?;
        let store = match parsed.scheme {
            BucketScheme::Gs => gcs_store(&parsed, identity).await?,
            BucketScheme::S3 => s3_store(&parsed, identity).await?,
        };
        Ok(Self::new(store, url, dry_run))
    }

    /// Returns the URL this bucket was constructed from.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns a full recursive listing of the bucket.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend listing fails.
    pub async fn list_files(&self) -> Result<Vec<String>> {
        self.store.list().await
    }

    /// Idempotently writes the task marker `task-markers/<marker>`.
    ///
    /// In dry-run mode this logs and writes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    pub async fn write_task_marker(&self, marker: &str) -> Result<()> {
        let key = format!("{TASK_MARKER_PREFIX}{marker}");
        if self.dry_run {
            info!(bucket = %self.url, key, "dry run, skipping task marker write");
            return Ok(());
        }
        info!(bucket = %self.url, key, "writing task marker");
        self.store.put(&key, Bytes::from(marker.to_owned())).await
    }
}

#[cfg(feature = "gcp")]
async fn gcs_store(url: &BucketUrl, identity: Option<&str>) -> Result<Arc<dyn ObjectStore>> {
    Ok(Arc::new(gcs::GcsObjectStore::new(url, identity).await?))
}

#[cfg(not(feature = "gcp"))]
async fn gcs_store(url: &BucketUrl, _identity: Option<&str>) -> Result<Arc<dyn ObjectStore>> {
    Err(Error::Configuration(format!(
        "{url}: this build does not include GCS support (gcp feature)"
    )))
}

#[cfg(feature = "aws")]
async fn s3_store(url: &BucketUrl, identity: Option<&str>) -> Result<Arc<dyn ObjectStore>> {
    Ok(Arc::new(s3::S3ObjectStore::new(url, identity).await?))
}

#[cfg(not(feature = "aws"))]
async fn s3_store(url: &BucketUrl, _identity: Option<&str>) -> Result<Arc<dyn ObjectStore>> {
    Err(Error::Configuration(format!(
        "{url}: this build does not include S3 support (aws feature)"
    )))
}
