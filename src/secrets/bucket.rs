//! Backup bucket provisioning
//!
//! Buckets are created against an S3-compatible endpoint using the
//! credentials propagated into the tenant namespace. Candidate names carry a
//! random suffix; a name collision ("already exists" / "already owned") is a
//! race with another actor and is retried with a fresh candidate, any other
//! failure aborts immediately. The store session is constructed once at
//! process start and injected; the underlying SDK client is safe for
//! concurrent use across reconcile passes.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::secrets::{hex_encode, SecretData};
use crate::{Error, Result};

/// Attempts before bucket provisioning is declared failed
pub const MAX_ATTEMPTS: u32 = 10;

/// Fixed delay between attempts
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Region handed to S3-compatible endpoints that require one
const BUCKET_REGION: &str = "us-east-1";

/// Credentials and endpoint for bucket operations, taken from the
/// object-storage secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketCredentials {
    /// Access key
    pub access: String,
    /// Secret key
    pub secret: String,
    /// S3-compatible endpoint URL
    pub endpoint: String,
}

impl BucketCredentials {
    /// Extract credentials from the object-storage secret payload.
    pub fn from_secret_data(data: &SecretData) -> Result<Self> {
        let field = |key: &str| -> Result<String> {
            data.get(key)
                .filter(|v| !v.is_empty())
                .map(|v| String::from_utf8_lossy(v).to_string())
                .ok_or_else(|| {
                    Error::secret_data(super::OBJECT_STORAGE_SECRET, format!("missing {key}"))
                })
        };
        Ok(Self {
            access: field("access")?,
            secret: field("secret")?,
            endpoint: field("endpoint")?,
        })
    }
}

/// Outcome of one bucket-creation attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BucketOutcome {
    /// The bucket now exists and is ours
    Created,
    /// The name is taken (by us or another actor); retry with a new name
    AlreadyExists,
}

/// Seam for the object-storage collaborator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Attempt to create `bucket` with the supplied credentials.
    async fn create_bucket(
        &self,
        creds: &BucketCredentials,
        bucket: &str,
    ) -> Result<BucketOutcome>;
}

/// Store backed by an S3-compatible API
pub struct S3ObjectStore;

impl S3ObjectStore {
    /// Create the process-wide store session
    pub fn new() -> Self {
        Self
    }
}

impl Default for S3ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn create_bucket(
        &self,
        creds: &BucketCredentials,
        bucket: &str,
    ) -> Result<BucketOutcome> {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(BUCKET_REGION))
            .endpoint_url(&creds.endpoint)
            .credentials_provider(Credentials::new(
                &creds.access,
                &creds.secret,
                None,
                None,
                "object-storage-secret",
            ))
            .force_path_style(true)
            .build();
        let client = aws_sdk_s3::Client::from_conf(config);

        match client.create_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(BucketOutcome::Created),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_bucket_already_exists()
                    || service_err.is_bucket_already_owned_by_you()
                {
                    Ok(BucketOutcome::AlreadyExists)
                } else {
                    Err(Error::BucketProvisioning(service_err.to_string()))
                }
            }
        }
    }
}

/// A candidate bucket name, `<cluster>-<4 random bytes as hex>`
pub fn candidate_bucket_name(cluster_name: &str) -> String {
    let mut suffix = [0u8; 4];
    OsRng.fill_bytes(&mut suffix);
    format!("{cluster_name}-{}", hex_encode(&suffix))
}

/// Create a uniquely named bucket for the cluster, retrying name collisions
/// with fresh candidates up to [`MAX_ATTEMPTS`] times.
pub async fn provision_bucket(
    store: &dyn ObjectStore,
    creds: &BucketCredentials,
    cluster_name: &str,
) -> Result<String> {
    for attempt in 1..=MAX_ATTEMPTS {
        let candidate = candidate_bucket_name(cluster_name);
        match store.create_bucket(creds, &candidate).await? {
            BucketOutcome::Created => {
                info!(bucket = %candidate, attempt, "created backup bucket");
                return Ok(candidate);
            }
            BucketOutcome::AlreadyExists => {
                warn!(bucket = %candidate, attempt, "bucket name taken, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }

    Err(Error::BucketProvisioning(format!(
        "failed to create a bucket after {MAX_ATTEMPTS} attempts"
    )))
}
