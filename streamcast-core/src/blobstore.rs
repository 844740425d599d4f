//! Blob store access for source video downloads.
//!
//! The pipeline only needs short-lived signed download URLs, so the store
//! is a narrow trait with an S3-backed production implementation. Construct
//! once and inject; nothing here is a global.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use thiserror::Error;

/// Errors from presigned URL generation
#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("Failed to presign download for {key}: {reason}")]
    Presign { key: String, reason: String },
}

/// Source of short-lived signed download URLs for stored objects.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Returns a signed GET URL for `key`, valid for `expires_in`.
    ///
    /// # Errors
    ///
    /// - `BlobStoreError::Presign` - Signing failed or expiry is out of range
    async fn presigned_get_url(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, BlobStoreError>;
}

/// Production blob store backed by an S3 bucket.
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStore {
    /// Builds a store for `bucket` using the ambient AWS credential chain
    /// (environment, profile, instance metadata).
    pub async fn from_env(bucket: String) -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        Self {
            client: aws_sdk_s3::Client::new(&sdk_config),
            bucket,
        }
    }

    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn presigned_get_url(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, BlobStoreError> {
        let presigning = PresigningConfig::expires_in(expires_in).map_err(|e| {
            BlobStoreError::Presign {
                key: key.to_string(),
                reason: e.to_string(),
            }
        })?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| BlobStoreError::Presign {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        Ok(request.uri().to_string())
    }
}
