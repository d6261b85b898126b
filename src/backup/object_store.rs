// rythm-backup/src/backup/object_store.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::{DateTime, Utc};
use s3::config::{BehaviorVersion, Credentials, Region};
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use std::path::Path;
use std::pin::Pin;
use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::errors::{BackupError, Result};

pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// One object as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Flat-namespace blob container holding the backup artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn container(&self) -> &str;

    /// Creates the container if it does not exist yet.
    async fn ensure_container(&self) -> Result<()>;

    async fn put_file(&self, key: &str, source: &Path) -> Result<()>;

    /// Lists every object, following pagination to the end.
    async fn list(&self) -> Result<Vec<StoredObject>>;

    /// Writes the object to `destination`, returning the number of bytes written.
    async fn download_to_file(&self, key: &str, destination: &Path) -> Result<u64>;

    async fn open(&self, key: &str) -> Result<BlobReader>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// S3-compatible implementation (AWS, MinIO, DigitalOcean Spaces).
pub struct S3ObjectStore {
    client: s3::Client,
    bucket: String,
    region: String,
}

impl S3ObjectStore {
    pub async fn connect(storage: &StorageConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(storage.region.clone()));
        if let Some(endpoint) = &storage.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let Some(credentials) = &storage.credentials {
            loader = loader.credentials_provider(Credentials::new(
                &credentials.access_key_id,
                &credentials.secret_access_key,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        }
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(storage.force_path_style)
            .build();

        S3ObjectStore {
            client: s3::Client::from_conf(s3_config),
            bucket: storage.bucket_name.clone(),
            region: storage.region.clone(),
        }
    }
}

fn storage_error<E: std::error::Error>(action: &str, key: &str, err: E) -> BackupError {
    BackupError::Storage(format!("{} '{}': {}", action, key, DisplayErrorContext(&err)))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn container(&self) -> &str {
        &self.bucket
    }

    async fn ensure_container(&self) -> Result<()> {
        if self.client.head_bucket().bucket(&self.bucket).send().await.is_ok() {
            return Ok(());
        }

        info!(bucket = %self.bucket, "Bucket not found, creating it");
        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => Ok(()),
            Err(err) => {
                let already_there = err
                    .as_service_error()
                    .map(|e| e.is_bucket_already_owned_by_you() || e.is_bucket_already_exists())
                    .unwrap_or(false);
                if already_there {
                    Ok(())
                } else {
                    Err(storage_error("Failed to create bucket", &self.bucket, err))
                }
            }
        }
    }

    async fn put_file(&self, key: &str, source: &Path) -> Result<()> {
        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| storage_error("Failed to read upload source for", key, e))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/sql")
            .body(body)
            .send()
            .await
            .map_err(|e| storage_error("Failed to upload", key, e))?;

        debug!(bucket = %self.bucket, key, "Uploaded object");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StoredObject>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| storage_error("Failed to list bucket", &self.bucket, e))?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                // Objects without a timestamp are treated as fresh so retention never removes them.
                let created_at = object
                    .last_modified()
                    .and_then(|ts| DateTime::from_timestamp(ts.secs(), ts.subsec_nanos()))
                    .unwrap_or_else(Utc::now);
                objects.push(StoredObject {
                    key: key.to_string(),
                    size_bytes: object.size().unwrap_or(0).max(0) as u64,
                    created_at,
                });
            }

            match (response.is_truncated(), response.next_continuation_token()) {
                (Some(true), Some(token)) => continuation_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(objects)
    }

    async fn download_to_file(&self, key: &str, destination: &Path) -> Result<u64> {
        let mut reader = self.open(key).await?;
        let mut file = tokio::fs::File::create(destination).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.sync_all().await?;
        Ok(written)
    }

    async fn open(&self, key: &str) -> Result<BlobReader> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_error("Failed to fetch", key, e))?;

        Ok(Box::pin(object.body.into_async_read()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_error("Failed to delete", key, e))?;
        Ok(())
    }
}
