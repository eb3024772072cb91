//! S3 backend on aws-sdk-s3, targeting any S3-compatible endpoint.

use super::{ObjectInfo, ObjectRepository};
use crate::config::RepositoryConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep, Duration};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY_MS: u64 = 200;

pub struct S3Repository {
    client: Client,
    bucket: String,
}

impl S3Repository {
    /// Build a client from static credentials. No network traffic happens here.
    pub async fn connect(config: &RepositoryConfig) -> Result<Self> {
        config.validate()?;

        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "volume-backup",
        );
        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .endpoint_url(config.endpoint.clone())
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.force_path_style)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        })
    }
}

fn to_utc(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos())
}

#[async_trait]
impl ObjectRepository for S3Repository {
    async fn put_file(&self, key: &str, path: &Path) -> Result<u64> {
        let size = tokio::fs::metadata(path).await?.len();
        let mut attempt = 0;
        loop {
            attempt += 1;
            // The body stream is consumed by each attempt, so reopen the file
            let body = ByteStream::from_path(path)
                .await
                .map_err(EngineError::storage)?;
            let result = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .content_length(size as i64)
                .body(body)
                .send()
                .await;
            match result {
                Ok(_) => return Ok(size),
                Err(e) if attempt < MAX_ATTEMPTS => {
                    tracing::warn!(key, attempt, "Upload failed, retrying: {}", e);
                    sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64)).await;
                }
                Err(e) => {
                    return Err(EngineError::Storage(format!("upload of {key} failed: {e}")))
                }
            }
        }
    }

    async fn put_bytes(&self, key: &str, data: Bytes) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(data.clone()))
                .send()
                .await;
            match result {
                Ok(_) => return Ok(()),
                Err(e) if attempt < MAX_ATTEMPTS => {
                    tracing::warn!(key, attempt, "Upload failed, retrying: {}", e);
                    sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64)).await;
                }
                Err(e) => {
                    return Err(EngineError::Storage(format!("upload of {key} failed: {e}")))
                }
            }
        }
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match resp {
            Ok(o) => {
                let data = o.body.collect().await.map_err(EngineError::storage)?;
                Ok(Some(data.into_bytes()))
            }
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => Ok(None),
            Err(e) => Err(EngineError::Storage(format!("download of {key} failed: {e}"))),
        }
    }

    async fn get_to_file(&self, key: &str, path: &Path) -> Result<bool> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        let output = match resp {
            Ok(o) => o,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Ok(false)
            }
            Err(e) => return Err(EngineError::Storage(format!("download of {key} failed: {e}"))),
        };

        let mut body = output.body;
        let mut file = tokio::fs::File::create(path).await?;
        while let Some(chunk) = body.try_next().await.map_err(EngineError::storage)? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(true)
    }

    async fn stat(&self, key: &str) -> Result<Option<ObjectInfo>> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match resp {
            Ok(head) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: head.content_length().unwrap_or(0).max(0) as u64,
                last_modified: head.last_modified().and_then(to_utc),
            })),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(None),
            Err(e) => Err(EngineError::Storage(format!("stat of {key} failed: {e}"))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| EngineError::Storage(format!("listing {prefix} failed: {e}")))?;

            for object in resp.contents() {
                let Some(key) = object.key() else { continue };
                objects.push(ObjectInfo {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object.last_modified().and_then(to_utc),
                });
            }

            match resp.next_continuation_token() {
                Some(next) if resp.is_truncated().unwrap_or(false) => token = Some(next.to_string()),
                _ => break,
            }
        }

        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| EngineError::Storage(format!("delete of {key} failed: {e}")))?;
        Ok(())
    }
}
