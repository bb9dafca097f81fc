//! S3-compatible Artifact Store backend, enabled with the `s3` feature.
//!
//! Same custom-endpoint support for MinIO/DigitalOcean-Spaces-style
//! services as the local backend's path layout, same `full_key()`
//! prefixing. The AWS SDK calls here are driven through an owned
//! single-threaded `tokio` runtime since the SDK is async-only and
//! `ArtifactStore` is a synchronous trait.

use std::time::Duration;

use anyhow::Context;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use tokio::runtime::Runtime;
use url::Url;

use crate::{ArtifactStore, ObjectMeta, Result, StorageError, StorageType};

/// Configuration for the S3-compatible backend: region and bucket are
/// required; endpoint is only set for S3-compatible services that are
/// not AWS itself.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub base_path: String,
    pub endpoint: Option<String>,
}

impl S3Config {
    pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            base_path: String::new(),
            endpoint: None,
        }
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

pub struct S3Backend {
    client: Client,
    bucket: String,
    base_path: String,
    runtime: Runtime,
}

impl S3Backend {
    pub fn new(config: &S3Config) -> anyhow::Result<Self> {
        let runtime = Runtime::new().context("failed to start runtime for S3 client")?;
        let client = runtime.block_on(async {
            let mut loader = aws_config::defaults(BehaviorVersion::latest())
                .region(aws_sdk_s3::config::Region::new(config.region.clone()));
            if let Some(endpoint) = &config.endpoint {
                loader = loader.endpoint_url(endpoint.clone());
            }
            Client::new(&loader.load().await)
        });

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            base_path: config.base_path.clone(),
            runtime,
        })
    }

    fn full_key(&self, key: &str) -> String {
        if self.base_path.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.base_path.trim_end_matches('/'), key)
        }
    }
}

impl ArtifactStore for S3Backend {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let full_key = self.full_key(key);
        self.runtime
            .block_on(
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&full_key)
                    .body(aws_sdk_s3::primitives::ByteStream::from(data.to_vec()))
                    .send(),
            )
            .map_err(|e| StorageError::Backend(anyhow::anyhow!("put s3://{}/{full_key}: {e}", self.bucket)))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let full_key = self.full_key(key);
        let output = self
            .runtime
            .block_on(self.client.get_object().bucket(&self.bucket).key(&full_key).send())
            .map_err(|e| {
                if is_not_found(&e) {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::Backend(anyhow::anyhow!("get s3://{}/{full_key}: {e}", self.bucket))
                }
            })?;

        let bytes = self
            .runtime
            .block_on(output.body.collect())
            .map_err(|e| StorageError::Backend(anyhow::anyhow!("read body of s3://{}/{full_key}: {e}", self.bucket)))?;
        Ok(bytes.to_vec())
    }

    fn head(&self, key: &str) -> Result<ObjectMeta> {
        let full_key = self.full_key(key);
        let output = self
            .runtime
            .block_on(self.client.head_object().bucket(&self.bucket).key(&full_key).send())
            .map_err(|e| {
                if is_not_found(&e) {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::Backend(anyhow::anyhow!("head s3://{}/{full_key}: {e}", self.bucket))
                }
            })?;
        Ok(ObjectMeta {
            key: key.to_string(),
            size: output.content_length().unwrap_or(0).max(0) as u64,
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let full_prefix = self.full_key(prefix);
        let base_path = self.base_path.clone();
        let output = self
            .runtime
            .block_on(
                self.client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&full_prefix)
                    .send(),
            )
            .map_err(|e| StorageError::Backend(anyhow::anyhow!("list s3://{}/{full_prefix}: {e}", self.bucket)))?;

        let strip = if base_path.is_empty() {
            String::new()
        } else {
            format!("{}/", base_path.trim_end_matches('/'))
        };
        Ok(output
            .contents()
            .iter()
            .filter_map(|obj| {
                let key = obj.key()?.strip_prefix(strip.as_str()).unwrap_or(obj.key()?).to_string();
                Some(ObjectMeta {
                    key,
                    size: obj.size().unwrap_or(0).max(0) as u64,
                })
            })
            .collect())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let full_key = self.full_key(key);
        self.runtime
            .block_on(self.client.delete_object().bucket(&self.bucket).key(&full_key).send())
            .map_err(|e| StorageError::Backend(anyhow::anyhow!("delete s3://{}/{full_key}: {e}", self.bucket)))?;
        Ok(())
    }

    fn presign_get(&self, key: &str, ttl: Duration) -> Result<Option<Url>> {
        let full_key = self.full_key(key);
        let presign_config = PresigningConfig::expires_in(ttl)
            .map_err(|e| StorageError::Backend(anyhow::anyhow!("invalid presign ttl: {e}")))?;
        let presigned = self
            .runtime
            .block_on(
                self.client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(&full_key)
                    .presigned(presign_config),
            )
            .map_err(|e| StorageError::Backend(anyhow::anyhow!("presign s3://{}/{full_key}: {e}", self.bucket)))?;

        Url::parse(presigned.uri())
            .map(Some)
            .map_err(|e| StorageError::Backend(anyhow::anyhow!("presigned URL was not a valid URL: {e}")))
    }

    fn storage_type(&self) -> StorageType {
        StorageType::S3
    }
}

fn is_not_found<E>(err: &aws_sdk_s3::error::SdkError<E>) -> bool
where
    E: std::error::Error + 'static,
{
    err.raw_response()
        .map(|r| r.status().as_u16() == 404)
        .unwrap_or(false)
}
