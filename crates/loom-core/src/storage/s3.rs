//! S3 storage: Amazon S3 (eagerly validated) and generic S3-compatible
//! endpoints such as MinIO or Ceph (validated on first use).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use serde::{Deserialize, Serialize};

use super::object::{self, BucketUrl};
use super::{StorageBackend, StorageError};
use crate::domain::{FileType, OutputFileLog};

const SCHEME: &str = "s3://";
const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub region: String,
    /// Custom endpoint; Amazon's regional endpoint when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Credentials come from the environment when both are absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenericS3Config {
    pub endpoint: String,
    pub key: String,
    pub secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

fn validate_endpoint(endpoint: &str) -> Result<(), StorageError> {
    let url = reqwest::Url::parse(endpoint)
        .map_err(|e| StorageError::Config(format!("invalid s3 endpoint {endpoint:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(StorageError::Config(format!(
            "s3 endpoint {endpoint:?} must be an http(s) URL with a host"
        )));
    }
    Ok(())
}

/// Per-bucket client cache.
#[derive(Default)]
struct Clients {
    by_bucket: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl Clients {
    fn get_or_build(
        &self,
        bucket: &str,
        build: impl FnOnce() -> Result<Arc<dyn ObjectStore>, StorageError>,
    ) -> Result<Arc<dyn ObjectStore>, StorageError> {
        let mut clients = self.by_bucket.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(bucket) {
            return Ok(Arc::clone(client));
        }
        let client = build()?;
        clients.insert(bucket.to_string(), Arc::clone(&client));
        Ok(client)
    }
}

fn build_client(
    bucket: &str,
    region: &str,
    endpoint: Option<&str>,
    credentials: Option<(&str, &str)>,
) -> Result<Arc<dyn ObjectStore>, StorageError> {
    let mut builder = match credentials {
        Some((key, secret)) => AmazonS3Builder::new()
            .with_access_key_id(key)
            .with_secret_access_key(secret),
        None => AmazonS3Builder::from_env(),
    }
    .with_bucket_name(bucket)
    .with_region(region);
    if let Some(endpoint) = endpoint {
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(endpoint.starts_with("http://"));
    }
    let client = builder
        .build()
        .map_err(|e| StorageError::Config(format!("s3 bucket {bucket}: {e}")))?;
    Ok(Arc::new(client))
}

/// Amazon S3 (or any endpoint configured up front).
///
/// Region, endpoint and credential pairing are checked in [`S3Storage::new`],
/// so a bad configuration fails at startup.
pub struct S3Storage {
    config: S3Config,
    clients: Clients,
}

impl S3Storage {
    pub fn new(mut config: S3Config) -> Result<Self, StorageError> {
        if config.region.trim().is_empty() {
            config.region = DEFAULT_REGION.to_string();
        }
        if let Some(endpoint) = &config.endpoint {
            validate_endpoint(endpoint)?;
        }
        if config.key.is_some() != config.secret.is_some() {
            return Err(StorageError::Config(
                "s3 key and secret must be set together".to_string(),
            ));
        }
        Ok(Self {
            config,
            clients: Clients::default(),
        })
    }

    fn client(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, StorageError> {
        self.clients.get_or_build(bucket, || {
            let credentials = self.config.key.as_deref().zip(self.config.secret.as_deref());
            build_client(
                bucket,
                &self.config.region,
                self.config.endpoint.as_deref(),
                credentials,
            )
        })
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn supports(&self, url: &str) -> bool {
        url.starts_with(SCHEME)
    }

    async fn get(&self, url: &str, path: &Path, file_type: FileType) -> Result<(), StorageError> {
        let target = BucketUrl::parse(url, SCHEME)?;
        let client = self.client(&target.bucket)?;
        object::get(client.as_ref(), url, &target.key, path, file_type).await
    }

    async fn put(
        &self,
        url: &str,
        path: &Path,
        file_type: FileType,
    ) -> Result<Vec<OutputFileLog>, StorageError> {
        let target = BucketUrl::parse(url, SCHEME)?;
        let client = self.client(&target.bucket)?;
        object::put(client.as_ref(), url, &target.key, path, file_type).await
    }
}

/// An S3-compatible endpoint with static credentials.
///
/// Construction never fails; the configuration is checked when the first
/// transfer needs a client, and a bad one surfaces as a transfer error then.
pub struct GenericS3Storage {
    config: GenericS3Config,
    clients: Clients,
}

impl GenericS3Storage {
    pub fn new(config: GenericS3Config) -> Self {
        Self {
            config,
            clients: Clients::default(),
        }
    }

    fn client(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, StorageError> {
        self.clients.get_or_build(bucket, || {
            let GenericS3Config {
                endpoint,
                key,
                secret,
                region,
            } = &self.config;
            if endpoint.is_empty() || key.is_empty() || secret.is_empty() {
                return Err(StorageError::Config(
                    "generic s3 requires endpoint, key and secret".to_string(),
                ));
            }
            validate_endpoint(endpoint)?;
            let region = region.as_deref().unwrap_or(DEFAULT_REGION);
            build_client(
                bucket,
                region,
                Some(endpoint.as_str()),
                Some((key.as_str(), secret.as_str())),
            )
        })
    }
}

#[async_trait]
impl StorageBackend for GenericS3Storage {
    fn name(&self) -> &'static str {
        "generic-s3"
    }

    fn supports(&self, url: &str) -> bool {
        url.starts_with(SCHEME)
    }

    async fn get(&self, url: &str, path: &Path, file_type: FileType) -> Result<(), StorageError> {
        let target = BucketUrl::parse(url, SCHEME)?;
        let client = self.client(&target.bucket)?;
        object::get(client.as_ref(), url, &target.key, path, file_type).await
    }

    async fn put(
        &self,
        url: &str,
        path: &Path,
        file_type: FileType,
    ) -> Result<Vec<OutputFileLog>, StorageError> {
        let target = BucketUrl::parse(url, SCHEME)?;
        let client = self.client(&target.bucket)?;
        object::put(client.as_ref(), url, &target.key, path, file_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_rejects_bad_endpoint_at_construction() {
        let err = S3Storage::new(S3Config {
            endpoint: Some("not a url".into()),
            ..S3Config::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, StorageError::Config(_)));

        let err = S3Storage::new(S3Config {
            endpoint: Some("ftp://minio:9000".into()),
            ..S3Config::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[test]
    fn s3_requires_key_and_secret_together() {
        let err = S3Storage::new(S3Config {
            key: Some("AKIA".into()),
            ..S3Config::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[test]
    fn s3_defaults_region() {
        let storage = S3Storage::new(S3Config::default()).unwrap();
        assert_eq!(storage.config.region, DEFAULT_REGION);
        assert!(storage.supports("s3://bucket/key"));
        assert!(!storage.supports("gs://bucket/key"));
    }

    #[tokio::test]
    async fn generic_s3_defers_validation_to_first_use() {
        let storage = GenericS3Storage::new(GenericS3Config {
            endpoint: "nonsense".into(),
            ..GenericS3Config::default()
        });
        assert!(storage.supports("s3://bucket/key"));

        let dir = tempfile::tempdir().unwrap();
        let err = storage
            .get("s3://bucket/key", &dir.path().join("x"), FileType::File)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }
}
