//! Google Cloud Storage (`gs://bucket/key`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use object_store::ObjectStore;
use object_store::gcp::GoogleCloudStorageBuilder;

use super::object::{self, BucketUrl};
use super::{StorageBackend, StorageError};
use crate::domain::{FileType, OutputFileLog};

const SCHEME: &str = "gs://";

pub struct GoogleStorage {
    service_account_path: Option<PathBuf>,
    clients: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl GoogleStorage {
    /// Application default credentials from the environment.
    pub fn from_env() -> Self {
        Self {
            service_account_path: None,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Authenticate with a service-account key file, which must exist.
    pub fn with_service_account_path(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if !path.is_file() {
            return Err(StorageError::Config(format!(
                "gcs service account file {} does not exist",
                path.display()
            )));
        }
        Ok(Self {
            service_account_path: Some(path),
            clients: Mutex::new(HashMap::new()),
        })
    }

    fn client(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, StorageError> {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(bucket) {
            return Ok(Arc::clone(client));
        }

        let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
        if let Some(path) = &self.service_account_path {
            builder = builder.with_service_account_path(path.to_string_lossy());
        }
        let client: Arc<dyn ObjectStore> = Arc::new(
            builder
                .build()
                .map_err(|e| StorageError::Config(format!("gcs bucket {bucket}: {e}")))?,
        );
        clients.insert(bucket.to_string(), Arc::clone(&client));
        Ok(client)
    }
}

#[async_trait]
impl StorageBackend for GoogleStorage {
    fn name(&self) -> &'static str {
        "gcs"
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
