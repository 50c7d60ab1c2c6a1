use std::path::Path;
use std::sync::Arc;

use super::{StorageBackend, StorageError};
use crate::domain::{FileType, OutputFileLog};

/// Registry of storage backends.
///
/// Built during initialization (mutable), shared read-only afterwards.
/// A URL resolves to the first registered backend that supports it, so
/// registration order decides between backends claiming the same prefix.
#[derive(Default, Clone)]
pub struct StorageRegistry {
    backends: Vec<Arc<dyn StorageBackend>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self {
            backends: Vec::new(),
        }
    }

    pub fn register(&mut self, backend: Arc<dyn StorageBackend>) {
        self.backends.push(backend);
    }

    pub fn with(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.register(backend);
        self
    }

    pub fn resolve(&self, url: &str) -> Result<&Arc<dyn StorageBackend>, StorageError> {
        self.backends
            .iter()
            .find(|backend| backend.supports(url))
            .ok_or_else(|| StorageError::Unsupported {
                url: url.to_string(),
            })
    }

    pub fn supports(&self, url: &str) -> bool {
        self.backends.iter().any(|backend| backend.supports(url))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|backend| backend.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub async fn get(&self, url: &str, path: &Path, file_type: FileType) -> Result<(), StorageError> {
        let backend = self.resolve(url)?;
        tracing::debug!(url, backend = backend.name(), path = %path.display(), "downloading");
        backend.get(url, path, file_type).await
    }

    pub async fn put(
        &self,
        url: &str,
        path: &Path,
        file_type: FileType,
    ) -> Result<Vec<OutputFileLog>, StorageError> {
        let backend = self.resolve(url)?;
        tracing::debug!(url, backend = backend.name(), path = %path.display(), "uploading");
        backend.put(url, path, file_type).await
    }
}
