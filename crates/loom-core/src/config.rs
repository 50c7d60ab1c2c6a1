//! Server configuration, loaded from a JSON file. Every field has a default,
//! so an empty object (or no file at all) is a valid configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compute::{BatchAdapter, BatchSettings, ComputeBackend, WorkerAdapter};
use crate::domain::{GIB, Resources};
use crate::ports::Clock;
use crate::scheduler::{DefaultDecider, RetryPolicy, SchedulerSettings};
use crate::storage::{
    GenericS3Config, GenericS3Storage, GoogleStorage, HttpStorage, LocalStorage, S3Config,
    S3Storage, StorageError, StorageRegistry,
};
use crate::worker::WorkerSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("storage config: {0}")]
    Storage(#[from] StorageError),

    #[error("no compute backend configured")]
    NoCompute,

    #[error("duplicate compute backend name {0:?}")]
    DuplicateAdapter(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerSettings,
    pub storage: StorageConfig,
    pub compute: Vec<ComputeConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerSettings::default(),
            storage: StorageConfig::default(),
            compute: vec![ComputeConfig::default_local()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http_address: String,
    /// Send `Cache-Control: no-store` on read endpoints.
    pub disable_http_cache: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_address: "127.0.0.1:8000".to_string(),
            disable_http_cache: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub schedule_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_multiplier: f64,
    pub retry_max_delay_ms: u64,
    pub starvation_threshold: u32,
    pub max_poll_failures: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule_interval_ms: 1000,
            poll_interval_ms: 500,
            max_attempts: 3,
            retry_base_delay_ms: 2000,
            retry_multiplier: 2.0,
            retry_max_delay_ms: 300_000,
            starvation_threshold: 5,
            max_poll_failures: 5,
        }
    }
}

impl SchedulerConfig {
    pub fn settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            schedule_interval: Duration::from_millis(self.schedule_interval_ms.max(1)),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            starvation_threshold: self.starvation_threshold,
            max_poll_failures: self.max_poll_failures,
        }
    }

    pub fn decider(&self) -> DefaultDecider {
        let policy = RetryPolicy::new(
            Duration::from_millis(self.retry_base_delay_ms),
            self.retry_multiplier,
            Duration::from_millis(self.retry_max_delay_ms),
        );
        DefaultDecider::new(policy, self.max_attempts.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalStorageConfig {
    pub enabled: bool,
    /// Empty means any absolute path.
    pub allowed_dirs: Vec<PathBuf>,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcsConfig {
    pub enabled: bool,
    /// Falls back to the environment's credentials when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpStorageConfig {
    pub enabled: bool,
}

impl Default for HttpStorageConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Storage backends, registered in field order: local, s3, generic_s3,
/// gcs, http. The first backend that supports a URL wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub local: LocalStorageConfig,
    pub s3: Vec<S3Config>,
    pub generic_s3: Vec<GenericS3Config>,
    pub gcs: GcsConfig,
    pub http: HttpStorageConfig,
}

impl StorageConfig {
    /// S3 entries after the first: every one of them claims `s3://`, so
    /// only the first registered can ever serve a URL.
    pub fn shadowed_s3_entries(&self) -> Vec<String> {
        let s3 = self
            .s3
            .iter()
            .map(|c| format!("s3 (region {:?}, endpoint {:?})", c.region, c.endpoint));
        let generic = self
            .generic_s3
            .iter()
            .map(|c| format!("generic_s3 (endpoint {:?})", c.endpoint));
        s3.chain(generic).skip(1).collect()
    }

    /// Build the registry. Fails on invalid local, S3 or GCS settings;
    /// generic S3 is validated on first use.
    pub fn build(&self) -> Result<StorageRegistry, ConfigError> {
        let mut registry = StorageRegistry::new();
        if self.local.enabled {
            let local = if self.local.allowed_dirs.is_empty() {
                LocalStorage::new()
            } else {
                LocalStorage::with_allowed_dirs(self.local.allowed_dirs.clone())?
            };
            registry.register(Arc::new(local));
        }
        for entry in self.shadowed_s3_entries() {
            tracing::warn!(%entry, "s3 storage entry is shadowed by an earlier one and will never be used");
        }
        for s3 in &self.s3 {
            registry.register(Arc::new(S3Storage::new(s3.clone())?));
        }
        for generic in &self.generic_s3 {
            registry.register(Arc::new(GenericS3Storage::new(generic.clone())));
        }
        if self.gcs.enabled {
            let gcs = match &self.gcs.service_account_file {
                Some(path) => GoogleStorage::with_service_account_path(path)?,
                None => GoogleStorage::from_env(),
            };
            registry.register(Arc::new(gcs));
        }
        if self.http.enabled {
            registry.register(Arc::new(HttpStorage::new()));
        }
        tracing::debug!(backends = ?registry.names(), "storage backends registered");
        Ok(registry)
    }
}

/// One compute backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ComputeConfig {
    /// Executors run as host processes of this server.
    Local { name: String, capacity: Resources },
    /// Executors run in containers started by this server.
    Container { name: String, capacity: Resources },
    /// Attempts are submitted to a batch cluster.
    Batch {
        name: String,
        capacity: Resources,
        #[serde(flatten)]
        settings: BatchSettings,
    },
}

impl ComputeConfig {
    /// A local backend sized by the machine's parallelism.
    pub fn default_local() -> Self {
        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        ComputeConfig::Local {
            name: "local".to_string(),
            capacity: Resources::new(cpu_cores, 16 * GIB, 100 * GIB),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ComputeConfig::Local { name, .. }
            | ComputeConfig::Container { name, .. }
            | ComputeConfig::Batch { name, .. } => name,
        }
    }

    pub fn build(
        &self,
        storage: Arc<StorageRegistry>,
        clock: Arc<dyn Clock>,
        worker: &WorkerSettings,
    ) -> Arc<dyn ComputeBackend> {
        match self {
            ComputeConfig::Local { name, capacity } => Arc::new(WorkerAdapter::local(
                name.clone(),
                capacity.clone(),
                storage,
                clock,
                worker.clone(),
            )),
            ComputeConfig::Container { name, capacity } => Arc::new(WorkerAdapter::container(
                name.clone(),
                capacity.clone(),
                storage,
                clock,
                worker.clone(),
            )),
            ComputeConfig::Batch {
                name,
                capacity,
                settings,
            } => Arc::new(BatchAdapter::new(
                name.clone(),
                capacity.clone(),
                settings.clone(),
                clock,
            )),
        }
    }
}

impl Config {
    /// Load `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found; using defaults");
                return Ok(Config::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build every configured compute backend, in configuration order.
    pub fn build_compute(
        &self,
        storage: Arc<StorageRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Result<Vec<Arc<dyn ComputeBackend>>, ConfigError> {
        if self.compute.is_empty() {
            return Err(ConfigError::NoCompute);
        }
        let mut adapters: Vec<Arc<dyn ComputeBackend>> = Vec::with_capacity(self.compute.len());
        for compute in &self.compute {
            if adapters.iter().any(|a| a.name() == compute.name()) {
                return Err(ConfigError::DuplicateAdapter(compute.name().to_string()));
            }
            adapters.push(compute.build(Arc::clone(&storage), Arc::clone(&clock), &self.worker));
        }
        Ok(adapters)
    }
}
