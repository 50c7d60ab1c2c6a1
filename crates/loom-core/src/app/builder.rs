//! AppBuilder: wires storage, compute backends, the store and the scheduler
//! into a running [`App`].
//!
//! Everything is built from a [`Config`]; tests and embedders can swap in
//! their own store, clock or backends before `start`.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::compute::ComputeBackend;
use crate::config::{Config, ConfigError};
use crate::impls::InMemoryTaskStore;
use crate::ports::{Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator};
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::service::TaskService;
use crate::storage::StorageRegistry;

pub struct AppBuilder {
    config: Config,
    store: Option<Arc<dyn TaskStore>>,
    clock: Option<Arc<dyn Clock>>,
    storage: Option<StorageRegistry>,
    adapters: Option<Vec<Arc<dyn ComputeBackend>>>,
}

impl AppBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            clock: None,
            storage: None,
            adapters: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use `storage` instead of the `storage` section of the config.
    pub fn with_storage(mut self, storage: StorageRegistry) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Use `adapters` instead of the `compute` section of the config.
    pub fn with_adapters(mut self, adapters: Vec<Arc<dyn ComputeBackend>>) -> Self {
        self.adapters = Some(adapters);
        self
    }

    /// Validate the configuration and spawn the scheduler loop.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(self) -> Result<App, ConfigError> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let storage = match self.storage {
            Some(storage) => storage,
            None => self.config.storage.build()?,
        };
        let storage = Arc::new(storage);
        let adapters = match self.adapters {
            Some(adapters) if adapters.is_empty() => return Err(ConfigError::NoCompute),
            Some(adapters) => adapters,
            None => self
                .config
                .build_compute(Arc::clone(&storage), Arc::clone(&clock))?,
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));

        let (scheduler, handle) = Scheduler::new(
            Arc::clone(&store),
            adapters,
            Arc::clone(&clock),
            Arc::clone(&ids),
            Arc::new(self.config.scheduler.decider()),
            self.config.scheduler.settings(),
        );
        let shutdown = CancellationToken::new();
        let join = scheduler.spawn(shutdown.clone());

        let service = TaskService::new(store, storage, ids, clock, handle.clone());
        Ok(App {
            config: self.config,
            service,
            scheduler: handle,
            shutdown,
            join,
        })
    }
}

/// A running engine: the task service plus its scheduler loop.
pub struct App {
    config: Config,
    service: TaskService,
    scheduler: SchedulerHandle,
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl App {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn service(&self) -> &TaskService {
        &self.service
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Stop the scheduler loop and wait for it.
    pub async fn shutdown_and_join(self) {
        self.shutdown.cancel();
        if let Err(err) = self.join.await {
            tracing::warn!(error = %err, "scheduler task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Executor, TaskSpec, TaskState, TaskView};

    #[tokio::test]
    async fn start_with_defaults_and_shut_down() {
        let app = AppBuilder::new(Config::default()).start().unwrap();
        let capacity = app.scheduler().capacity().await.unwrap();
        assert_eq!(capacity.len(), 1);
        assert_eq!(capacity[0].adapter, "local");
        app.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn empty_adapter_list_is_rejected() {
        let result = AppBuilder::new(Config::default())
            .with_adapters(Vec::new())
            .start();
        assert!(matches!(result, Err(ConfigError::NoCompute)));
    }

    #[tokio::test]
    async fn scheduler_unavailable_after_shutdown() {
        let app = AppBuilder::new(Config::default()).start().unwrap();
        let service = app.service().clone();
        app.shutdown_and_join().await;

        // Tasks can still be created and read; nothing will run them.
        let id = service
            .create_task(TaskSpec::new(Executor::shell("alpine", "true")))
            .await
            .unwrap();
        let task = service.get_task(id, TaskView::Minimal).await.unwrap();
        assert_eq!(task.state, TaskState::Queued);
        assert!(service.scheduler().capacity().await.is_err());
    }
}
