//! Task service: the API façade used by the gateway.

use std::sync::Arc;

use crate::domain::{Task, TaskId, TaskSpec, TaskState, TaskView};
use crate::error::LoomError;
use crate::observability::TaskCounts;
use crate::ports::{CancelOutcome, Clock, IdGenerator, ListPage, ListQuery, TaskStore};
use crate::scheduler::SchedulerHandle;
use crate::storage::StorageRegistry;

#[derive(Clone)]
pub struct TaskService {
    store: Arc<dyn TaskStore>,
    storage: Arc<StorageRegistry>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    scheduler: SchedulerHandle,
}

impl TaskService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        storage: Arc<StorageRegistry>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        scheduler: SchedulerHandle,
    ) -> Self {
        Self {
            store,
            storage,
            ids,
            clock,
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Validate and store a new QUEUED task, then wake the scheduler.
    pub async fn create_task(&self, spec: TaskSpec) -> Result<TaskId, LoomError> {
        let id = self.ids.generate_task_id();
        let task = Task::create(id, spec, self.clock.now(), |url| self.storage.supports(url))?;
        self.store.insert(task).await?;
        tracing::info!(task_id = %id, "task created");
        self.scheduler.wake();
        Ok(id)
    }

    pub async fn get_task(&self, id: TaskId, view: TaskView) -> Result<Task, LoomError> {
        Ok(self.store.get(id).await?.view(view))
    }

    pub async fn list_tasks(&self, query: &ListQuery) -> Result<ListPage, LoomError> {
        Ok(self.store.list(query).await?)
    }

    /// Cancel a task. A QUEUED task with no attempt is canceled on the spot;
    /// an in-flight one waits for its adapter. Terminal tasks are left as is.
    pub async fn cancel_task(&self, id: TaskId) -> Result<(), LoomError> {
        match self.store.cancel_if_unassigned(id).await? {
            CancelOutcome::Canceled => {
                tracing::info!(task_id = %id, "task canceled while queued");
                Ok(())
            }
            CancelOutcome::AlreadyTerminal(state @ (TaskState::Error | TaskState::SystemError)) => {
                // The scheduler may be about to requeue this attempt; its loop
                // orders the cancel after that decision.
                match self.scheduler.cancel(id).await {
                    Err(LoomError::SchedulerUnavailable) => {
                        tracing::debug!(task_id = %id, state = %state, "cancel on failed task ignored");
                        Ok(())
                    }
                    other => other,
                }
            }
            CancelOutcome::AlreadyTerminal(state) => {
                tracing::debug!(task_id = %id, state = %state, "cancel on terminal task ignored");
                Ok(())
            }
            CancelOutcome::Assigned { attempt } => {
                tracing::info!(task_id = %id, attempt, "canceling in-flight task");
                self.scheduler.cancel(id).await
            }
        }
    }

    pub async fn counts(&self) -> Result<TaskCounts, LoomError> {
        Ok(self.store.counts_by_state().await?)
    }
}
