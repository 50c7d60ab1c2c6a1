//! In-memory task store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::TaskRecord;
use crate::domain::{
    AttemptReport, ExecutorLog, IllegalTransitionError, Task, TaskEvent, TaskId, TaskLog, TaskState,
};
use crate::observability::TaskCounts;
use crate::ports::{CancelOutcome, ListPage, ListQuery, StoreError, TaskStore};

struct InMemoryState {
    /// All task records (single source of truth).
    records: HashMap<TaskId, TaskRecord>,

    /// Next insertion sequence number.
    next_seq: u64,
}

impl InMemoryState {
    fn record(&self, id: TaskId) -> Result<&TaskRecord, StoreError> {
        self.records.get(&id).ok_or(StoreError::NotFound(id))
    }

    fn record_mut(&mut self, id: TaskId) -> Result<&mut TaskRecord, StoreError> {
        self.records.get_mut(&id).ok_or(StoreError::NotFound(id))
    }

    /// Records in insertion order.
    fn ordered(&self) -> Vec<&TaskRecord> {
        let mut records: Vec<_> = self.records.values().collect();
        records.sort_by_key(|record| record.seq);
        records
    }
}

/// Task store backed by a mutex-protected map.
///
/// Clones share the same state.
#[derive(Clone)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState {
                records: HashMap::new(),
                next_seq: 0,
            })),
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: Task) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.records.insert(task.id, TaskRecord::new(task, seq));
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Task, StoreError> {
        let state = self.state.lock().await;
        Ok(state.record(id)?.task.clone())
    }

    async fn list(&self, query: &ListQuery) -> Result<ListPage, StoreError> {
        let state = self.state.lock().await;
        let after = match query.page_token {
            Some(token) => Some(state.record(token)?.seq),
            None => None,
        };
        let page_size = query.effective_page_size();

        let mut matching = state
            .ordered()
            .into_iter()
            .filter(|record| after.is_none_or(|seq| record.seq > seq))
            .filter(|record| query.matches(&record.task));

        let tasks: Vec<Task> = matching
            .by_ref()
            .take(page_size)
            .map(|record| record.task.view(query.view))
            .collect();
        let next_page_token = if matching.next().is_some() {
            tasks.last().map(|task| task.id)
        } else {
            None
        };
        Ok(ListPage {
            tasks,
            next_page_token,
        })
    }

    async fn runnable(&self, now: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .ordered()
            .into_iter()
            .filter(|record| record.is_runnable(now))
            .map(|record| record.task.clone())
            .collect())
    }

    async fn transition(&self, id: TaskId, event: TaskEvent) -> Result<TaskState, StoreError> {
        let mut state = self.state.lock().await;
        let record = state.record_mut(id)?;
        Ok(record.apply(event)?)
    }

    async fn begin_attempt(
        &self,
        id: TaskId,
        adapter: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let mut state = self.state.lock().await;
        let record = state.record_mut(id)?;
        if record.open_log().is_some() {
            return Err(StoreError::AttemptInFlight(id));
        }
        record.apply(TaskEvent::Initialize)?;

        let attempt = record.task.attempts() + 1;
        record.task.logs.push(TaskLog::new(attempt, adapter, now));
        record.not_before = None;
        Ok(attempt)
    }

    async fn record_progress(
        &self,
        id: TaskId,
        attempt: u32,
        logs: Vec<ExecutorLog>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state.record_mut(id)?;
        let log = record
            .log_mut(attempt)
            .ok_or(StoreError::UnknownAttempt { task_id: id, attempt })?;
        if log.is_closed() {
            return Err(StoreError::AttemptClosed { task_id: id, attempt });
        }
        log.logs = logs;
        Ok(())
    }

    async fn finish_attempt(
        &self,
        id: TaskId,
        attempt: u32,
        report: AttemptReport,
    ) -> Result<TaskState, StoreError> {
        let mut state = self.state.lock().await;
        let record = state.record_mut(id)?;
        match record.task.logs.iter().find(|log| log.attempt == attempt) {
            None => return Err(StoreError::UnknownAttempt { task_id: id, attempt }),
            Some(log) if log.is_closed() => {
                return Err(StoreError::AttemptClosed { task_id: id, attempt });
            }
            Some(_) => {}
        }

        // Validate the whole path before touching the record.
        let target = report.outcome.state();
        let mut next = record.state();
        for event in next.path_to(target) {
            next = next.apply(event)?;
        }
        if next != target {
            return Err(StoreError::IllegalTransition(IllegalTransitionError {
                from: record.state(),
                event: outcome_event(target),
            }));
        }

        record.task.state = next;
        if let Some(log) = record.log_mut(attempt) {
            log.close(report);
        }
        Ok(next)
    }

    async fn set_not_before(&self, id: TaskId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.record_mut(id)?.not_before = Some(at);
        Ok(())
    }

    async fn append_system_log(
        &self,
        id: TaskId,
        attempt: u32,
        message: String,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state.record_mut(id)?;
        let log = record
            .log_mut(attempt)
            .ok_or(StoreError::UnknownAttempt { task_id: id, attempt })?;
        log.system_logs.push(message);
        Ok(())
    }

    async fn cancel_if_unassigned(&self, id: TaskId) -> Result<CancelOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let record = state.record_mut(id)?;
        if let Some(log) = record.open_log() {
            return Ok(CancelOutcome::Assigned {
                attempt: log.attempt,
            });
        }
        let current = record.state();
        if current.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(current));
        }
        record.apply(TaskEvent::Cancel)?;
        Ok(CancelOutcome::Canceled)
    }

    async fn counts_by_state(&self) -> Result<TaskCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = TaskCounts::default();
        for record in state.records.values() {
            counts.add(record.state());
        }
        Ok(counts)
    }
}

/// The event that would have reached `target` directly.
fn outcome_event(target: TaskState) -> TaskEvent {
    match target {
        TaskState::Complete => TaskEvent::Complete,
        TaskState::Error => TaskEvent::ExecutorFailed,
        TaskState::SystemError => TaskEvent::SystemFailed,
        TaskState::Canceled => TaskEvent::Cancel,
        TaskState::Queued => TaskEvent::Requeue,
        TaskState::Initializing => TaskEvent::Initialize,
        TaskState::Running => TaskEvent::Run,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AttemptOutcome, Executor, TaskSpec, TaskView};
    use chrono::Duration;
    use ulid::Ulid;

    fn new_task(name: &str) -> Task {
        let mut spec = TaskSpec::new(Executor::shell("alpine", "true"));
        spec.name = Some(name.to_string());
        Task::create(TaskId::from(Ulid::new()), spec, Utc::now(), |_| true).unwrap()
    }

    async fn store_with(names: &[&str]) -> (InMemoryTaskStore, Vec<TaskId>) {
        let store = InMemoryTaskStore::new();
        let mut ids = Vec::new();
        for name in names {
            let task = new_task(name);
            ids.push(task.id);
            store.insert(task).await.unwrap();
        }
        (store, ids)
    }

    #[tokio::test]
    async fn insert_and_get() {
        let (store, ids) = store_with(&["a"]).await;
        let task = store.get(ids[0]).await.unwrap();
        assert_eq!(task.state, TaskState::Queued);
        assert!(task.logs.is_empty());

        let missing = TaskId::from(Ulid::new());
        assert_eq!(store.get(missing).await, Err(StoreError::NotFound(missing)));
    }

    #[tokio::test]
    async fn runnable_is_fifo_and_respects_backoff() {
        let (store, ids) = store_with(&["a", "b", "c"]).await;
        let now = Utc::now();
        store
            .set_not_before(ids[0], now + Duration::seconds(10))
            .await
            .unwrap();

        let runnable: Vec<_> = store
            .runnable(now)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(runnable, vec![ids[1], ids[2]]);

        let later: Vec<_> = store
            .runnable(now + Duration::seconds(11))
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(later, ids);
    }

    #[tokio::test]
    async fn begin_attempt_refuses_a_second_open_log() {
        let (store, ids) = store_with(&["a"]).await;
        let attempt = store.begin_attempt(ids[0], "local", Utc::now()).await.unwrap();
        assert_eq!(attempt, 1);
        assert_eq!(store.get(ids[0]).await.unwrap().state, TaskState::Initializing);

        let err = store
            .begin_attempt(ids[0], "local", Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::AttemptInFlight(ids[0]));
        assert!(store.runnable(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finish_attempt_walks_the_state_machine() {
        let (store, ids) = store_with(&["a"]).await;
        let id = ids[0];
        let attempt = store.begin_attempt(id, "local", Utc::now()).await.unwrap();

        let state = store
            .finish_attempt(id, attempt, AttemptReport::complete(Utc::now()))
            .await
            .unwrap();
        assert_eq!(state, TaskState::Complete);

        let task = store.get(id).await.unwrap();
        assert_eq!(task.logs[0].outcome, Some(AttemptOutcome::Complete));

        let again = store
            .finish_attempt(id, attempt, AttemptReport::complete(Utc::now()))
            .await;
        assert_eq!(again, Err(StoreError::AttemptClosed { task_id: id, attempt }));
    }

    #[tokio::test]
    async fn finish_attempt_from_initializing_passes_through_running() {
        let (store, ids) = store_with(&["a"]).await;
        let id = ids[0];
        let attempt = store.begin_attempt(id, "local", Utc::now()).await.unwrap();

        // The RUNNING snapshot was never observed.
        let report = AttemptReport::executor_error("exit 1", Utc::now());
        assert_eq!(
            store.finish_attempt(id, attempt, report).await.unwrap(),
            TaskState::Error
        );

        // A closed attempt cannot be reopened by a late report.
        let late = AttemptReport::system_error("late", Utc::now());
        assert!(store.finish_attempt(id, attempt, late).await.is_err());
        assert_eq!(store.get(id).await.unwrap().state, TaskState::Error);
    }

    #[tokio::test]
    async fn retry_opens_a_new_log() {
        let (store, ids) = store_with(&["a"]).await;
        let id = ids[0];
        let first = store.begin_attempt(id, "local", Utc::now()).await.unwrap();
        store
            .finish_attempt(id, first, AttemptReport::system_error("boom", Utc::now()))
            .await
            .unwrap();
        store.transition(id, TaskEvent::Requeue).await.unwrap();

        let second = store.begin_attempt(id, "local", Utc::now()).await.unwrap();
        assert_eq!(second, 2);
        let task = store.get(id).await.unwrap();
        assert_eq!(task.logs.len(), 2);
        assert!(task.logs[0].is_closed());
        assert!(!task.logs[1].is_closed());
    }

    #[tokio::test]
    async fn cancel_if_unassigned() {
        let (store, ids) = store_with(&["a", "b"]).await;

        assert_eq!(
            store.cancel_if_unassigned(ids[0]).await.unwrap(),
            CancelOutcome::Canceled
        );
        assert_eq!(
            store.cancel_if_unassigned(ids[0]).await.unwrap(),
            CancelOutcome::AlreadyTerminal(TaskState::Canceled)
        );

        store.begin_attempt(ids[1], "local", Utc::now()).await.unwrap();
        assert_eq!(
            store.cancel_if_unassigned(ids[1]).await.unwrap(),
            CancelOutcome::Assigned { attempt: 1 }
        );
    }

    #[tokio::test]
    async fn list_filters_and_pages_in_creation_order() {
        let (store, ids) = store_with(&["align-1", "align-2", "other", "align-3"]).await;
        store.cancel_if_unassigned(ids[1]).await.unwrap();

        let query = ListQuery {
            name_prefix: Some("align".into()),
            page_size: Some(2),
            view: TaskView::Minimal,
            ..ListQuery::default()
        };
        let first = store.list(&query).await.unwrap();
        let first_ids: Vec<_> = first.tasks.iter().map(|t| t.id).collect();
        assert_eq!(first_ids, vec![ids[0], ids[1]]);
        assert_eq!(first.next_page_token, Some(ids[1]));

        let second = store
            .list(&ListQuery {
                page_token: first.next_page_token,
                ..query.clone()
            })
            .await
            .unwrap();
        let second_ids: Vec<_> = second.tasks.iter().map(|t| t.id).collect();
        assert_eq!(second_ids, vec![ids[3]]);
        assert_eq!(second.next_page_token, None);

        let canceled = store
            .list(&ListQuery {
                state: Some(TaskState::Canceled),
                ..ListQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(canceled.tasks.len(), 1);
        assert_eq!(canceled.tasks[0].id, ids[1]);
    }

    #[tokio::test]
    async fn counts_by_state() {
        let (store, ids) = store_with(&["a", "b", "c"]).await;
        store.cancel_if_unassigned(ids[2]).await.unwrap();
        let counts = store.counts_by_state().await.unwrap();
        assert_eq!(counts.queued, 2);
        assert_eq!(counts.canceled, 1);
    }
}
