//! Scheduler: the single control loop that assigns queued tasks to compute
//! backends and applies what the backends report back.
//!
//! The loop is the only writer of transitions for assigned tasks. Per-attempt
//! monitors and adapter cancellations run on their own tokio tasks and talk
//! to the loop through one mpsc channel.

mod decision;
mod ledger;
mod monitor;
mod retry;

pub use decision::{Decider, Decision, DecisionRecord, DefaultDecider};
pub use ledger::{AdapterCapacity, CapacityLedger};
pub use retry::RetryPolicy;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use self::monitor::Monitor;
use crate::compute::{BackendHandle, ComputeBackend};
use crate::domain::{
    Assignment, AttemptOutcome, AttemptReport, ExecutorLog, Resources, Task, TaskEvent, TaskId,
};
use crate::error::LoomError;
use crate::ports::{CancelOutcome, Clock, IdGenerator, StoreError, TaskStore};
use crate::worker::{AttemptSnapshot, Phase};

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    /// Time between scheduling passes when nothing wakes the loop.
    pub schedule_interval: Duration,
    /// Time between two polls of one attempt.
    pub poll_interval: Duration,
    /// Passes a fitting task may be skipped before backfill stops behind it.
    /// Zero disables the check.
    pub starvation_threshold: u32,
    /// Consecutive poll failures that resolve an attempt as SYSTEM_ERROR.
    pub max_poll_failures: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            schedule_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(500),
            starvation_threshold: 5,
            max_poll_failures: 5,
        }
    }
}

pub(crate) enum Message {
    Wake,
    Cancel {
        task_id: TaskId,
        reply: oneshot::Sender<()>,
    },
    Progress {
        task_id: TaskId,
        attempt: u32,
        snapshot: AttemptSnapshot,
    },
    PollFailed {
        task_id: TaskId,
        attempt: u32,
        error: String,
    },
    CancelDone {
        task_id: TaskId,
        attempt: u32,
        result: Result<(), String>,
    },
    Capacity {
        reply: oneshot::Sender<Vec<AdapterCapacity>>,
    },
    History {
        reply: oneshot::Sender<Vec<DecisionRecord>>,
    },
}

struct InFlight {
    attempt: u32,
    adapter: usize,
    handle: BackendHandle,
    request: Resources,
    running: bool,
    logs: Vec<ExecutorLog>,
    monitor: CancellationToken,
    canceling: bool,
    cancel_waiters: Vec<oneshot::Sender<()>>,
}

/// Talks to a running [`Scheduler`]. Cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl SchedulerHandle {
    /// Ask for a scheduling pass now.
    pub fn wake(&self) {
        let _ = self.tx.send(Message::Wake);
    }

    /// Stop the in-flight attempt of `task_id`, if any, and wait until the
    /// outcome is recorded.
    pub async fn cancel(&self, task_id: TaskId) -> Result<(), LoomError> {
        self.request(|reply| Message::Cancel { task_id, reply }).await
    }

    pub async fn capacity(&self) -> Result<Vec<AdapterCapacity>, LoomError> {
        self.request(|reply| Message::Capacity { reply }).await
    }

    pub async fn history(&self) -> Result<Vec<DecisionRecord>, LoomError> {
        self.request(|reply| Message::History { reply }).await
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> Message,
    ) -> Result<T, LoomError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(message(reply))
            .map_err(|_| LoomError::SchedulerUnavailable)?;
        rx.await.map_err(|_| LoomError::SchedulerUnavailable)
    }
}

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    adapters: Vec<Arc<dyn ComputeBackend>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    decider: Arc<dyn Decider>,
    settings: SchedulerSettings,
    ledger: CapacityLedger,
    in_flight: HashMap<TaskId, InFlight>,
    skips: HashMap<TaskId, u32>,
    oversized: HashSet<TaskId>,
    history: Vec<DecisionRecord>,
    stop: CancellationToken,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        adapters: Vec<Arc<dyn ComputeBackend>>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        decider: Arc<dyn Decider>,
        settings: SchedulerSettings,
    ) -> (Self, SchedulerHandle) {
        let mut ledger = CapacityLedger::new();
        for adapter in &adapters {
            ledger.register(adapter.name(), adapter.capacity().clone());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SchedulerHandle { tx: tx.clone() };
        let scheduler = Self {
            store,
            adapters,
            clock,
            ids,
            decider,
            settings,
            ledger,
            in_flight: HashMap::new(),
            skips: HashMap::new(),
            oversized: HashSet::new(),
            history: Vec::new(),
            stop: CancellationToken::new(),
            tx,
            rx,
        };
        (scheduler, handle)
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run until `shutdown` fires. Monitors stop with the loop; attempts
    /// already handed to adapters are left alone.
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.stop = shutdown;
        let mut ticker = tokio::time::interval(self.settings.schedule_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(adapters = self.adapters.len(), "scheduler started");

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => self.schedule_pass().await,
                message = self.rx.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
            }
        }
        tracing::info!(in_flight = self.in_flight.len(), "scheduler stopped");
    }

    async fn handle(&mut self, message: Message) {
        match message {
            Message::Wake => self.schedule_pass().await,
            Message::Cancel { task_id, reply } => self.cancel(task_id, reply).await,
            Message::Progress {
                task_id,
                attempt,
                snapshot,
            } => self.apply_snapshot(task_id, attempt, snapshot).await,
            Message::PollFailed {
                task_id,
                attempt,
                error,
            } => {
                let logs = self
                    .in_flight
                    .get(&task_id)
                    .map(|entry| entry.logs.clone())
                    .unwrap_or_default();
                let report = AttemptReport::system_error(
                    format!("lost contact with compute backend: {error}"),
                    self.clock.now(),
                )
                .with_executor_logs(logs);
                self.finish(task_id, attempt, report).await;
            }
            Message::CancelDone {
                task_id,
                attempt,
                result,
            } => self.cancel_done(task_id, attempt, result).await,
            Message::Capacity { reply } => {
                let _ = reply.send(self.ledger.snapshot());
            }
            Message::History { reply } => {
                let _ = reply.send(self.history.clone());
            }
        }
    }

    /// Assign runnable tasks in creation order, best fit first.
    async fn schedule_pass(&mut self) {
        let tasks = match self.store.runnable(self.clock.now()).await {
            Ok(tasks) => tasks,
            Err(err) => {
                tracing::warn!(error = %err, "could not list runnable tasks");
                return;
            }
        };

        let queued: HashSet<TaskId> = tasks.iter().map(|task| task.id).collect();
        let threshold = self.settings.starvation_threshold;
        let mut backfill = true;

        for task in tasks {
            if self.in_flight.contains_key(&task.id) {
                continue;
            }
            let request = &task.spec.resources;
            if !self.ledger.fits_any_total(request) {
                if self.oversized.insert(task.id) {
                    tracing::warn!(
                        task_id = %task.id,
                        cpu_cores = request.cpu_cores,
                        ram_bytes = request.ram_bytes,
                        disk_bytes = request.disk_bytes,
                        "task exceeds the capacity of every compute backend; it stays queued"
                    );
                }
                continue;
            }
            if !backfill {
                continue;
            }
            match self.ledger.best_fit(request) {
                Some(index) => {
                    self.skips.remove(&task.id);
                    self.assign(task, index).await;
                }
                None => {
                    let skipped = self.skips.entry(task.id).or_insert(0);
                    *skipped += 1;
                    if threshold > 0 && *skipped >= threshold {
                        tracing::debug!(task_id = %task.id, skipped = *skipped, "backfill paused behind starving task");
                        backfill = false;
                    }
                }
            }
        }

        self.skips.retain(|id, _| queued.contains(id));
        self.oversized.retain(|id| queued.contains(id));
    }

    async fn assign(&mut self, task: Task, index: usize) {
        let adapter = Arc::clone(&self.adapters[index]);
        let task_id = task.id;
        let attempt = match self
            .store
            .begin_attempt(task_id, adapter.name(), self.clock.now())
            .await
        {
            Ok(attempt) => attempt,
            Err(err) => {
                // Usually a cancel that landed after `runnable`.
                tracing::warn!(task_id = %task_id, error = %err, "could not begin attempt");
                return;
            }
        };

        let request = task.spec.resources.clone();
        let free_before = self.ledger.free(index).cloned().unwrap_or_default();
        self.ledger.reserve(index, &request);
        self.history.push(DecisionRecord::Assigned {
            task_id,
            attempt,
            adapter: adapter.name().to_string(),
            request: request.clone(),
            free_before,
        });

        let assignment = Assignment::new(self.ids.generate_assignment_id(), task, attempt);
        let assignment_id = assignment.id;
        match adapter.submit(assignment).await {
            Ok(handle) => {
                tracing::info!(
                    task_id = %task_id,
                    attempt,
                    adapter = %adapter.name(),
                    assignment = %assignment_id,
                    "task assigned"
                );
                let monitor = self.stop.child_token();
                let watcher = Monitor {
                    task_id,
                    attempt,
                    handle: handle.clone(),
                    backend: Arc::clone(&adapter),
                    tx: self.tx.clone(),
                    interval: self.settings.poll_interval,
                    max_failures: self.settings.max_poll_failures.max(1),
                };
                tokio::spawn(watcher.run(monitor.clone()));
                self.in_flight.insert(
                    task_id,
                    InFlight {
                        attempt,
                        adapter: index,
                        handle,
                        request,
                        running: false,
                        logs: Vec::new(),
                        monitor,
                        canceling: false,
                        cancel_waiters: Vec::new(),
                    },
                );
            }
            Err(err) => {
                tracing::warn!(task_id = %task_id, attempt, adapter = %adapter.name(), error = %err, "submit failed");
                let report = AttemptReport::system_error(
                    format!("submit to {} failed: {err}", adapter.name()),
                    self.clock.now(),
                );
                self.settle(task_id, attempt, index, &request, report).await;
            }
        }
    }

    async fn apply_snapshot(&mut self, task_id: TaskId, attempt: u32, snapshot: AttemptSnapshot) {
        let Some(entry) = self.in_flight.get_mut(&task_id) else {
            return;
        };
        if entry.attempt != attempt {
            return;
        }

        if let Some(report) = snapshot.report {
            self.finish(task_id, attempt, report).await;
            return;
        }

        if snapshot.phase == Phase::Running && !entry.running {
            entry.running = true;
            if let Err(err) = self.store.transition(task_id, TaskEvent::Run).await {
                log_store_error(task_id, attempt, &err, "could not mark attempt running");
            }
        }
        if snapshot.executor_logs != entry.logs {
            entry.logs = snapshot.executor_logs.clone();
            if let Err(err) = self
                .store
                .record_progress(task_id, attempt, snapshot.executor_logs)
                .await
            {
                log_store_error(task_id, attempt, &err, "could not record progress");
            }
        }
    }

    /// Close an in-flight attempt with its final report.
    async fn finish(&mut self, task_id: TaskId, attempt: u32, report: AttemptReport) {
        if self
            .in_flight
            .get(&task_id)
            .is_none_or(|entry| entry.attempt != attempt)
        {
            return;
        }
        let Some(entry) = self.in_flight.remove(&task_id) else {
            return;
        };
        entry.monitor.cancel();
        self.settle(task_id, attempt, entry.adapter, &entry.request, report)
            .await;
        for waiter in entry.cancel_waiters {
            let _ = waiter.send(());
        }
        self.wake();
    }

    /// Release capacity, record the outcome, and decide what comes next.
    async fn settle(
        &mut self,
        task_id: TaskId,
        attempt: u32,
        adapter: usize,
        request: &Resources,
        report: AttemptReport,
    ) {
        self.ledger.release(adapter, request);
        let outcome = report.outcome;
        let adapter_name = self.adapters[adapter].name().to_string();
        self.history.push(DecisionRecord::Released {
            task_id,
            attempt,
            adapter: adapter_name.clone(),
            outcome,
        });

        let reason = report.reason.clone();
        match self.store.finish_attempt(task_id, attempt, report).await {
            Ok(state) => {
                tracing::info!(
                    task_id = %task_id,
                    attempt,
                    adapter = %adapter_name,
                    state = %state,
                    reason = reason.as_deref().unwrap_or(""),
                    "attempt finished"
                );
            }
            Err(err) => {
                log_store_error(task_id, attempt, &err, "could not record attempt outcome");
                return;
            }
        }

        if outcome != AttemptOutcome::Canceled {
            self.decide(task_id, attempt, outcome).await;
        }
    }

    async fn decide(&mut self, task_id: TaskId, attempt: u32, outcome: AttemptOutcome) {
        let task = match self.store.get(task_id).await {
            Ok(task) => task,
            Err(err) => {
                log_store_error(task_id, attempt, &err, "could not load task for retry decision");
                return;
            }
        };

        match self.decider.decide(&task, outcome) {
            Decision::Done => {}
            Decision::Retry { delay, reason } => {
                let now = self.clock.now();
                let at = TimeDelta::from_std(delay)
                    .ok()
                    .and_then(|delta| now.checked_add_signed(delta))
                    .unwrap_or(now);
                let requeued = async {
                    self.store.set_not_before(task_id, at).await?;
                    self.store.transition(task_id, TaskEvent::Requeue).await?;
                    self.store
                        .append_system_log(task_id, attempt, reason.clone())
                        .await?;
                    Ok::<(), StoreError>(())
                }
                .await;
                match requeued {
                    Ok(()) => {
                        tracing::info!(task_id = %task_id, attempt, delay_ms = delay.as_millis() as u64, "attempt will be retried");
                        self.history.push(DecisionRecord::Retried {
                            task_id,
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                        });
                    }
                    Err(err) => log_store_error(task_id, attempt, &err, "could not requeue task"),
                }
            }
            Decision::GiveUp { reason } => {
                tracing::warn!(task_id = %task_id, attempt, reason = %reason, "giving up on task");
                if let Err(err) = self
                    .store
                    .append_system_log(task_id, attempt, reason)
                    .await
                {
                    log_store_error(task_id, attempt, &err, "could not append system log");
                }
                self.history.push(DecisionRecord::GaveUp { task_id, attempt });
            }
        }
    }

    async fn cancel(&mut self, task_id: TaskId, reply: oneshot::Sender<()>) {
        let Some(entry) = self.in_flight.get_mut(&task_id) else {
            // Nothing in flight: the attempt ended, or was never ours.
            match self.store.cancel_if_unassigned(task_id).await {
                Ok(CancelOutcome::Assigned { attempt }) => {
                    tracing::warn!(task_id = %task_id, attempt, "open attempt is unknown to the scheduler");
                }
                Ok(_) => {}
                Err(err) => log_store_error(task_id, 0, &err, "cancel failed"),
            }
            let _ = reply.send(());
            return;
        };

        entry.cancel_waiters.push(reply);
        if entry.canceling {
            return;
        }
        entry.canceling = true;
        entry.monitor.cancel();

        let backend = Arc::clone(&self.adapters[entry.adapter]);
        let handle = entry.handle.clone();
        let attempt = entry.attempt;
        let tx = self.tx.clone();
        tracing::info!(task_id = %task_id, attempt, adapter = %backend.name(), "canceling attempt");
        tokio::spawn(async move {
            let result = backend.cancel(&handle).await.map_err(|err| err.to_string());
            let _ = tx.send(Message::CancelDone {
                task_id,
                attempt,
                result,
            });
        });
    }

    async fn cancel_done(&mut self, task_id: TaskId, attempt: u32, result: Result<(), String>) {
        let Some(logs) = self
            .in_flight
            .get(&task_id)
            .filter(|entry| entry.attempt == attempt)
            .map(|entry| entry.logs.clone())
        else {
            // The attempt reported its own outcome first.
            return;
        };

        if let Err(err) = result {
            tracing::warn!(task_id = %task_id, attempt, error = %err, "adapter cancel failed");
            if let Err(err) = self
                .store
                .append_system_log(task_id, attempt, format!("adapter cancel failed: {err}"))
                .await
            {
                log_store_error(task_id, attempt, &err, "could not append system log");
            }
        }
        self.history.push(DecisionRecord::Canceled { task_id, attempt });
        let report = AttemptReport::canceled(self.clock.now()).with_executor_logs(logs);
        self.finish(task_id, attempt, report).await;
    }

    fn wake(&self) {
        let _ = self.tx.send(Message::Wake);
    }
}

fn log_store_error(task_id: TaskId, attempt: u32, err: &StoreError, message: &str) {
    match err {
        StoreError::IllegalTransition(illegal) => {
            tracing::error!(task_id = %task_id, attempt, from = %illegal.from, event = ?illegal.event, "{message}: illegal transition");
        }
        other => tracing::warn!(task_id = %task_id, attempt, error = %other, "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::AdapterError;
    use crate::domain::{AssignmentId, Executor, TaskSpec, TaskState};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{FixedClock, UlidGenerator};
    use crate::service::TaskService;
    use crate::storage::StorageRegistry;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBackend {
        name: String,
        capacity: Resources,
        fail_submit: bool,
        submitted: Mutex<Vec<Assignment>>,
        canceled: Mutex<Vec<AssignmentId>>,
    }

    impl FakeBackend {
        fn new(name: &str, capacity: Resources) -> Self {
            Self {
                name: name.into(),
                capacity,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ComputeBackend for FakeBackend {
        fn name(&self) -> &str {
            &self.name
        }

        fn capacity(&self) -> &Resources {
            &self.capacity
        }

        async fn submit(&self, assignment: Assignment) -> Result<BackendHandle, AdapterError> {
            if self.fail_submit {
                return Err(AdapterError::Unavailable("cluster offline".into()));
            }
            let handle = BackendHandle {
                adapter: self.name.clone(),
                assignment: assignment.id,
                external_id: None,
            };
            self.submitted.lock().unwrap().push(assignment);
            Ok(handle)
        }

        async fn poll(&self, _handle: &BackendHandle) -> Result<AttemptSnapshot, AdapterError> {
            Ok(AttemptSnapshot::default())
        }

        async fn cancel(&self, handle: &BackendHandle) -> Result<(), AdapterError> {
            self.canceled.lock().unwrap().push(handle.assignment);
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        clock: Arc<FixedClock>,
        scheduler: Scheduler,
        handle: SchedulerHandle,
        backend: Arc<FakeBackend>,
    }

    fn fixture(backend: FakeBackend, decider: DefaultDecider, starvation_threshold: u32) -> Fixture {
        let store = Arc::new(InMemoryTaskStore::new());
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let backend = Arc::new(backend);
        let (scheduler, handle) = Scheduler::new(
            store.clone(),
            vec![backend.clone() as Arc<dyn ComputeBackend>],
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            Arc::new(decider),
            SchedulerSettings {
                poll_interval: Duration::from_secs(3600),
                starvation_threshold,
                ..SchedulerSettings::default()
            },
        );
        Fixture {
            store,
            clock,
            scheduler,
            handle,
            backend,
        }
    }

    impl Fixture {
        fn service(&self) -> TaskService {
            TaskService::new(
                self.store.clone(),
                Arc::new(StorageRegistry::new()),
                Arc::new(UlidGenerator::new(self.clock.clone())),
                self.clock.clone(),
                self.handle.clone(),
            )
        }
    }

    async fn queue(fx: &Fixture, cpu: u32) -> TaskId {
        let id = TaskId::from(ulid::Ulid::new());
        let spec = TaskSpec::new(Executor::shell("alpine", "true"))
            .with_resources(Resources::new(cpu, 1, 1));
        let task = Task::create(id, spec, fx.clock.now(), |_| true).unwrap();
        fx.store.insert(task).await.unwrap();
        id
    }

    async fn state(fx: &Fixture, id: TaskId) -> TaskState {
        fx.store.get(id).await.unwrap().state
    }

    fn assigned(fx: &Fixture) -> Vec<TaskId> {
        fx.backend
            .submitted
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.task.id)
            .collect()
    }

    #[tokio::test]
    async fn assigns_in_creation_order_within_capacity() {
        let mut fx = fixture(
            FakeBackend::new("local", Resources::new(2, 8, 20)),
            DefaultDecider::default(),
            5,
        );
        let a = queue(&fx, 1).await;
        let b = queue(&fx, 1).await;
        let c = queue(&fx, 1).await;

        fx.scheduler.schedule_pass().await;

        assert_eq!(assigned(&fx), vec![a, b]);
        assert_eq!(state(&fx, a).await, TaskState::Initializing);
        assert_eq!(state(&fx, c).await, TaskState::Queued);
        assert!(fx.store.get(c).await.unwrap().logs.is_empty());
        assert_eq!(fx.scheduler.ledger.free(0), Some(&Resources::new(0, 6, 18)));

        for record in &fx.scheduler.history {
            if let DecisionRecord::Assigned {
                request,
                free_before,
                ..
            } = record
            {
                assert!(request.fits_within(free_before));
            }
        }
    }

    #[tokio::test]
    async fn cancel_while_retry_is_being_decided_is_not_lost() {
        let mut fx = fixture(
            FakeBackend::new("local", Resources::new(4, 8, 20)),
            DefaultDecider::default(),
            5,
        );
        let id = queue(&fx, 1).await;
        fx.scheduler.schedule_pass().await;

        // The failed attempt is recorded, the retry decision has not run yet.
        let entry = fx.scheduler.in_flight.remove(&id).unwrap();
        entry.monitor.cancel();
        fx.store
            .finish_attempt(id, 1, AttemptReport::system_error("node lost", fx.clock.now()))
            .await
            .unwrap();
        assert_eq!(state(&fx, id).await, TaskState::SystemError);

        let service = fx.service();
        let canceled = tokio::spawn(async move { service.cancel_task(id).await });

        fx.scheduler
            .decide(id, 1, AttemptOutcome::SystemError)
            .await;
        assert_eq!(state(&fx, id).await, TaskState::Queued);

        loop {
            let message = fx.scheduler.rx.recv().await.unwrap();
            let is_cancel = matches!(message, Message::Cancel { .. });
            fx.scheduler.handle(message).await;
            if is_cancel {
                break;
            }
        }
        canceled.await.unwrap().unwrap();
        assert_eq!(state(&fx, id).await, TaskState::Canceled);
        assert_eq!(assigned(&fx).len(), 1);
    }

    #[tokio::test]
    async fn finishing_releases_capacity() {
        let mut fx = fixture(
            FakeBackend::new("local", Resources::new(4, 8, 20)),
            DefaultDecider::default(),
            5,
        );
        let id = queue(&fx, 4).await;
        fx.scheduler.schedule_pass().await;
        assert_eq!(fx.scheduler.ledger.free(0).unwrap().cpu_cores, 0);

        let report = AttemptReport::complete(fx.clock.now());
        fx.scheduler.finish(id, 1, report).await;

        assert_eq!(state(&fx, id).await, TaskState::Complete);
        assert_eq!(fx.scheduler.ledger.free(0), Some(&Resources::new(4, 8, 20)));
        assert!(fx.scheduler.in_flight.is_empty());
    }

    #[tokio::test]
    async fn running_phase_and_logs_are_recorded() {
        let mut fx = fixture(
            FakeBackend::new("local", Resources::new(4, 8, 20)),
            DefaultDecider::default(),
            5,
        );
        let id = queue(&fx, 1).await;
        fx.scheduler.schedule_pass().await;

        let log = ExecutorLog {
            index: 0,
            start_time: fx.clock.now(),
            end_time: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
        };
        let snapshot = AttemptSnapshot {
            phase: Phase::Running,
            executor_logs: vec![log],
            report: None,
        };
        fx.scheduler.apply_snapshot(id, 1, snapshot).await;

        let task = fx.store.get(id).await.unwrap();
        assert_eq!(task.state, TaskState::Running);
        assert_eq!(task.logs[0].logs.len(), 1);
    }

    #[tokio::test]
    async fn starving_task_stops_backfill() {
        let mut fx = fixture(
            FakeBackend::new("local", Resources::new(4, 8, 20)),
            DefaultDecider::default(),
            2,
        );
        let first = queue(&fx, 1).await;
        fx.scheduler.schedule_pass().await;

        let big = queue(&fx, 4).await;
        let small_1 = queue(&fx, 1).await;

        // Pass 1: `big` is skipped once, `small_1` backfills.
        fx.scheduler.schedule_pass().await;
        assert_eq!(assigned(&fx), vec![first, small_1]);

        // Pass 2: `big` reaches the threshold, `small_2` must wait although
        // it fits.
        let small_2 = queue(&fx, 1).await;
        fx.scheduler.schedule_pass().await;
        assert_eq!(assigned(&fx), vec![first, small_1]);
        assert_eq!(state(&fx, small_2).await, TaskState::Queued);

        // Capacity frees up: `big` goes first.
        let now = fx.clock.now();
        fx.scheduler.finish(first, 1, AttemptReport::complete(now)).await;
        fx.scheduler.finish(small_1, 1, AttemptReport::complete(now)).await;
        fx.scheduler.schedule_pass().await;
        assert_eq!(assigned(&fx), vec![first, small_1, big]);
        assert_eq!(state(&fx, small_2).await, TaskState::Queued);
    }

    #[tokio::test]
    async fn oversized_task_stays_queued() {
        let mut fx = fixture(
            FakeBackend::new("local", Resources::new(4, 8, 20)),
            DefaultDecider::default(),
            1,
        );
        let huge = queue(&fx, 64).await;
        let small = queue(&fx, 1).await;

        fx.scheduler.schedule_pass().await;
        fx.scheduler.schedule_pass().await;

        assert_eq!(assigned(&fx), vec![small]);
        assert_eq!(state(&fx, huge).await, TaskState::Queued);
    }

    #[tokio::test]
    async fn system_errors_are_retried_until_the_limit() {
        let policy = RetryPolicy::new(Duration::from_secs(10), 2.0, Duration::from_secs(60));
        let mut fx = fixture(
            FakeBackend::new("local", Resources::new(4, 8, 20)),
            DefaultDecider::new(policy, 2),
            5,
        );
        let id = queue(&fx, 1).await;

        fx.scheduler.schedule_pass().await;
        let report = AttemptReport::system_error("node lost", fx.clock.now());
        fx.scheduler.finish(id, 1, report).await;

        let task = fx.store.get(id).await.unwrap();
        assert_eq!(task.state, TaskState::Queued);
        assert!(task.logs[0].system_logs[0].contains("attempt 2/2"));

        // Backoff holds the task back.
        fx.scheduler.schedule_pass().await;
        assert_eq!(assigned(&fx).len(), 1);
        fx.clock.advance(TimeDelta::seconds(10));
        fx.scheduler.schedule_pass().await;
        assert_eq!(assigned(&fx).len(), 2);

        let report = AttemptReport::system_error("node lost again", fx.clock.now());
        fx.scheduler.finish(id, 2, report).await;

        let task = fx.store.get(id).await.unwrap();
        assert_eq!(task.state, TaskState::SystemError);
        assert_eq!(task.attempts(), 2);
        assert!(task.logs[1].system_logs[0].contains("retry limit reached"));
        assert!(matches!(
            fx.scheduler.history.last(),
            Some(DecisionRecord::GaveUp { attempt: 2, .. })
        ));
    }

    #[tokio::test]
    async fn executor_errors_are_not_retried() {
        let mut fx = fixture(
            FakeBackend::new("local", Resources::new(4, 8, 20)),
            DefaultDecider::default(),
            5,
        );
        let id = queue(&fx, 1).await;
        fx.scheduler.schedule_pass().await;
        let report = AttemptReport::executor_error("executor 0 exited with 1", fx.clock.now());
        fx.scheduler.finish(id, 1, report).await;

        fx.scheduler.schedule_pass().await;
        assert_eq!(state(&fx, id).await, TaskState::Error);
        assert_eq!(assigned(&fx).len(), 1);
    }

    #[tokio::test]
    async fn submit_failure_becomes_a_system_error_attempt() {
        let backend = FakeBackend {
            fail_submit: true,
            ..FakeBackend::new("cluster", Resources::new(4, 8, 20))
        };
        let mut fx = fixture(backend, DefaultDecider::default(), 5);
        let id = queue(&fx, 1).await;

        fx.scheduler.schedule_pass().await;

        let task = fx.store.get(id).await.unwrap();
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.logs[0].outcome, Some(AttemptOutcome::SystemError));
        assert!(task.logs[0].reason.as_deref().unwrap().contains("submit to cluster failed"));
        assert_eq!(fx.scheduler.ledger.free(0), Some(&Resources::new(4, 8, 20)));
    }

    #[tokio::test]
    async fn cancel_in_flight_waits_for_the_adapter() {
        let mut fx = fixture(
            FakeBackend::new("local", Resources::new(4, 8, 20)),
            DefaultDecider::default(),
            5,
        );
        let id = queue(&fx, 1).await;
        fx.scheduler.schedule_pass().await;

        let (reply, mut acked) = oneshot::channel();
        fx.scheduler.cancel(id, reply).await;
        assert!(acked.try_recv().is_err());

        // Drain until the adapter's cancel comes back.
        loop {
            let message = fx.scheduler.rx.recv().await.unwrap();
            let done = matches!(message, Message::CancelDone { .. });
            fx.scheduler.handle(message).await;
            if done {
                break;
            }
        }

        assert!(acked.try_recv().is_ok());
        assert_eq!(state(&fx, id).await, TaskState::Canceled);
        assert_eq!(fx.backend.canceled.lock().unwrap().len(), 1);
        assert_eq!(fx.scheduler.ledger.free(0), Some(&Resources::new(4, 8, 20)));
    }
}
