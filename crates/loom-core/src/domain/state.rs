//! Task state machine.

use serde::{Deserialize, Serialize};

use super::errors::IllegalTransitionError;

/// Lifecycle state of a task.
///
/// State transitions:
/// - Queued -> Initializing -> Running -> Complete | Error | SystemError
/// - Initializing -> SystemError (input staging or launch failed)
/// - any non-terminal state -> Canceled
/// - Error | SystemError -> Queued | Initializing (new attempt)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Queued,
    Initializing,
    Running,
    Complete,
    /// An executor exited nonzero.
    Error,
    /// Infrastructure failure (staging, adapter).
    SystemError,
    Canceled,
}

/// Something that happened to a task and may move it to another state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    Initialize,
    Run,
    Complete,
    ExecutorFailed,
    SystemFailed,
    Cancel,
    Requeue,
}

impl TaskState {
    pub const ALL: [TaskState; 7] = [
        TaskState::Queued,
        TaskState::Initializing,
        TaskState::Running,
        TaskState::Complete,
        TaskState::Error,
        TaskState::SystemError,
        TaskState::Canceled,
    ];

    /// Is this a terminal state for the current attempt?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Complete | TaskState::Error | TaskState::SystemError | TaskState::Canceled
        )
    }

    /// Apply one event, returning the next state.
    pub fn apply(self, event: TaskEvent) -> Result<TaskState, IllegalTransitionError> {
        use TaskEvent as E;
        use TaskState as S;

        let next = match (self, event) {
            (S::Queued, E::Initialize) => S::Initializing,
            (S::Initializing, E::Run) => S::Running,
            (S::Initializing, E::SystemFailed) => S::SystemError,
            (S::Running, E::Complete) => S::Complete,
            (S::Running, E::ExecutorFailed) => S::Error,
            (S::Running, E::SystemFailed) => S::SystemError,
            (S::Queued | S::Initializing | S::Running, E::Cancel) => S::Canceled,
            (S::Error | S::SystemError, E::Requeue) => S::Queued,
            (S::Error | S::SystemError, E::Initialize) => S::Initializing,
            (from, event) => return Err(IllegalTransitionError { from, event }),
        };
        Ok(next)
    }

    /// Events that carry a task from `self` forward to `target` within one attempt.
    ///
    /// Used when a snapshot reports a later phase than the one recorded, e.g. a
    /// short task observed only after it already finished.
    pub fn path_to(self, target: TaskState) -> Vec<TaskEvent> {
        fn rank(state: TaskState) -> u8 {
            match state {
                TaskState::Queued => 0,
                TaskState::Initializing => 1,
                TaskState::Running => 2,
                _ => 3,
            }
        }

        if self == target || rank(self) > rank(target) || self.is_terminal() {
            return Vec::new();
        }

        let mut events = Vec::new();
        if target == TaskState::Canceled {
            events.push(TaskEvent::Cancel);
            return events;
        }
        if self == TaskState::Queued {
            events.push(TaskEvent::Initialize);
        }
        let needs_run = matches!(
            target,
            TaskState::Running | TaskState::Complete | TaskState::Error
        );
        if needs_run && rank(self) < 2 {
            events.push(TaskEvent::Run);
        }
        match target {
            TaskState::Complete => events.push(TaskEvent::Complete),
            TaskState::Error => events.push(TaskEvent::ExecutorFailed),
            TaskState::SystemError => events.push(TaskEvent::SystemFailed),
            _ => {}
        }
        events
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Queued => "QUEUED",
            TaskState::Initializing => "INITIALIZING",
            TaskState::Running => "RUNNING",
            TaskState::Complete => "COMPLETE",
            TaskState::Error => "ERROR",
            TaskState::SystemError => "SYSTEM_ERROR",
            TaskState::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .into_iter()
            .find(|state| state.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown task state {s:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskState::Queued, TaskEvent::Initialize, TaskState::Initializing)]
    #[case(TaskState::Initializing, TaskEvent::Run, TaskState::Running)]
    #[case(TaskState::Initializing, TaskEvent::SystemFailed, TaskState::SystemError)]
    #[case(TaskState::Running, TaskEvent::Complete, TaskState::Complete)]
    #[case(TaskState::Running, TaskEvent::ExecutorFailed, TaskState::Error)]
    #[case(TaskState::Running, TaskEvent::SystemFailed, TaskState::SystemError)]
    #[case(TaskState::Queued, TaskEvent::Cancel, TaskState::Canceled)]
    #[case(TaskState::Running, TaskEvent::Cancel, TaskState::Canceled)]
    #[case(TaskState::SystemError, TaskEvent::Requeue, TaskState::Queued)]
    #[case(TaskState::Error, TaskEvent::Initialize, TaskState::Initializing)]
    fn allowed_edges(#[case] from: TaskState, #[case] event: TaskEvent, #[case] to: TaskState) {
        assert_eq!(from.apply(event).unwrap(), to);
    }

    #[rstest]
    #[case(TaskState::Queued, TaskEvent::Run)]
    #[case(TaskState::Queued, TaskEvent::Complete)]
    #[case(TaskState::Initializing, TaskEvent::ExecutorFailed)]
    #[case(TaskState::Complete, TaskEvent::Cancel)]
    #[case(TaskState::Canceled, TaskEvent::Requeue)]
    #[case(TaskState::Complete, TaskEvent::Initialize)]
    #[case(TaskState::Error, TaskEvent::Cancel)]
    fn illegal_edges_are_rejected(#[case] from: TaskState, #[case] event: TaskEvent) {
        let err = from.apply(event).unwrap_err();
        assert_eq!(err.from, from);
        assert_eq!(err.event, event);
    }

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = TaskState::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                TaskState::Complete,
                TaskState::Error,
                TaskState::SystemError,
                TaskState::Canceled
            ]
        );
    }

    #[rstest]
    #[case(TaskState::Queued, TaskState::Complete, vec![TaskEvent::Initialize, TaskEvent::Run, TaskEvent::Complete])]
    #[case(TaskState::Queued, TaskState::SystemError, vec![TaskEvent::Initialize, TaskEvent::SystemFailed])]
    #[case(TaskState::Initializing, TaskState::Error, vec![TaskEvent::Run, TaskEvent::ExecutorFailed])]
    #[case(TaskState::Running, TaskState::Running, vec![])]
    #[case(TaskState::Running, TaskState::Initializing, vec![])]
    #[case(TaskState::Running, TaskState::Canceled, vec![TaskEvent::Cancel])]
    fn path_to_walks_the_table(
        #[case] from: TaskState,
        #[case] to: TaskState,
        #[case] expected: Vec<TaskEvent>,
    ) {
        let events = from.path_to(to);
        assert_eq!(events, expected);

        let reached = events
            .into_iter()
            .try_fold(from, |state, event| state.apply(event))
            .unwrap();
        if from.path_to(to).is_empty() {
            assert_eq!(reached, from);
        } else {
            assert_eq!(reached, to);
        }
    }

    #[test]
    fn state_serializes_screaming_snake_case() {
        let s = serde_json::to_string(&TaskState::SystemError).unwrap();
        assert_eq!(s, "\"SYSTEM_ERROR\"");
        assert_eq!("system_error".parse::<TaskState>().unwrap(), TaskState::SystemError);
    }
}
