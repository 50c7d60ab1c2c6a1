//! Task, Executor, Input and Output: the declarative part of a task.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ValidationError;
use super::ids::TaskId;
use super::log::TaskLog;
use super::resources::Resources;
use super::state::TaskState;

/// Whether a staged path is a single file or a directory tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileType {
    #[default]
    File,
    Directory,
}

/// One ordered execution step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Executor {
    /// Container image. Ignored by the host process runner.
    pub image: String,
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl Executor {
    pub fn new(image: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            image: image.into(),
            command,
            ..Self::default()
        }
    }

    /// `sh -c <script>` in the given image.
    pub fn shell(image: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(image, vec!["sh".into(), "-c".into(), script.into()])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Input {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    pub path: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    /// Inline file content, used instead of `url`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl Input {
    pub fn new(url: impl Into<String>, path: impl Into<String>, file_type: FileType) -> Self {
        Self {
            url: url.into(),
            path: path.into(),
            file_type,
            ..Self::default()
        }
    }

    pub fn inline(content: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: Some(content.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Output {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub url: String,
    pub path: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
}

impl Output {
    pub fn new(url: impl Into<String>, path: impl Into<String>, file_type: FileType) -> Self {
        Self {
            url: url.into(),
            path: path.into(),
            file_type,
            ..Self::default()
        }
    }
}

/// What a client submits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub executors: Vec<Executor>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<Input>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<Output>,
    pub resources: Resources,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl TaskSpec {
    /// Convenience constructor for the common "one command" case.
    pub fn new(executor: Executor) -> Self {
        Self {
            executors: vec![executor],
            ..Self::default()
        }
    }

    pub fn with_input(mut self, input: Input) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_output(mut self, output: Output) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    /// Check structure and URL schemes. `supports` answers whether some
    /// registered storage backend accepts a URL (prefix match only).
    pub fn validate(&self, supports: impl Fn(&str) -> bool) -> Result<(), ValidationError> {
        if self.executors.is_empty() {
            return Err(ValidationError::NoExecutors);
        }
        for (index, executor) in self.executors.iter().enumerate() {
            if executor.command.is_empty() || executor.command[0].trim().is_empty() {
                return Err(ValidationError::EmptyCommand { index });
            }
        }

        for (index, input) in self.inputs.iter().enumerate() {
            check_absolute("input", index, &input.path)?;
            match (&input.content, input.url.is_empty()) {
                (Some(_), true) => {
                    if input.file_type == FileType::Directory {
                        return Err(ValidationError::ContentDirectory { index });
                    }
                }
                (None, false) => {
                    if !supports(&input.url) {
                        return Err(ValidationError::UnsupportedStorage {
                            kind: "input",
                            index,
                            url: input.url.clone(),
                        });
                    }
                }
                _ => return Err(ValidationError::InputSource { index }),
            }
        }

        for (index, output) in self.outputs.iter().enumerate() {
            check_absolute("output", index, &output.path)?;
            if output.url.is_empty() {
                return Err(ValidationError::EmptyOutputUrl { index });
            }
            if !supports(&output.url) {
                return Err(ValidationError::UnsupportedStorage {
                    kind: "output",
                    index,
                    url: output.url.clone(),
                });
            }
        }
        Ok(())
    }
}

fn check_absolute(kind: &'static str, index: usize, path: &str) -> Result<(), ValidationError> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(ValidationError::RelativePath {
            kind,
            index,
            path: path.to_string(),
        })
    }
}

/// How much of a task a read returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskView {
    /// Only id and state.
    #[default]
    Minimal,
    /// Everything except executor stdout/stderr and inline input content.
    Basic,
    Full,
}

impl std::fmt::Display for TaskView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TaskView::Minimal => "MINIMAL",
            TaskView::Basic => "BASIC",
            TaskView::Full => "FULL",
        })
    }
}

impl std::str::FromStr for TaskView {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MINIMAL" => Ok(TaskView::Minimal),
            "BASIC" => Ok(TaskView::Basic),
            "FULL" => Ok(TaskView::Full),
            _ => Err(format!("unknown view {s:?}")),
        }
    }
}

/// A stored task: identity, spec, state and attempt history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub spec: TaskSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<TaskLog>,
}

impl Task {
    /// Validate `spec` and build a new QUEUED task with no logs.
    pub fn create(
        id: TaskId,
        spec: TaskSpec,
        now: DateTime<Utc>,
        supports: impl Fn(&str) -> bool,
    ) -> Result<Task, ValidationError> {
        spec.validate(supports)?;
        Ok(Task {
            id,
            state: TaskState::Queued,
            creation_time: Some(now),
            spec,
            logs: Vec::new(),
        })
    }

    /// Number of attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.logs.len() as u32
    }

    /// The last attempt's log, if any.
    pub fn current_log(&self) -> Option<&TaskLog> {
        self.logs.last()
    }

    /// A copy trimmed to `view`.
    pub fn view(&self, view: TaskView) -> Task {
        match view {
            TaskView::Full => self.clone(),
            TaskView::Minimal => Task {
                id: self.id,
                state: self.state,
                creation_time: None,
                spec: TaskSpec::default(),
                logs: Vec::new(),
            },
            TaskView::Basic => {
                let mut task = self.clone();
                for input in &mut task.spec.inputs {
                    input.content = None;
                }
                for log in &mut task.logs {
                    for executor_log in &mut log.logs {
                        executor_log.stdout.clear();
                        executor_log.stderr.clear();
                    }
                }
                task
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::TaskId;
    use crate::domain::log::ExecutorLog;
    use ulid::Ulid;

    fn supports_file(url: &str) -> bool {
        url.starts_with("file://")
    }

    fn echo_spec() -> TaskSpec {
        TaskSpec::new(Executor::new("alpine", vec!["echo".into(), "hi".into()]))
    }

    #[test]
    fn create_starts_queued_without_logs() {
        let id = TaskId::from_ulid(Ulid::new());
        let task = Task::create(id, echo_spec(), Utc::now(), supports_file).unwrap();
        assert_eq!(task.state, TaskState::Queued);
        assert!(task.logs.is_empty());
        assert_eq!(task.attempts(), 0);
    }

    #[test]
    fn rejects_missing_executors() {
        let err = TaskSpec::default().validate(supports_file).unwrap_err();
        assert_eq!(err, ValidationError::NoExecutors);
    }

    #[test]
    fn rejects_empty_command() {
        let mut spec = echo_spec();
        spec.executors.push(Executor::new("alpine", vec![]));
        let err = spec.validate(supports_file).unwrap_err();
        assert_eq!(err, ValidationError::EmptyCommand { index: 1 });
    }

    #[test]
    fn rejects_unknown_scheme() {
        let spec = echo_spec().with_input(Input::new("ftp://host/x", "/in/x", FileType::File));
        let err = spec.validate(supports_file).unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedStorage { kind: "input", .. }));
    }

    #[test]
    fn rejects_relative_paths() {
        let spec = echo_spec().with_output(Output::new("file:///tmp/o", "out.txt", FileType::File));
        let err = spec.validate(supports_file).unwrap_err();
        assert!(matches!(err, ValidationError::RelativePath { kind: "output", .. }));
    }

    #[test]
    fn input_needs_exactly_one_source() {
        let mut input = Input::inline("x", "/in/x");
        input.url = "file:///tmp/x".into();
        let err = echo_spec().with_input(input).validate(supports_file).unwrap_err();
        assert_eq!(err, ValidationError::InputSource { index: 0 });

        let ok = echo_spec().with_input(Input::inline("x", "/in/x"));
        assert!(ok.validate(supports_file).is_ok());
    }

    #[test]
    fn basic_view_drops_stdio_and_content() {
        let id = TaskId::from_ulid(Ulid::new());
        let spec = echo_spec().with_input(Input::inline("secret", "/in/x"));
        let mut task = Task::create(id, spec, Utc::now(), supports_file).unwrap();
        let mut log = TaskLog::new(1, "local", Utc::now());
        log.logs.push(ExecutorLog {
            index: 0,
            start_time: Utc::now(),
            end_time: Some(Utc::now()),
            exit_code: Some(0),
            stdout: "out".into(),
            stderr: "err".into(),
        });
        task.logs.push(log);

        let basic = task.view(TaskView::Basic);
        assert_eq!(basic.spec.inputs[0].content, None);
        assert!(basic.logs[0].logs[0].stdout.is_empty());

        let minimal = task.view(TaskView::Minimal);
        assert_eq!(minimal.id, task.id);
        assert!(minimal.spec.executors.is_empty());
        assert!(minimal.logs.is_empty());

        assert_eq!(task.view(TaskView::Full), task);
    }

    #[test]
    fn task_spec_accepts_minimal_json() {
        let json = r#"{ "executors": [ { "image": "alpine", "command": ["echo", "hi"] } ] }"#;
        let spec: TaskSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.executors.len(), 1);
        assert_eq!(spec.resources, Resources::default());
    }
}
