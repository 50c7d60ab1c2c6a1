//! Mapping container paths onto the attempt's host work directory.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::domain::{FileType, Task};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("path {0:?} must be absolute and must not contain '..'")]
pub struct InvalidPath(pub String);

/// A host directory bound into a container.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Volume {
    pub host: PathBuf,
    pub container: String,
}

/// Container path `/a/b` lives at `<work_dir>/a/b` on the host.
#[derive(Debug, Clone)]
pub struct PathMapper {
    work_dir: PathBuf,
}

impl PathMapper {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn host_path(&self, container_path: &str) -> Result<PathBuf, InvalidPath> {
        let path = Path::new(container_path);
        if !path.is_absolute() {
            return Err(InvalidPath(container_path.to_string()));
        }
        let mut host = self.work_dir.clone();
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => host.push(part),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(InvalidPath(container_path.to_string()));
                }
            }
        }
        Ok(host)
    }

    /// Directories a container needs mounted so every declared path resolves
    /// into the work directory: the parent of each file, each directory
    /// itself, and each executor workdir. Nested entries are folded into
    /// their closest mounted ancestor.
    pub fn volumes(&self, task: &Task) -> Result<Vec<Volume>, InvalidPath> {
        let mut dirs = BTreeSet::new();
        let mut add_path = |path: &str, file_type: FileType| {
            let dir = match file_type {
                FileType::Directory => PathBuf::from(path),
                FileType::File => Path::new(path)
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("/")),
            };
            dirs.insert(dir);
        };
        for input in &task.spec.inputs {
            add_path(&input.path, input.file_type);
        }
        for output in &task.spec.outputs {
            add_path(&output.path, output.file_type);
        }
        for executor in &task.spec.executors {
            if let Some(workdir) = &executor.workdir {
                add_path(workdir, FileType::Directory);
            }
            for stdio in [&executor.stdin, &executor.stdout, &executor.stderr]
                .into_iter()
                .flatten()
            {
                add_path(stdio, FileType::File);
            }
        }

        let mut roots: Vec<PathBuf> = Vec::new();
        for dir in dirs {
            if roots.iter().any(|root| dir.starts_with(root)) {
                continue;
            }
            roots.push(dir);
        }
        roots
            .into_iter()
            .map(|dir| {
                let container = dir.to_string_lossy().into_owned();
                Ok(Volume {
                    host: self.host_path(&container)?,
                    container,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Executor, Input, Output, TaskId, TaskSpec};
    use chrono::Utc;

    #[test]
    fn maps_absolute_paths_under_work_dir() {
        let mapper = PathMapper::new("/work/attempt");
        assert_eq!(
            mapper.host_path("/opt/inputs/a.txt").unwrap(),
            PathBuf::from("/work/attempt/opt/inputs/a.txt")
        );
        assert!(mapper.host_path("relative").is_err());
        assert!(mapper.host_path("/opt/../etc/passwd").is_err());
    }

    #[test]
    fn volumes_fold_nested_directories() {
        let mut executor = Executor::shell("alpine", "true");
        executor.workdir = Some("/opt/workdir".into());
        let spec = TaskSpec::new(executor)
            .with_input(Input::new("file:///x", "/opt/inputs/test-file.txt", FileType::File))
            .with_input(Input::new("file:///d", "/opt/inputs/dir", FileType::Directory))
            .with_output(Output::new("file:///o", "/opt/workdir/out.txt", FileType::File));
        let task = Task::create(TaskId::from(ulid::Ulid::new()), spec, Utc::now(), |_| true).unwrap();

        let volumes = PathMapper::new("/w").volumes(&task).unwrap();
        let containers: Vec<_> = volumes.iter().map(|v| v.container.as_str()).collect();
        assert_eq!(containers, vec!["/opt/inputs", "/opt/workdir"]);
        assert_eq!(volumes[0].host, PathBuf::from("/w/opt/inputs"));
    }
}
