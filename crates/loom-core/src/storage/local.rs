//! Local filesystem storage (`file://`).

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{StorageBackend, StorageError, download_directory, ensure_parent, join_url, walk_tree};
use crate::domain::{FileType, OutputFileLog};

const PREFIX: &str = "file://";

/// Copies files between the work directory and local (or shared network)
/// filesystem paths.
///
/// When `allowed_dirs` is non-empty, every URL must point inside one of them.
#[derive(Debug, Clone, Default)]
pub struct LocalStorage {
    allowed_dirs: Vec<PathBuf>,
}

impl LocalStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allowed_dirs(allowed_dirs: Vec<PathBuf>) -> Result<Self, StorageError> {
        for dir in &allowed_dirs {
            if !dir.is_absolute() {
                return Err(StorageError::Config(format!(
                    "local allowed_dirs entry {} must be absolute",
                    dir.display()
                )));
            }
        }
        Ok(Self { allowed_dirs })
    }

    fn resolve(&self, url: &str) -> Result<PathBuf, StorageError> {
        let raw = url.strip_prefix(PREFIX).ok_or_else(|| StorageError::InvalidUrl {
            url: url.to_string(),
            reason: "expected file://".to_string(),
        })?;
        let path = PathBuf::from(raw);
        if !path.is_absolute() {
            return Err(StorageError::InvalidUrl {
                url: url.to_string(),
                reason: "path must be absolute".to_string(),
            });
        }
        if path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(StorageError::InvalidUrl {
                url: url.to_string(),
                reason: "path must not contain '..'".to_string(),
            });
        }
        if !self.allowed_dirs.is_empty() && !self.allowed_dirs.iter().any(|d| path.starts_with(d)) {
            return Err(StorageError::Forbidden { path });
        }
        Ok(path)
    }
}

async fn copy_file(from: &Path, to: &Path) -> Result<u64, StorageError> {
    ensure_parent(to).await?;
    tokio::fs::copy(from, to)
        .await
        .map_err(|e| StorageError::io(from, e))
}

async fn copy_tree(from: &Path, to: &Path) -> Result<Vec<(PathBuf, u64)>, StorageError> {
    let metadata = tokio::fs::metadata(from)
        .await
        .map_err(|e| StorageError::io(from, e))?;
    if !metadata.is_dir() {
        return Err(StorageError::Transfer {
            url: from.display().to_string(),
            message: "not a directory".to_string(),
        });
    }
    let tree = walk_tree(from).await?;
    tokio::fs::create_dir_all(to)
        .await
        .map_err(|e| StorageError::io(to, e))?;
    for relative in &tree.empty_dirs {
        let dir = to.join(relative);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;
    }
    let mut copied = Vec::new();
    for relative in tree.files {
        let size = copy_file(&from.join(&relative), &to.join(&relative)).await?;
        copied.push((relative, size));
    }
    Ok(copied)
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    fn supports(&self, url: &str) -> bool {
        url.starts_with(PREFIX)
    }

    async fn get(&self, url: &str, path: &Path, file_type: FileType) -> Result<(), StorageError> {
        let source = self.resolve(url)?;
        match file_type {
            FileType::File => copy_file(&source, path).await.map(|_| ()),
            FileType::Directory => {
                download_directory(path, |partial| async move {
                    copy_tree(&source, &partial).await.map(|_| ())
                })
                .await
            }
        }
    }

    async fn put(
        &self,
        url: &str,
        path: &Path,
        file_type: FileType,
    ) -> Result<Vec<OutputFileLog>, StorageError> {
        let dest = self.resolve(url)?;
        match file_type {
            FileType::File => {
                let size_bytes = copy_file(path, &dest).await?;
                Ok(vec![OutputFileLog {
                    url: url.to_string(),
                    path: path.display().to_string(),
                    size_bytes,
                }])
            }
            FileType::Directory => {
                let copied = copy_tree(path, &dest).await?;
                Ok(copied
                    .into_iter()
                    .map(|(relative, size_bytes)| OutputFileLog {
                        url: join_url(url, &relative),
                        path: path.join(&relative).display().to_string(),
                        size_bytes,
                    })
                    .collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &Path) -> String {
        format!("file://{}", path.display())
    }

    #[tokio::test]
    async fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        tokio::fs::write(&src, "hello").await.unwrap();
        let storage = LocalStorage::new();

        let stored = dir.path().join("store/copy.txt");
        let logs = storage.put(&url(&stored), &src, FileType::File).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].size_bytes, 5);

        let back = dir.path().join("back/out.txt");
        storage.get(&url(&stored), &back, FileType::File).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&back).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn directory_round_trip_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tree");
        tokio::fs::create_dir_all(src.join("nested/deeper")).await.unwrap();
        tokio::fs::write(src.join("a.txt"), b"alpha").await.unwrap();
        tokio::fs::write(src.join("nested/b.bin"), [0u8, 1, 2, 255]).await.unwrap();
        tokio::fs::write(src.join("nested/deeper/c.txt"), b"").await.unwrap();
        let storage = LocalStorage::new();

        let stored = dir.path().join("stored");
        let logs = storage
            .put(&url(&stored), &src, FileType::Directory)
            .await
            .unwrap();
        assert_eq!(logs.len(), 3);
        assert!(logs.iter().any(|l| l.url.ends_with("/nested/b.bin") && l.size_bytes == 4));

        let back = dir.path().join("back");
        storage
            .get(&url(&stored), &back, FileType::Directory)
            .await
            .unwrap();

        for relative in ["a.txt", "nested/b.bin", "nested/deeper/c.txt"] {
            let original = tokio::fs::read(src.join(relative)).await.unwrap();
            let copy = tokio::fs::read(back.join(relative)).await.unwrap();
            assert_eq!(original, copy, "{relative}");
        }
    }

    #[tokio::test]
    async fn empty_directories_survive_a_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new();

        let empty = dir.path().join("empty");
        tokio::fs::create_dir_all(&empty).await.unwrap();
        let stored = dir.path().join("stored-empty");
        let logs = storage
            .put(&url(&stored), &empty, FileType::Directory)
            .await
            .unwrap();
        assert!(logs.is_empty());
        let back = dir.path().join("back-empty");
        storage
            .get(&url(&stored), &back, FileType::Directory)
            .await
            .unwrap();
        assert!(back.is_dir());

        let src = dir.path().join("tree");
        tokio::fs::create_dir_all(src.join("sub/inner")).await.unwrap();
        tokio::fs::write(src.join("f.txt"), "x").await.unwrap();
        let stored = dir.path().join("stored-tree");
        storage
            .put(&url(&stored), &src, FileType::Directory)
            .await
            .unwrap();
        let back = dir.path().join("back-tree");
        storage
            .get(&url(&stored), &back, FileType::Directory)
            .await
            .unwrap();
        assert!(back.join("sub/inner").is_dir());
        assert_eq!(std::fs::read_to_string(back.join("f.txt")).unwrap(), "x");
    }

    #[tokio::test]
    async fn missing_source_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new();
        let err = storage
            .get(
                &url(&dir.path().join("missing")),
                &dir.path().join("out"),
                FileType::File,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn allowed_dirs_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let allowed = dir.path().join("allowed");
        let storage = LocalStorage::with_allowed_dirs(vec![allowed.clone()]).unwrap();

        let err = storage
            .get("file:///etc/passwd", &dir.path().join("x"), FileType::File)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Forbidden { .. }));

        let err = storage
            .get(
                &format!("file://{}/../escape", allowed.display()),
                &dir.path().join("x"),
                FileType::File,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidUrl { .. }));
    }

    #[test]
    fn relative_allowed_dir_is_rejected() {
        let err = LocalStorage::with_allowed_dirs(vec![PathBuf::from("rel")]).unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }
}
