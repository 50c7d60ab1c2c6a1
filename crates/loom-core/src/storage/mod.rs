//! Storage backends: moving files and directory trees between a URL and a
//! local path.
//!
//! Backends are selected by URL prefix through a [`StorageRegistry`]. All of
//! them are stateless beyond their configuration and are shared behind `Arc`.

mod gcs;
mod http;
mod local;
mod object;
mod registry;
mod s3;

pub use gcs::GoogleStorage;
pub use http::HttpStorage;
pub use local::LocalStorage;
pub use registry::StorageRegistry;
pub use s3::{GenericS3Config, GenericS3Storage, S3Config, S3Storage};

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{FileType, OutputFileLog};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no storage backend supports url {url:?}")]
    Unsupported { url: String },

    #[error("{backend} storage does not support {operation}")]
    UnsupportedOperation {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transfer of {url} failed: {message}")]
    Transfer { url: String, message: String },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("storage configuration: {0}")]
    Config(String),

    #[error("{} is outside the allowed directories", path.display())]
    Forbidden { path: PathBuf },
}

impl StorageError {
    /// Wrap an I/O error, turning `NotFound` into [`StorageError::NotFound`].
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound(path.display().to_string())
        } else {
            StorageError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Uniform transfer interface over one storage protocol.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Does this backend handle `url`? Prefix check only, no I/O.
    fn supports(&self, url: &str) -> bool;

    /// Download `url` to `path`.
    async fn get(&self, url: &str, path: &Path, file_type: FileType) -> Result<(), StorageError>;

    /// Upload `path` to `url`, returning one entry per uploaded file.
    async fn put(
        &self,
        url: &str,
        path: &Path,
        file_type: FileType,
    ) -> Result<Vec<OutputFileLog>, StorageError>;
}

/// Contents of a directory tree, as paths relative to its root.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Tree {
    /// Regular files, sorted.
    pub files: Vec<PathBuf>,
    /// Directories with no entries at all, sorted. The root itself is listed
    /// (as an empty path) when the whole tree is empty.
    pub empty_dirs: Vec<PathBuf>,
}

pub(crate) async fn walk_tree(root: &Path) -> Result<Tree, StorageError> {
    let mut tree = Tree::default();
    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        let dir = root.join(&relative);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;
        let mut empty = true;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&dir, e))?
        {
            empty = false;
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| StorageError::io(&entry.path(), e))?;
            let child = relative.join(entry.file_name());
            if file_type.is_dir() {
                pending.push(child);
            } else if file_type.is_file() {
                tree.files.push(child);
            }
        }
        if empty {
            tree.empty_dirs.push(relative);
        }
    }
    tree.files.sort();
    tree.empty_dirs.sort();
    Ok(tree)
}

/// Join a relative local path onto a URL with `/` separators.
pub(crate) fn join_url(base: &str, relative: &Path) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    for part in relative.components() {
        url.push('/');
        url.push_str(&part.as_os_str().to_string_lossy());
    }
    url
}

/// Hidden sibling used while a download is in progress.
pub(crate) fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    dest.with_file_name(format!(".{name}.partial"))
}

pub(crate) async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io(parent, e))?;
    }
    Ok(())
}

/// Download a directory tree into a `.partial` sibling and move it into place
/// only when `fill` succeeds. On failure the partial tree is removed and
/// `dest` is left untouched.
pub(crate) async fn download_directory<F, Fut>(dest: &Path, fill: F) -> Result<(), StorageError>
where
    F: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = Result<(), StorageError>>,
{
    ensure_parent(dest).await?;
    let partial = partial_path(dest);
    if tokio::fs::try_exists(&partial).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(&partial)
            .await
            .map_err(|e| StorageError::io(&partial, e))?;
    }
    tokio::fs::create_dir_all(&partial)
        .await
        .map_err(|e| StorageError::io(&partial, e))?;

    if let Err(err) = fill(partial.clone()).await {
        let _ = tokio::fs::remove_dir_all(&partial).await;
        return Err(err);
    }

    if tokio::fs::try_exists(dest).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(dest)
            .await
            .map_err(|e| StorageError::io(dest, e))?;
    }
    tokio::fs::rename(&partial, dest)
        .await
        .map_err(|e| StorageError::io(dest, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn walk_tree_lists_files_and_empty_dirs_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("a/b")).await.unwrap();
        tokio::fs::create_dir_all(dir.path().join("a/empty")).await.unwrap();
        tokio::fs::write(dir.path().join("top.txt"), "1").await.unwrap();
        tokio::fs::write(dir.path().join("a/b/deep.txt"), "2").await.unwrap();

        let tree = walk_tree(dir.path()).await.unwrap();
        assert_eq!(
            tree.files,
            vec![PathBuf::from("a/b/deep.txt"), PathBuf::from("top.txt")]
        );
        assert_eq!(tree.empty_dirs, vec![PathBuf::from("a/empty")]);
    }

    #[tokio::test]
    async fn walk_tree_of_empty_root_lists_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let tree = walk_tree(dir.path()).await.unwrap();
        assert!(tree.files.is_empty());
        assert_eq!(tree.empty_dirs, vec![PathBuf::new()]);
    }

    #[test]
    fn join_url_uses_forward_slashes() {
        assert_eq!(
            join_url("s3://bucket/out/", Path::new("a/b.txt")),
            "s3://bucket/out/a/b.txt"
        );
    }

    #[tokio::test]
    async fn failed_directory_download_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("inputs");

        let result = download_directory(&dest, |partial| async move {
            tokio::fs::write(partial.join("half.txt"), "x").await.unwrap();
            Err(StorageError::NotFound("s3://bucket/missing".into()))
        })
        .await;

        assert!(matches!(result, Err(StorageError::NotFound(_))));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn successful_directory_download_is_moved_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("inputs");

        download_directory(&dest, |partial| async move {
            tokio::fs::write(partial.join("f.txt"), "x")
                .await
                .map_err(|e| StorageError::io(&partial, e))
        })
        .await
        .unwrap();

        assert_eq!(std::fs::read_to_string(dest.join("f.txt")).unwrap(), "x");
        assert!(!partial_path(&dest).exists());
    }
}
