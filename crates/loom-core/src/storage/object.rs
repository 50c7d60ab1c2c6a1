//! Transfer code shared by the object-store backends (S3, generic S3, GCS).

use std::path::Path;

use bytes::Bytes;
use futures::TryStreamExt;
use futures::future::try_join_all;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{StorageError, download_directory, ensure_parent, join_url, partial_path, walk_tree};
use crate::domain::{FileType, OutputFileLog};

/// Empty object standing in for an empty directory, which object stores
/// cannot represent on their own.
const DIR_MARKER: &str = ".loom-dir";

/// Files above this size are uploaded in parts of this size.
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Parts uploaded concurrently for one file.
const PART_CONCURRENCY: usize = 4;

/// `<scheme>bucket/key` split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BucketUrl {
    pub bucket: String,
    pub key: String,
}

impl BucketUrl {
    pub fn parse(url: &str, scheme: &str) -> Result<Self, StorageError> {
        let invalid = |reason: &str| StorageError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };
        let rest = url
            .strip_prefix(scheme)
            .ok_or_else(|| invalid(&format!("expected {scheme}")))?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(invalid("missing bucket"));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.trim_end_matches('/').to_string(),
        })
    }
}

fn transfer_error(url: &str, err: object_store::Error) -> StorageError {
    match err {
        object_store::Error::NotFound { .. } => StorageError::NotFound(url.to_string()),
        other => StorageError::Transfer {
            url: url.to_string(),
            message: other.to_string(),
        },
    }
}

fn child_key(key: &str, relative: &Path) -> String {
    if key.is_empty() {
        join_url("", relative).trim_start_matches('/').to_string()
    } else {
        join_url(key, relative)
    }
}

/// Streams one object to `dest` through a partial file, so a failed
/// transfer never leaves a truncated file under the final name.
async fn download_object(
    store: &dyn ObjectStore,
    url: &str,
    location: &ObjectPath,
    dest: &Path,
) -> Result<(), StorageError> {
    let mut chunks = store
        .get(location)
        .await
        .map_err(|e| transfer_error(url, e))?
        .into_stream();
    ensure_parent(dest).await?;
    let partial = partial_path(dest);
    let mut file = tokio::fs::File::create(&partial)
        .await
        .map_err(|e| StorageError::io(&partial, e))?;
    let written = async {
        while let Some(chunk) = chunks.try_next().await.map_err(|e| transfer_error(url, e))? {
            file.write_all(&chunk)
                .await
                .map_err(|e| StorageError::io(&partial, e))?;
        }
        file.flush().await.map_err(|e| StorageError::io(&partial, e))
    }
    .await;
    if let Err(err) = written {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(err);
    }
    tokio::fs::rename(&partial, dest)
        .await
        .map_err(|e| StorageError::io(dest, e))
}

async fn upload_file(
    store: &dyn ObjectStore,
    url: &str,
    key: &str,
    source: &Path,
    part_size: usize,
) -> Result<OutputFileLog, StorageError> {
    let mut file = tokio::fs::File::open(source)
        .await
        .map_err(|e| StorageError::io(source, e))?;
    let size_bytes = file
        .metadata()
        .await
        .map_err(|e| StorageError::io(source, e))?
        .len();
    let location = ObjectPath::from(key);

    if size_bytes <= part_size as u64 {
        let mut data = Vec::with_capacity(size_bytes as usize);
        file.read_to_end(&mut data)
            .await
            .map_err(|e| StorageError::io(source, e))?;
        store
            .put(&location, PutPayload::from(Bytes::from(data)))
            .await
            .map_err(|e| transfer_error(url, e))?;
    } else {
        let upload = store
            .put_multipart(&location)
            .await
            .map_err(|e| transfer_error(url, e))?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, part_size);
        if let Err(err) = stream_parts(&mut file, &mut writer, url, source, part_size).await {
            let _ = writer.abort().await;
            return Err(err);
        }
        writer.finish().await.map_err(|e| transfer_error(url, e))?;
    }

    Ok(OutputFileLog {
        url: url.to_string(),
        path: source.display().to_string(),
        size_bytes,
    })
}

async fn stream_parts(
    file: &mut tokio::fs::File,
    writer: &mut WriteMultipart,
    url: &str,
    source: &Path,
    part_size: usize,
) -> Result<(), StorageError> {
    let mut buf = vec![0u8; part_size];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| StorageError::io(source, e))?;
        if n == 0 {
            return Ok(());
        }
        writer
            .wait_for_capacity(PART_CONCURRENCY)
            .await
            .map_err(|e| transfer_error(url, e))?;
        writer.write(&buf[..n]);
    }
}

pub(crate) async fn get(
    store: &dyn ObjectStore,
    url: &str,
    key: &str,
    path: &Path,
    file_type: FileType,
) -> Result<(), StorageError> {
    match file_type {
        FileType::File => download_object(store, url, &ObjectPath::from(key), path).await,
        FileType::Directory => {
            let prefix = ObjectPath::from(key);
            let objects: Vec<_> = store
                .list(if key.is_empty() { None } else { Some(&prefix) })
                .try_collect()
                .await
                .map_err(|e| transfer_error(url, e))?;
            if objects.is_empty() {
                return Err(StorageError::NotFound(url.to_string()));
            }

            download_directory(path, |partial| async move {
                let prefix: &str = prefix.as_ref();
                let mut downloads = Vec::new();
                for meta in &objects {
                    let location: &str = meta.location.as_ref();
                    let Some(relative) = location.strip_prefix(prefix) else {
                        continue;
                    };
                    let relative = relative.trim_start_matches('/');
                    if relative.is_empty() {
                        continue;
                    }
                    let dest = partial.join(relative);
                    if dest.file_name().is_some_and(|name| name == DIR_MARKER) {
                        if let Some(dir) = dest.parent() {
                            tokio::fs::create_dir_all(dir)
                                .await
                                .map_err(|e| StorageError::io(dir, e))?;
                        }
                        continue;
                    }
                    downloads.push(async move {
                        download_object(store, url, &meta.location, &dest).await
                    });
                }
                try_join_all(downloads).await.map(|_| ())
            })
            .await
        }
    }
}

pub(crate) async fn put(
    store: &dyn ObjectStore,
    url: &str,
    key: &str,
    path: &Path,
    file_type: FileType,
) -> Result<Vec<OutputFileLog>, StorageError> {
    put_with_part_size(store, url, key, path, file_type, PART_SIZE).await
}

async fn put_with_part_size(
    store: &dyn ObjectStore,
    url: &str,
    key: &str,
    path: &Path,
    file_type: FileType,
    part_size: usize,
) -> Result<Vec<OutputFileLog>, StorageError> {
    match file_type {
        FileType::File => Ok(vec![upload_file(store, url, key, path, part_size).await?]),
        FileType::Directory => {
            let tree = walk_tree(path).await?;
            let markers = tree.empty_dirs.iter().map(|relative| {
                let marker_key = child_key(key, &relative.join(DIR_MARKER));
                async move {
                    store
                        .put(&ObjectPath::from(marker_key), PutPayload::new())
                        .await
                        .map_err(|e| transfer_error(url, e))
                }
            });
            try_join_all(markers).await?;

            let uploads = tree.files.iter().map(|relative| {
                let file_url = join_url(url, relative);
                let file_key = child_key(key, relative);
                let source = path.join(relative);
                async move { upload_file(store, &file_url, &file_key, &source, part_size).await }
            });
            try_join_all(uploads).await
        }
    }
}
