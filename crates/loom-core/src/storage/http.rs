//! Read-only HTTP(S) storage.

use std::path::Path;

use async_trait::async_trait;

use tokio::io::AsyncWriteExt;

use super::{StorageBackend, StorageError, ensure_parent, partial_path};
use crate::domain::{FileType, OutputFileLog};

/// Downloads single files with a plain GET.
#[derive(Debug, Clone, Default)]
pub struct HttpStorage {
    client: reqwest::Client,
}

impl HttpStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StorageBackend for HttpStorage {
    fn name(&self) -> &'static str {
        "http"
    }

    fn supports(&self, url: &str) -> bool {
        url.starts_with("http://") || url.starts_with("https://")
    }

    async fn get(&self, url: &str, path: &Path, file_type: FileType) -> Result<(), StorageError> {
        if file_type == FileType::Directory {
            return Err(StorageError::UnsupportedOperation {
                backend: self.name(),
                operation: "directory download",
            });
        }
        let transfer = |message: String| StorageError::Transfer {
            url: url.to_string(),
            message,
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transfer(e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(transfer(format!("server responded {status}")));
        }
        ensure_parent(path).await?;
        let partial = partial_path(path);
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| StorageError::io(&partial, e))?;
        let written = async {
            while let Some(chunk) = response.chunk().await.map_err(|e| transfer(e.to_string()))? {
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
        tokio::fs::rename(&partial, path)
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    async fn put(
        &self,
        _url: &str,
        _path: &Path,
        _file_type: FileType,
    ) -> Result<Vec<OutputFileLog>, StorageError> {
        Err(StorageError::UnsupportedOperation {
            backend: self.name(),
            operation: "upload",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one request per connection: `/hello` returns a body, `/big`
    /// a body sent in many writes, `/truncated` closes mid-body, anything
    /// else 404.
    async fn serve() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);
                    if request.starts_with("GET /big ") {
                        let head = format!(
                            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                            64 * 1024
                        );
                        let _ = socket.write_all(head.as_bytes()).await;
                        for i in 0..64u8 {
                            let _ = socket.write_all(&[i; 1024]).await;
                            let _ = socket.flush().await;
                        }
                        let _ = socket.shutdown().await;
                        return;
                    }
                    let response = if request.starts_with("GET /hello ") {
                        "HTTP/1.1 200 OK\r\ncontent-length: 12\r\nconnection: close\r\n\r\nhello world\n"
                    } else if request.starts_with("GET /truncated ") {
                        "HTTP/1.1 200 OK\r\ncontent-length: 100\r\nconnection: close\r\n\r\nonly part"
                    } else {
                        "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                    };
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn downloads_a_single_file() {
        let base = serve().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("in/hello.txt");

        HttpStorage::new()
            .get(&format!("{base}/hello"), &dest, FileType::File)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "hello world\n");
    }

    #[tokio::test]
    async fn large_body_is_written_in_chunks() {
        let base = serve().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("big.bin");

        HttpStorage::new()
            .get(&format!("{base}/big"), &dest, FileType::File)
            .await
            .unwrap();
        let data = std::fs::read(&dest).unwrap();
        assert_eq!(data.len(), 64 * 1024);
        assert!(data[..1024].iter().all(|b| *b == 0));
        assert!(data[63 * 1024..].iter().all(|b| *b == 63));
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn truncated_body_leaves_no_file() {
        let base = serve().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("cut.txt");

        let err = HttpStorage::new()
            .get(&format!("{base}/truncated"), &dest, FileType::File)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Transfer { .. }));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let base = serve().await;
        let dir = tempfile::tempdir().unwrap();
        let err = HttpStorage::new()
            .get(&format!("{base}/nope"), &dir.path().join("x"), FileType::File)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn put_and_directory_get_are_unsupported() {
        let storage = HttpStorage::new();
        let dir = tempfile::tempdir().unwrap();

        let err = storage
            .put("http://example.com/x", dir.path(), FileType::File)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedOperation { .. }));

        let err = storage
            .get("http://example.com/x", dir.path(), FileType::Directory)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedOperation { .. }));
    }
}
