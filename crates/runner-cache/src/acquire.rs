//! Runner acquisition collaborators

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::descriptor::RunnerDescriptor;
use crate::error::{AcquisitionError, Result};

/// Progress sink receiving a completion percentage in `0.0..=100.0`
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// What to fetch and where to put it
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    /// Base url the runner is published under
    pub url: String,
    /// The runner build to fetch
    pub descriptor: RunnerDescriptor,
    /// Final location of the executable
    pub destination: PathBuf,
}

/// Fetches a runner that is not yet in the local cache.
///
/// Implementations must stop promptly once `cancel` fires and report
/// [`AcquisitionError::Cancelled`].
#[async_trait]
pub trait RunnerAcquirer: Send + Sync {
    async fn acquire(
        &self,
        request: &AcquireRequest,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>;
}

/// Downloads the runner executable over HTTP
pub struct HttpAcquirer {
    client: Client,
}

impl Default for HttpAcquirer {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpAcquirer {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn download_to(
        &self,
        url: &str,
        partial: &Path,
        estimated_size: u64,
        progress: Option<&ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AcquisitionError::Cancelled),
            res = self.client.get(url).send() => {
                res.map_err(|e| AcquisitionError::download_failed_with_source(url, e))?
            }
        };

        if !response.status().is_success() {
            return Err(AcquisitionError::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let total = response.content_length().unwrap_or(estimated_size).max(1);
        let mut file = tokio::fs::File::create(partial).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AcquisitionError::Cancelled),
                next = stream.next() => next,
            };

            let Some(item) = next else {
                break;
            };
            let chunk: Bytes =
                item.map_err(|e| AcquisitionError::download_failed_with_source(url, e))?;
            file.write_all(&chunk).await?;
            downloaded = downloaded.saturating_add(chunk.len() as u64);

            if let Some(progress) = progress {
                progress(percent(downloaded, total));
            }
        }

        file.flush().await?;
        Ok(downloaded)
    }
}

#[async_trait]
impl RunnerAcquirer for HttpAcquirer {
    async fn acquire(
        &self,
        request: &AcquireRequest,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let url = format!(
            "{}/{}",
            request.url.trim_end_matches('/'),
            request.descriptor.download_path()
        );
        let destination = &request.destination;

        info!(
            "Downloading runner {} {} from {}",
            request.descriptor.name, request.descriptor.version, url
        );

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let partial = PathBuf::from(format!("{}.partial", destination.display()));
        let result = self
            .download_to(
                &url,
                &partial,
                request.descriptor.estimated_size,
                progress.as_ref(),
                cancel,
            )
            .await;

        let downloaded = match result {
            Ok(0) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(AcquisitionError::InvalidRunner {
                    path: destination.clone(),
                    reason: "downloaded file is empty".to_string(),
                });
            }
            Ok(n) => n,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                    debug!("No partial download to clean up at {:?}: {}", partial, cleanup);
                }
                if e.is_cancelled() {
                    warn!("Runner download cancelled");
                }
                return Err(e);
            }
        };

        make_executable(&partial).await?;
        tokio::fs::rename(&partial, destination).await?;

        if let Some(progress) = &progress {
            progress(100.0);
        }
        info!("Runner downloaded to {:?} ({} bytes)", destination, downloaded);

        Ok(destination.clone())
    }
}

fn percent(done: u64, total: u64) -> f64 {
    ((done as f64 / total as f64) * 100.0).min(100.0)
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DOTMEMORY_CONSOLE;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    const TOOL: RunnerDescriptor = RunnerDescriptor {
        name: "tool",
        version: "1.0.0",
        estimated_size: 1_000_000,
        executable: "runner.sh",
    };

    /// Answer one request with a fixed response; returns the base url
    async fn serve_once(response: Vec<u8>, hold_open: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(&response).await.unwrap();
            socket.flush().await.unwrap();
            if hold_open {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });

        format!("http://{addr}")
    }

    fn response(status: &str, content_length: usize, body: &[u8]) -> Vec<u8> {
        let mut bytes = format!(
            "HTTP/1.1 {status}\r\nContent-Length: {content_length}\r\nConnection: close\r\n\r\n"
        )
        .into_bytes();
        bytes.extend_from_slice(body);
        bytes
    }

    fn acquirer() -> HttpAcquirer {
        HttpAcquirer::with_client(Client::builder().no_proxy().build().unwrap())
    }

    fn request(url: String, dir: &tempfile::TempDir) -> AcquireRequest {
        AcquireRequest {
            url,
            descriptor: TOOL,
            destination: TOOL.executable_path(dir.path()),
        }
    }

    fn partial_of(path: &Path) -> PathBuf {
        PathBuf::from(format!("{}.partial", path.display()))
    }

    #[tokio::test]
    async fn test_http_acquire_downloads_into_place() {
        let dir = tempfile::TempDir::new().unwrap();
        let body = b"#!/bin/sh\necho runner\n";
        let url = serve_once(response("200 OK", body.len(), body), false).await;
        let request = request(url, &dir);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: ProgressCallback = Arc::new(move |p| sink.lock().unwrap().push(p));

        let path = acquirer()
            .acquire(&request, Some(progress), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(path, request.destination);
        assert_eq!(std::fs::read(&path).unwrap(), body);
        assert!(!partial_of(&path).exists());

        // Chunk progress is measured against the content length, not the
        // much larger estimate, so it reaches 100 before the final report.
        let seen = seen.lock().unwrap();
        assert!(seen.len() >= 2);
        assert!(seen.iter().all(|p| (0.0..=100.0).contains(p)));
        assert_eq!(seen[seen.len() - 2], 100.0);
        assert_eq!(seen[seen.len() - 1], 100.0);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[tokio::test]
    async fn test_http_acquire_rejects_empty_body() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = serve_once(response("200 OK", 0, b""), false).await;
        let request = request(url, &dir);

        let err = acquirer()
            .acquire(&request, None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AcquisitionError::InvalidRunner { .. }));
        assert!(!request.destination.exists());
        assert!(!partial_of(&request.destination).exists());
    }

    #[tokio::test]
    async fn test_http_acquire_maps_error_status() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = serve_once(response("404 Not Found", 9, b"not found"), false).await;
        let request = request(url, &dir);

        let err = acquirer()
            .acquire(&request, None, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            AcquisitionError::HttpStatus { url, status } => {
                assert_eq!(status, 404);
                assert!(url.ends_with("/tool/1.0.0/runner.sh"));
            }
            other => panic!("expected http status error, got {other:?}"),
        }
        assert!(!request.destination.exists());
        assert!(!partial_of(&request.destination).exists());
    }

    #[tokio::test]
    async fn test_http_acquire_cancelled_mid_stream() {
        let dir = tempfile::TempDir::new().unwrap();
        // Promises more bytes than it sends, then stalls.
        let url = serve_once(response("200 OK", 1000, b"#!/bin/sh\n"), true).await;
        let request = request(url, &dir);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let err = acquirer()
            .acquire(&request, None, &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(!request.destination.exists());
        assert!(!partial_of(&request.destination).exists());
    }

    #[test]
    fn test_percent_is_clamped() {
        assert_eq!(percent(50, 100), 50.0);
        assert_eq!(percent(300, 100), 100.0);
        assert_eq!(percent(0, 100), 0.0);
    }

    #[tokio::test]
    async fn test_http_acquire_honours_cancelled_token() {
        let dir = tempfile::TempDir::new().unwrap();
        let request = AcquireRequest {
            // Never contacted: the token is already cancelled.
            url: "http://127.0.0.1:9".to_string(),
            descriptor: DOTMEMORY_CONSOLE,
            destination: DOTMEMORY_CONSOLE.executable_path(dir.path()),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = HttpAcquirer::new()
            .acquire(&request, None, &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(!request.destination.exists());
    }
}
