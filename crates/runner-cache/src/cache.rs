//! Local runner cache

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::acquire::{AcquireRequest, HttpAcquirer, ProgressCallback, RunnerAcquirer};
use crate::descriptor::RunnerDescriptor;
use crate::error::{AcquisitionError, Result};

/// Environment variable overriding the default cache root
pub const CACHE_DIR_ENV: &str = "MEMSNAP_RUNNER_CACHE";

/// Resolves a versioned runner from disk, acquiring it when missing
#[derive(Clone)]
pub struct RunnerCache {
    descriptor: RunnerDescriptor,
    root: PathBuf,
    acquirer: Arc<dyn RunnerAcquirer>,
}

impl std::fmt::Debug for RunnerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerCache")
            .field("descriptor", &self.descriptor)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl RunnerCache {
    /// Create a cache rooted at the default location, downloading over HTTP
    pub fn new(descriptor: RunnerDescriptor) -> Self {
        Self::with_acquirer(descriptor, default_root(), Arc::new(HttpAcquirer::new()))
    }

    /// Create a cache with an explicit root and acquisition collaborator
    pub fn with_acquirer(
        descriptor: RunnerDescriptor,
        root: impl Into<PathBuf>,
        acquirer: Arc<dyn RunnerAcquirer>,
    ) -> Self {
        Self {
            descriptor,
            root: root.into(),
            acquirer,
        }
    }

    pub fn descriptor(&self) -> &RunnerDescriptor {
        &self.descriptor
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Look for an already cached runner.
    ///
    /// Only touches the local filesystem. A missing or empty executable
    /// yields `Ok(None)`; other I/O failures are returned as errors.
    pub fn try_get_runner(&self, path_hint: Option<&Path>) -> Result<Option<PathBuf>> {
        let root = path_hint.unwrap_or(&self.root);
        let path = self.descriptor.executable_path(root);

        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(Some(path)),
            Ok(_) => {
                debug!("Ignoring unusable runner at {:?}", path);
                Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AcquisitionError::Io(e)),
        }
    }

    /// Make sure the runner is available and return its path.
    ///
    /// Returns immediately without network access when the runner is cached.
    pub async fn ensure(
        &self,
        url: &str,
        path_hint: Option<&Path>,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        if let Some(path) = self.try_get_runner(path_hint)? {
            debug!("Runner already cached at {:?}", path);
            if let Some(progress) = &progress {
                progress(100.0);
            }
            return Ok(path);
        }

        if cancel.is_cancelled() {
            return Err(AcquisitionError::Cancelled);
        }

        if url.trim().is_empty() {
            return Err(AcquisitionError::download_failed(
                url,
                "runner is not cached and no download url is configured",
            ));
        }

        let root = path_hint.unwrap_or(&self.root);
        let request = AcquireRequest {
            url: url.to_string(),
            descriptor: self.descriptor,
            destination: self.descriptor.executable_path(root),
        };

        info!(
            "Runner {} {} not cached under {:?}, acquiring",
            self.descriptor.name, self.descriptor.version, root
        );
        self.acquirer.acquire(&request, progress, cancel).await
    }
}

/// Default cache root: `$MEMSNAP_RUNNER_CACHE` or `<temp>/memsnap/runners`
pub fn default_root() -> PathBuf {
    match std::env::var(CACHE_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir().join("memsnap").join("runners"),
    }
}
