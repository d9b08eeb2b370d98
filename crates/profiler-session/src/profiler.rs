//! Profiler facade - coordinates runner acquisition and the active session

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use runner_cache::{
    AcquisitionError, CancellationToken, ProgressCallback, RunnerCache, DOTMEMORY_CONSOLE,
};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{ProfilerError, Result};
use crate::process::{LaunchSpec, Subcommand};
use crate::session::Session;

/// Environment variable holding the runner download url
pub const RUNNER_URL_ENV: &str = "MEMSNAP_RUNNER_URL";

/// How long `get_snapshot_once` waits for a pending prerequisite
pub const DEFAULT_PREREQUISITE_GRACE: Duration = Duration::from_millis(500);

type SharedAcquisition =
    Shared<BoxFuture<'static, std::result::Result<PathBuf, Arc<AcquisitionError>>>>;

/// Options for a [`Profiler`] instance
#[derive(Debug, Clone)]
pub struct ProfilerOptions {
    /// Base url the runner is downloaded from when it is not cached
    pub download_url: String,
    /// Cache root override; `None` uses the runner cache default
    pub cache_dir: Option<PathBuf>,
    /// Bounded wait for the prerequisite in `get_snapshot_once`
    pub prerequisite_grace: Duration,
}

impl Default for ProfilerOptions {
    fn default() -> Self {
        Self {
            download_url: String::new(),
            cache_dir: None,
            prerequisite_grace: DEFAULT_PREREQUISITE_GRACE,
        }
    }
}

impl ProfilerOptions {
    /// Read the download url from `MEMSNAP_RUNNER_URL`
    pub fn from_env() -> Self {
        Self {
            download_url: std::env::var(RUNNER_URL_ENV).unwrap_or_default(),
            ..Self::default()
        }
    }
}

/// Handle on the single in-flight runner acquisition
#[derive(Clone)]
pub struct PrerequisiteTask {
    inner: SharedAcquisition,
}

impl PrerequisiteTask {
    /// Wait for the acquisition to finish
    pub async fn wait(self) -> Result<PathBuf> {
        self.inner.await.map_err(ProfilerError::Acquisition)
    }

    /// The outcome, if the acquisition has already finished
    pub fn try_result(&self) -> Option<Result<PathBuf>> {
        self.inner
            .clone()
            .now_or_never()
            .map(|r| r.map_err(ProfilerError::Acquisition))
    }
}

#[derive(Clone)]
struct ActiveSession {
    session: Arc<tokio::sync::Mutex<Session>>,
    finish_timeout: Option<Duration>,
}

enum SessionSlot {
    Empty,
    /// An operation is launching or tearing down a session
    Busy,
    Active(ActiveSession),
}

struct State {
    acquisition: Option<SharedAcquisition>,
    slot: SessionSlot,
}

/// Attaches the memory profiler runner to the current process.
///
/// At most one acquisition and one session exist per instance. Operations
/// that find the session slot in the wrong state fail immediately.
pub struct Profiler {
    cache: RunnerCache,
    options: ProfilerOptions,
    state: Mutex<State>,
}

impl Profiler {
    pub fn new(options: ProfilerOptions) -> Self {
        Self::with_cache(RunnerCache::new(DOTMEMORY_CONSOLE), options)
    }

    pub fn with_cache(cache: RunnerCache, options: ProfilerOptions) -> Self {
        Self {
            cache,
            options,
            state: Mutex::new(State {
                acquisition: None,
                slot: SessionSlot::Empty,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a session is attached
    pub fn is_active(&self) -> bool {
        matches!(self.lock().slot, SessionSlot::Active(_))
    }

    /// Start acquiring the runner, or join the acquisition already running.
    ///
    /// A pending or successful acquisition is reused; the arguments of the
    /// call that started it stay authoritative. A failed or cancelled one is
    /// replaced by a fresh attempt.
    pub fn start_prerequisite(
        &self,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> PrerequisiteTask {
        let mut state = self.lock();

        if let Some(existing) = &state.acquisition {
            let failed = matches!(existing.clone().now_or_never(), Some(Err(_)));
            if !failed {
                return PrerequisiteTask {
                    inner: existing.clone(),
                };
            }
            info!("Previous runner acquisition failed, starting a new one");
        }

        let cache = self.cache.clone();
        let url = self.options.download_url.clone();
        let hint = self.options.cache_dir.clone();
        let job = tokio::spawn(async move {
            cache
                .ensure(&url, hint.as_deref(), progress, &cancel)
                .await
        });

        let inner = async move {
            match job.await {
                Ok(result) => result.map_err(Arc::new),
                Err(e) if e.is_cancelled() => Err(Arc::new(AcquisitionError::Cancelled)),
                Err(e) => Err(Arc::new(AcquisitionError::Io(std::io::Error::other(
                    e.to_string(),
                )))),
            }
        }
        .boxed()
        .shared();

        state.acquisition = Some(inner.clone());
        PrerequisiteTask { inner }
    }

    /// Make sure the runner is available, downloading it if needed
    pub async fn ensure_prerequisite(
        &self,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> Result<PathBuf> {
        self.start_prerequisite(progress, cancel).wait().await
    }

    /// Resolve the runner for a launch, waiting at most `grace`
    async fn runner_path(&self, config: &Config, grace: Duration) -> Result<PathBuf> {
        if let Some(path) = config.runner_path() {
            return Ok(path.to_path_buf());
        }

        let task = self.lock().acquisition.clone().ok_or_else(|| {
            ProfilerError::state("The runner is not available: call ensure_prerequisite first")
        })?;

        let outcome = if grace.is_zero() {
            task.now_or_never()
        } else {
            tokio::time::timeout(grace, task).await.ok()
        };

        match outcome {
            Some(Ok(path)) => Ok(path),
            Some(Err(e)) => Err(ProfilerError::Acquisition(e)),
            None => Err(ProfilerError::state(
                "The runner is not ready yet: ensure_prerequisite has not completed",
            )),
        }
    }

    /// Claim the empty slot for the duration of an operation
    fn reserve(&self, busy_message: &str) -> Result<SlotReservation<'_>> {
        let mut state = self.lock();
        if !matches!(state.slot, SessionSlot::Empty) {
            return Err(ProfilerError::state(busy_message));
        }
        state.slot = SessionSlot::Busy;
        Ok(SlotReservation {
            profiler: self,
            armed: true,
        })
    }

    /// Capture one snapshot without keeping a session; returns the workspace path
    pub async fn get_snapshot_once(&self, config: &Config) -> Result<PathBuf> {
        let _reservation =
            self.reserve("The profiling session is active already: attach() was called early")?;
        let runner = self
            .runner_path(config, self.options.prerequisite_grace)
            .await?;

        let spec = LaunchSpec::for_current_process(runner, Subcommand::GetSnapshot, config);
        let mut session = Session::launch(&spec)?;
        session.await_finished(config.finish_timeout()).await?;

        info!("Snapshot written to {:?}", session.workspace_file());
        Ok(session.workspace_file().to_path_buf())
    }

    /// Attach the runner and keep the session active until [`detach`](Self::detach)
    pub async fn attach(&self, config: &Config) -> Result<()> {
        let reservation =
            self.reserve("The profiling session is active still: forgot to call detach()?")?;
        let runner = self.runner_path(config, Duration::ZERO).await?;

        let spec = LaunchSpec::for_current_process(runner, Subcommand::Attach, config);
        let mut session = Session::launch(&spec)?;
        session.await_connected(config.connect_timeout()).await?;

        info!("Profiler attached, session {}", session.id);
        reservation.activate(ActiveSession {
            session: Arc::new(tokio::sync::Mutex::new(session)),
            finish_timeout: config.finish_timeout(),
        });
        Ok(())
    }

    /// Request a snapshot from the active session without waiting for it
    pub async fn get_snapshot(&self, name: Option<&str>) -> Result<()> {
        let active = match &self.lock().slot {
            SessionSlot::Active(active) => active.clone(),
            _ => return Err(ProfilerError::state("There is no active profiling session")),
        };

        let mut session = active.session.lock().await;
        session.get_snapshot(name).await
    }

    /// Detach the runner and return the workspace path.
    ///
    /// The session slot is cleared whether or not the runner finishes cleanly.
    pub async fn detach(&self) -> Result<PathBuf> {
        let active = {
            let mut state = self.lock();
            match std::mem::replace(&mut state.slot, SessionSlot::Busy) {
                SessionSlot::Active(active) => active,
                other => {
                    state.slot = other;
                    return Err(ProfilerError::state("There is no active profiling session"));
                }
            }
        };
        let _release = SlotReservation {
            profiler: self,
            armed: true,
        };

        let mut session = active.session.lock().await;
        let result = async {
            if let Err(e) = session.disconnect().await {
                if session.is_running() {
                    return Err(e);
                }
                // Report how the runner ended rather than the failed write.
                warn!("Runner of session {} exited before detach: {}", session.id, e);
            }
            session.await_finished(active.finish_timeout).await
        }
        .await;

        match result {
            Ok(()) => {
                info!("Profiler detached, workspace {:?}", session.workspace_file());
                Ok(session.workspace_file().to_path_buf())
            }
            Err(e) => {
                warn!("Detach of session {} failed: {}", session.id, e);
                Err(e)
            }
        }
    }
}

/// Resets the slot to empty unless a session was activated
struct SlotReservation<'a> {
    profiler: &'a Profiler,
    armed: bool,
}

impl SlotReservation<'_> {
    fn activate(mut self, active: ActiveSession) {
        self.armed = false;
        self.profiler.lock().slot = SessionSlot::Active(active);
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.profiler.lock().slot = SessionSlot::Empty;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use runner_cache::{AcquireRequest, RunnerAcquirer, RunnerDescriptor};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const TOOL: RunnerDescriptor = RunnerDescriptor {
        name: "tool",
        version: "1.0.0",
        estimated_size: 4,
        executable: "runner.sh",
    };

    /// Slow acquirer that can be told to fail its first attempt
    #[derive(Default)]
    struct CountingAcquirer {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl RunnerAcquirer for CountingAcquirer {
        async fn acquire(
            &self,
            request: &AcquireRequest,
            _progress: Option<ProgressCallback>,
            cancel: &CancellationToken,
        ) -> runner_cache::Result<PathBuf> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = cancel.cancelled() => return Err(AcquisitionError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
            if self.fail_first && call == 0 {
                return Err(AcquisitionError::download_failed(&request.url, "boom"));
            }
            if let Some(parent) = request.destination.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&request.destination, b"#!/bin/sh\n").await?;
            Ok(request.destination.clone())
        }
    }

    fn profiler(dir: &TempDir, acquirer: Arc<CountingAcquirer>) -> Profiler {
        let cache = RunnerCache::with_acquirer(TOOL, dir.path(), acquirer);
        let options = ProfilerOptions {
            download_url: "http://runner.invalid".to_string(),
            ..ProfilerOptions::default()
        };
        Profiler::with_cache(cache, options)
    }

    #[tokio::test]
    async fn test_concurrent_prerequisite_is_single_flight() {
        let dir = TempDir::new().unwrap();
        let acquirer = Arc::new(CountingAcquirer::default());
        let profiler = profiler(&dir, acquirer.clone());

        let (a, b) = tokio::join!(
            profiler.ensure_prerequisite(None, CancellationToken::new()),
            profiler.ensure_prerequisite(None, CancellationToken::new()),
        );

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(acquirer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completed_prerequisite_is_reused() {
        let dir = TempDir::new().unwrap();
        let acquirer = Arc::new(CountingAcquirer::default());
        let profiler = profiler(&dir, acquirer.clone());

        let first = profiler
            .ensure_prerequisite(None, CancellationToken::new())
            .await
            .unwrap();
        let second = profiler
            .ensure_prerequisite(None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(acquirer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_prerequisite_is_replaced() {
        let dir = TempDir::new().unwrap();
        let acquirer = Arc::new(CountingAcquirer {
            fail_first: true,
            ..CountingAcquirer::default()
        });
        let profiler = profiler(&dir, acquirer.clone());

        let err = profiler
            .ensure_prerequisite(None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProfilerError::Acquisition(_)));

        profiler
            .ensure_prerequisite(None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(acquirer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_prerequisite() {
        let dir = TempDir::new().unwrap();
        let acquirer = Arc::new(CountingAcquirer::default());
        let profiler = profiler(&dir, acquirer.clone());
        let cancel = CancellationToken::new();

        let task = profiler.start_prerequisite(None, cancel.clone());
        cancel.cancel();
        let err = task.wait().await.unwrap_err();
        assert!(err.is_cancelled());

        // A cancelled attempt does not block the next one.
        let path = profiler
            .ensure_prerequisite(None, CancellationToken::new())
            .await
            .unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_pending_prerequisite_has_no_result() {
        let dir = TempDir::new().unwrap();
        let profiler = profiler(&dir, Arc::new(CountingAcquirer::default()));

        let task = profiler.start_prerequisite(None, CancellationToken::new());
        assert!(task.try_result().is_none());
        task.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_requires_prerequisite() {
        let dir = TempDir::new().unwrap();
        let profiler = profiler(&dir, Arc::new(CountingAcquirer::default()));

        let err = profiler.attach(&Config::new()).await.unwrap_err();
        assert!(matches!(err, ProfilerError::State { .. }));
        assert!(!profiler.is_active());
    }

    #[tokio::test]
    async fn test_attach_rejects_pending_prerequisite() {
        let dir = TempDir::new().unwrap();
        let profiler = profiler(&dir, Arc::new(CountingAcquirer::default()));

        let _task = profiler.start_prerequisite(None, CancellationToken::new());
        let err = profiler.attach(&Config::new()).await.unwrap_err();
        assert!(matches!(err, ProfilerError::State { .. }));
    }

    #[tokio::test]
    async fn test_detach_without_session() {
        let dir = TempDir::new().unwrap();
        let profiler = profiler(&dir, Arc::new(CountingAcquirer::default()));

        let err = profiler.detach().await.unwrap_err();
        assert!(matches!(err, ProfilerError::State { .. }));
        assert!(!profiler.is_active());
        assert!(matches!(profiler.lock().slot, SessionSlot::Empty));
    }

    #[tokio::test]
    async fn test_get_snapshot_without_session() {
        let dir = TempDir::new().unwrap();
        let profiler = profiler(&dir, Arc::new(CountingAcquirer::default()));

        let err = profiler.get_snapshot(Some("first")).await.unwrap_err();
        assert!(matches!(err, ProfilerError::State { .. }));
    }

    #[test]
    fn test_reservation_is_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let profiler = profiler(&dir, Arc::new(CountingAcquirer::default()));

        {
            let _reservation = profiler.reserve("busy").unwrap();
            assert!(profiler.reserve("busy").is_err());
        }
        assert!(profiler.reserve("busy").is_ok());
    }
}
