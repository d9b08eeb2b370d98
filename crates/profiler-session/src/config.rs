//! Session configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ProfilerError, Result};

/// Environment variable naming a runner executable to use instead of the cache
pub const RUNNER_PATH_ENV: &str = "MEMSNAP_RUNNER_PATH";
/// Environment variable naming the directory workspaces are saved to
pub const SAVE_DIR_ENV: &str = "MEMSNAP_SAVE_DIR";
/// Environment variable naming the runner's log file
pub const LOG_FILE_ENV: &str = "MEMSNAP_LOG_FILE";
/// Environment flag enabling workspace overwrite
pub const OVERWRITE_ENV: &str = "MEMSNAP_OVERWRITE";
/// Environment flag opening the profiler UI after capture
pub const OPEN_UI_ENV: &str = "MEMSNAP_OPEN_UI";

/// Convert a millisecond timeout where a negative value means "forever"
pub fn timeout_from_millis(ms: i64) -> Option<Duration> {
    u64::try_from(ms).ok().map(Duration::from_millis)
}

/// Options for one attach or snapshot operation.
///
/// The workspace file and directory are mutually exclusive: setting one
/// after the other is a configuration error.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub(crate) runner_path: Option<PathBuf>,
    pub(crate) workspace_file: Option<PathBuf>,
    pub(crate) workspace_dir: Option<PathBuf>,
    pub(crate) overwrite: bool,
    pub(crate) open_ui: bool,
    pub(crate) log_file: Option<PathBuf>,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) finish_timeout: Option<Duration>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from `MEMSNAP_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new();

        if let Some(path) = env_path(RUNNER_PATH_ENV) {
            config = config.use_runner(path)?;
        }
        if let Some(dir) = env_path(SAVE_DIR_ENV) {
            config = config.save_to_dir(dir)?;
        }
        if let Some(file) = env_path(LOG_FILE_ENV) {
            config = config.use_log_file(file)?;
        }
        config.overwrite = env_flag(OVERWRITE_ENV, false);
        config.open_ui = env_flag(OPEN_UI_ENV, false);

        Ok(config)
    }

    /// Save the workspace to exactly this file
    pub fn save_to_file(mut self, path: impl Into<PathBuf>, overwrite: bool) -> Result<Self> {
        if self.workspace_dir.is_some() {
            return Err(ProfilerError::configuration(
                "save_to_file and save_to_dir are mutually exclusive",
            ));
        }
        self.workspace_file = Some(non_empty(path.into(), "workspace file")?);
        self.overwrite = overwrite;
        Ok(self)
    }

    /// Save the workspace under this directory with a generated name
    pub fn save_to_dir(mut self, dir: impl Into<PathBuf>) -> Result<Self> {
        if self.workspace_file.is_some() {
            return Err(ProfilerError::configuration(
                "save_to_file and save_to_dir are mutually exclusive",
            ));
        }
        self.workspace_dir = Some(non_empty(dir.into(), "workspace directory")?);
        Ok(self)
    }

    /// Open the profiler UI once the workspace is written
    pub fn open_ui(mut self) -> Self {
        self.open_ui = true;
        self
    }

    /// Run this executable instead of the cached runner
    pub fn use_runner(mut self, path: impl Into<PathBuf>) -> Result<Self> {
        self.runner_path = Some(non_empty(path.into(), "runner path")?);
        Ok(self)
    }

    /// Ask the runner to write a trace log to this file
    pub fn use_log_file(mut self, path: impl Into<PathBuf>) -> Result<Self> {
        self.log_file = Some(non_empty(path.into(), "log file")?);
        Ok(self)
    }

    /// Bound the wait for the runner's connection event
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bound the wait for the runner to exit
    pub fn with_finish_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.finish_timeout = timeout;
        self
    }

    pub fn runner_path(&self) -> Option<&Path> {
        self.runner_path.as_deref()
    }

    pub fn workspace_file(&self) -> Option<&Path> {
        self.workspace_file.as_deref()
    }

    pub fn workspace_dir(&self) -> Option<&Path> {
        self.workspace_dir.as_deref()
    }

    pub fn overwrite(&self) -> bool {
        self.overwrite
    }

    pub fn opens_ui(&self) -> bool {
        self.open_ui
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    pub fn finish_timeout(&self) -> Option<Duration> {
        self.finish_timeout
    }
}

fn non_empty(path: PathBuf, what: &str) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(ProfilerError::configuration(format!("{what} must not be empty")));
    }
    Ok(path)
}

fn env_path(name: &str) -> Option<PathBuf> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => Some(PathBuf::from(raw.trim())),
        _ => None,
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => parse_flag(&raw).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
