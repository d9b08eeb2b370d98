//! Runner process management

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ProfilerError, Result};
use crate::event_log::{EventLog, LineSink};

/// Extension of workspace files written by the runner
pub const WORKSPACE_EXTENSION: &str = "dmw";

/// Runner subcommands used by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Subcommand {
    /// Attach and wait for commands on stdin
    Attach,
    /// Attach, take one snapshot and exit
    GetSnapshot,
}

impl Subcommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attach => "attach",
            Self::GetSnapshot => "get-snapshot",
        }
    }
}

/// Everything needed to start the runner against a process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub runner: PathBuf,
    pub subcommand: Subcommand,
    pub pid: u32,
    pub workspace_file: PathBuf,
    pub overwrite: bool,
    pub open_ui: bool,
    pub log_file: Option<PathBuf>,
}

impl LaunchSpec {
    /// Describe a launch against the current process
    pub fn for_current_process(runner: PathBuf, subcommand: Subcommand, config: &Config) -> Self {
        Self {
            runner,
            subcommand,
            pid: std::process::id(),
            workspace_file: resolve_workspace_file(config, &current_process_name(), Local::now()),
            overwrite: config.overwrite(),
            open_ui: config.opens_ui(),
            log_file: config.log_file().map(Path::to_path_buf),
        }
    }

    /// Command line arguments, without the program itself
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            self.subcommand.as_str().into(),
            self.pid.to_string().into(),
            prefixed("-f=", &self.workspace_file),
        ];

        if self.overwrite {
            args.push("--overwrite".into());
        }
        if self.open_ui {
            args.push("--open-dotmemory".into());
        }
        if let Some(log_file) = &self.log_file {
            args.push(prefixed("--log-file=", log_file));
            args.push("--trace".into());
        }
        args.push("--service-input=stdin".into());
        args.push("--service-output=On".into());

        args
    }
}

fn prefixed(prefix: &str, path: &Path) -> OsString {
    let mut arg = OsString::from(prefix);
    arg.push(path.as_os_str());
    arg
}

/// Name used for generated workspace files
pub fn current_process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "process".to_string())
}

/// Pick the workspace path for a launch.
///
/// An explicit file wins; otherwise a timestamped name is generated in the
/// configured directory, or the temp directory when none is set.
pub fn resolve_workspace_file(config: &Config, process_name: &str, now: DateTime<Local>) -> PathBuf {
    if let Some(file) = config.workspace_file() {
        return file.to_path_buf();
    }

    let dir = config
        .workspace_dir()
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);
    dir.join(format!(
        "{}.{}.{}",
        process_name,
        now.format("%Y-%m-%dT%H-%M-%S%.3f"),
        WORKSPACE_EXTENSION
    ))
}

/// A spawned runner with its streams wired up
pub struct RunnerProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: EventLog,
    pub stderr: EventLog,
    pub readers: Vec<JoinHandle<()>>,
}

impl RunnerProcess {
    /// Spawn the runner and start draining its output
    pub fn spawn(spec: &LaunchSpec) -> Result<Self> {
        info!(
            "Spawning runner {:?} {} for pid {} -> {:?}",
            spec.runner,
            spec.subcommand.as_str(),
            spec.pid,
            spec.workspace_file
        );

        let mut cmd = Command::new(&spec.runner);
        cmd.args(spec.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        {
            #[allow(unused_imports)]
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
        }

        let mut child = cmd.spawn().map_err(|e| {
            ProfilerError::spawn_failed_with_source(
                format!("Failed to spawn {}: {}", spec.runner.display(), e),
                e,
            )
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProfilerError::spawn_failed("Failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProfilerError::spawn_failed("Failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProfilerError::spawn_failed("Failed to capture stderr"))?;

        let (stdout_log, stdout_sink) = EventLog::new();
        let (stderr_log, stderr_sink) = EventLog::new();
        let readers = vec![
            spawn_reader(stdout, stdout_sink, "stdout"),
            spawn_reader(stderr, stderr_sink, "stderr"),
        ];

        Ok(Self {
            child,
            stdin,
            stdout: stdout_log,
            stderr: stderr_log,
            readers,
        })
    }
}

fn spawn_reader<R>(stream: R, sink: LineSink, name: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!("{}: {}", name, line);
                    if !sink.append(line) {
                        debug!("Event log dropped, stopping {} reader", name);
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read runner {}: {}", name, e);
                    break;
                }
            }
        }
    })
}
