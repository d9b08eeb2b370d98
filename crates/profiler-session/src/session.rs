//! Profiling session management

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, ChildStdin};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::channel::{CommandChannel, COMMAND_TAG};
use crate::error::{CapturedOutput, ProfilerError, Result};
use crate::event_log::{EventLog, MatchOutcome};
use crate::process::{LaunchSpec, RunnerProcess};

/// How long to wait for the output readers after the runner exits
const READER_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// State of a profiling session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Runner spawned, connection not yet confirmed
    Starting,
    /// Runner reported it is attached
    Connected,
    /// Runner exited
    Finished,
}

static CONNECTED_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Pattern of the runner's connection event, e.g. `##dotMemory["connected",{...}]`
fn connected_pattern() -> Result<&'static Regex> {
    if let Some(pattern) = CONNECTED_PATTERN.get() {
        return Ok(pattern);
    }
    let pattern = Regex::new(&format!(
        r#"(?i){}\["connected"\s*,\s*(\{{.*\}})\s*\]"#,
        regex::escape(COMMAND_TAG)
    ))
    .map_err(|e| ProfilerError::configuration(format!("Invalid connection pattern: {e}")))?;
    Ok(CONNECTED_PATTERN.get_or_init(|| pattern))
}

/// The runner's connection payload, when it is valid JSON
fn parse_connection_info(line: &str) -> Option<serde_json::Value> {
    let pattern = connected_pattern().ok()?;
    let payload = pattern.captures(line)?.get(1)?.as_str();
    serde_json::from_str(payload).ok()
}

fn has_exited(child: &mut Child) -> bool {
    !matches!(child.try_wait(), Ok(None))
}

/// One supervised run of the profiler runner, from spawn to exit
pub struct Session {
    /// Unique session ID
    pub id: Uuid,
    workspace_file: PathBuf,
    state: SessionState,
    child: Child,
    commands: CommandChannel<ChildStdin>,
    stdout: EventLog,
    stderr: EventLog,
    readers: Vec<JoinHandle<()>>,
    connection_info: Option<serde_json::Value>,
    exit_code: Option<i32>,
    started_at: Instant,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("workspace_file", &self.workspace_file)
            .field("state", &self.state)
            .field("exit_code", &self.exit_code)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawn the runner described by `spec`
    pub fn launch(spec: &LaunchSpec) -> Result<Self> {
        let RunnerProcess {
            child,
            stdin,
            stdout,
            stderr,
            readers,
        } = RunnerProcess::spawn(spec)?;

        let session = Self {
            id: Uuid::new_v4(),
            workspace_file: spec.workspace_file.clone(),
            state: SessionState::Starting,
            child,
            commands: CommandChannel::new(stdin),
            stdout,
            stderr,
            readers,
            connection_info: None,
            exit_code: None,
            started_at: Instant::now(),
        };
        info!(
            "Session {} started (pid {:?})",
            session.id,
            session.child.id()
        );
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Where the runner writes the workspace
    pub fn workspace_file(&self) -> &Path {
        &self.workspace_file
    }

    /// Payload of the connection event, if it parsed as JSON
    pub fn connection_info(&self) -> Option<&serde_json::Value> {
        self.connection_info.as_ref()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Process ID of the runner while it is running
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether the runner process is still alive
    pub fn is_running(&mut self) -> bool {
        self.state != SessionState::Finished && !has_exited(&mut self.child)
    }

    /// Everything the runner printed so far
    pub fn captured_output(&mut self) -> CapturedOutput {
        CapturedOutput {
            stdout: self.stdout.contents(),
            stderr: self.stderr.contents(),
        }
    }

    /// Wait until the runner reports that it is attached
    pub async fn await_connected(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.state != SessionState::Starting {
            return Err(ProfilerError::state(format!(
                "Session {} is not starting (state {:?})",
                self.id, self.state
            )));
        }

        let pattern = connected_pattern()?;
        let child = &mut self.child;
        let outcome = self
            .stdout
            .await_match(pattern, timeout, || has_exited(child))
            .await;

        match outcome {
            MatchOutcome::Matched(line) => {
                self.connection_info = parse_connection_info(&line);
                self.state = SessionState::Connected;
                info!(
                    "Session {} connected after {} ms",
                    self.id,
                    self.started_at.elapsed().as_millis()
                );
                Ok(())
            }
            MatchOutcome::Exited => {
                self.stderr.wait_closed(READER_DRAIN_GRACE).await;
                Err(self.protocol_error(
                    "Connection with the profiler failed: runner exited before connecting",
                ))
            }
            MatchOutcome::TimedOut => Err(self.protocol_error(format!(
                "Connection with the profiler failed: no connection within {:?}",
                timeout.unwrap_or_default()
            ))),
        }
    }

    /// Wait for the runner to exit and require a zero exit code
    pub async fn await_finished(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.state == SessionState::Finished {
            return Err(ProfilerError::state(format!(
                "Session {} has already finished",
                self.id
            )));
        }

        let waited = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.child.wait()).await.ok(),
            None => Some(self.child.wait().await),
        };

        let status = match waited {
            Some(status) => status?,
            None => {
                warn!("Session {} did not finish within {:?}", self.id, timeout);
                return Err(self.process_error(format!(
                    "Profiler did not finish within {:?}",
                    timeout.unwrap_or_default()
                )));
            }
        };

        self.exit_code = status.code();
        self.stdout.wait_closed(READER_DRAIN_GRACE).await;
        self.stderr.wait_closed(READER_DRAIN_GRACE).await;
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        self.state = SessionState::Finished;

        if status.success() {
            info!(
                "Session {} finished after {} ms, workspace {:?}",
                self.id,
                self.started_at.elapsed().as_millis(),
                self.workspace_file
            );
            Ok(())
        } else {
            warn!("Session {} runner exited with {:?}", self.id, self.exit_code);
            Err(self.process_error("Profiler exited with a failure"))
        }
    }

    /// Ask the runner to detach; the runner exits once it has written the workspace
    pub async fn disconnect(&mut self) -> Result<()> {
        self.send("disconnect", &[]).await
    }

    /// Ask the runner for a snapshot; `None` lets the runner pick the name
    pub async fn get_snapshot(&mut self, name: Option<&str>) -> Result<()> {
        self.send("get-snapshot", &[("name", name)]).await
    }

    async fn send(&mut self, command: &str, args: &[(&str, Option<&str>)]) -> Result<()> {
        if !self.is_running() {
            return Err(ProfilerError::state(format!(
                "Cannot send '{}': session {} runner is not running",
                command, self.id
            )));
        }
        self.commands.send(command, args).await
    }

    fn protocol_error(&mut self, message: impl Into<String>) -> ProfilerError {
        ProfilerError::Protocol {
            message: message.into(),
            output: self.captured_output(),
        }
    }

    fn process_error(&mut self, message: impl Into<String>) -> ProfilerError {
        ProfilerError::Process {
            message: message.into(),
            exit_code: self.exit_code,
            output: self.captured_output(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_pattern() {
        let pattern = connected_pattern().unwrap();
        assert!(pattern.is_match(r#"##dotMemory["connected",{"pid":12}]"#));
        assert!(pattern.is_match(r#"##DOTMEMORY["Connected", {}]"#));
        assert!(!pattern.is_match(r#"##dotMemory["connected"]"#));
        assert!(!pattern.is_match(r#"##dotMemory["disconnected",{}]"#));
        assert!(!pattern.is_match("connected"));
    }

    #[test]
    fn test_parse_connection_info() {
        let info = parse_connection_info(r#"##dotMemory["connected",{"pid":12,"agent":"x"}]"#);
        assert_eq!(info, Some(serde_json::json!({"pid": 12, "agent": "x"})));

        // Unquoted keys are accepted as a connection but carry no payload.
        assert_eq!(parse_connection_info(r#"##dotMemory["connected",{pid:12}]"#), None);
    }
}
