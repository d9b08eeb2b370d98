//! Profiler Session - external memory profiler control
//!
//! This crate attaches an external memory profiler runner to the current
//! process, asks it for snapshots over a line protocol on its standard
//! streams, and detaches it again.

mod channel;
mod config;
mod error;
mod event_log;
mod process;
mod profiler;
mod session;

pub use channel::{encode_command, CommandChannel, COMMAND_TAG};
pub use config::{
    timeout_from_millis, Config, LOG_FILE_ENV, OPEN_UI_ENV, OVERWRITE_ENV, RUNNER_PATH_ENV,
    SAVE_DIR_ENV,
};
pub use error::{CapturedOutput, ProfilerError, Result};
pub use event_log::{EventLog, LineSink, MatchOutcome, POLL_INTERVAL};
pub use process::{resolve_workspace_file, LaunchSpec, Subcommand};
pub use profiler::{PrerequisiteTask, Profiler, ProfilerOptions, RUNNER_URL_ENV};
pub use runner_cache::{CancellationToken, ProgressCallback};
pub use session::{Session, SessionState};
