//! Runner cache library
//!
//! This crate locates the versioned external profiler runner on disk
//! and downloads it when it is missing.

mod acquire;
mod cache;
mod descriptor;
mod error;

pub use acquire::{AcquireRequest, HttpAcquirer, ProgressCallback, RunnerAcquirer};
pub use cache::{default_root, RunnerCache, CACHE_DIR_ENV};
pub use descriptor::{RunnerDescriptor, DOTMEMORY_CONSOLE};
pub use error::{AcquisitionError, Result};
pub use tokio_util::sync::CancellationToken;
