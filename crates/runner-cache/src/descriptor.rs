//! Runner descriptors

use serde::Serialize;
use std::path::{Path, PathBuf};

/// Identifies one versioned build of the external profiler runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunnerDescriptor {
    /// Package name of the tool
    pub name: &'static str,
    /// Semantic version string
    pub version: &'static str,
    /// Estimated download size in bytes, used when the server sends no length
    pub estimated_size: u64,
    /// File name of the executable inside the version directory
    pub executable: &'static str,
}

/// The console runner this crate knows how to drive
pub const DOTMEMORY_CONSOLE: RunnerDescriptor = RunnerDescriptor {
    name: "JetBrains.dotMemory.Console",
    version: "2023.3.3",
    estimated_size: 45 * 1024 * 1024,
    executable: if cfg!(target_os = "windows") {
        "dotMemory.exe"
    } else {
        "dotMemory.sh"
    },
};

impl RunnerDescriptor {
    /// Directory holding this version under the given cache root
    pub fn version_dir(&self, root: &Path) -> PathBuf {
        root.join(self.name).join(self.version)
    }

    /// Expected location of the executable under the given cache root
    pub fn executable_path(&self, root: &Path) -> PathBuf {
        self.version_dir(root).join(self.executable)
    }

    /// Relative download path appended to a base url
    pub fn download_path(&self) -> String {
        format!("{}/{}/{}", self.name, self.version, self.executable)
    }
}
