//! On-disk layout of the agent's state directory.
//!
//! ```text
//! <installation dir>/
//!   currentJob/
//!     job.json                 {"version": n, "record": Job}
//!   currentFunction/
//!     currentFunction.json     {"version": n, "record": FunctionRecord}
//!     doingReboot.json         RebootMarker
//! ```
//!
//! Each record lives in its own directory, which is wiped when a new record is
//! created and removed when the record is cleared.

use std::path::{Path, PathBuf};

/// Directory holding the current job.
pub const JOB_DIR: &str = "currentJob";
/// File holding the current job.
pub const JOB_FILE: &str = "job.json";
/// Directory holding the current function.
pub const FUNCTION_DIR: &str = "currentFunction";
/// File holding the current function.
pub const FUNCTION_FILE: &str = "currentFunction.json";
/// Reboot marker file, inside the function directory.
pub const REBOOT_MARKER_FILE: &str = "doingReboot.json";

/// Path builder rooted at the installation directory.
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    /// Create a layout rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of the current job.
    #[must_use]
    pub fn job_dir(&self) -> PathBuf {
        self.root.join(JOB_DIR)
    }

    /// File of the current job.
    #[must_use]
    pub fn job_file(&self) -> PathBuf {
        self.job_dir().join(JOB_FILE)
    }

    /// Directory of the current function.
    #[must_use]
    pub fn function_dir(&self) -> PathBuf {
        self.root.join(FUNCTION_DIR)
    }

    /// File of the current function.
    #[must_use]
    pub fn function_file(&self) -> PathBuf {
        self.function_dir().join(FUNCTION_FILE)
    }

    /// Reboot marker file.
    #[must_use]
    pub fn reboot_marker_file(&self) -> PathBuf {
        self.function_dir().join(REBOOT_MARKER_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_rooted() {
        let layout = StateLayout::new("/usr/bin/davra");
        assert_eq!(
            layout.job_file(),
            PathBuf::from("/usr/bin/davra/currentJob/job.json")
        );
        assert_eq!(
            layout.function_file(),
            PathBuf::from("/usr/bin/davra/currentFunction/currentFunction.json")
        );
        assert_eq!(
            layout.reboot_marker_file(),
            PathBuf::from("/usr/bin/davra/currentFunction/doingReboot.json")
        );
    }
}
