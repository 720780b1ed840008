//! Running shell commands with a deadline.
//!
//! Commands run under `bash` with stderr folded into stdout, so the captured
//! text reads the way it would on a terminal (including `bash -x` traces).
//! A command that outlives its deadline is killed.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

/// What a finished (or abandoned) command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, absent when the process was killed or timed out.
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
    /// The deadline elapsed and the process was killed.
    pub timed_out: bool,
}

impl CommandOutput {
    /// Exited with status zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.exit_code, Some(0)) && !self.timed_out
    }
}

/// Run `command_line` with `bash -c` in `cwd`, killing it after `timeout`.
///
/// # Errors
///
/// Returns an error if `bash` cannot be spawned.
pub async fn run_shell(
    command_line: &str,
    cwd: &Path,
    timeout: Duration,
) -> std::io::Result<CommandOutput> {
    debug!(command = command_line, cwd = %cwd.display(), "Running command");

    let child = Command::new("bash")
        .arg("-c")
        .arg(format!("exec 2>&1\n{command_line}"))
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => {
            let output = result?;
            Ok(CommandOutput {
                exit_code: output.status.code(),
                output: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
                timed_out: false,
            })
        }
        Err(_) => {
            // Dropping the wait future drops the child, which kills it.
            warn!(
                command = command_line,
                timeout_secs = timeout.as_secs(),
                "Command timed out and was killed"
            );
            Ok(CommandOutput {
                exit_code: None,
                output: format!("Timed out after {} seconds", timeout.as_secs()),
                timed_out: true,
            })
        }
    }
}

/// Quote a path or word for a `bash` command line.
#[must_use]
pub fn quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}
