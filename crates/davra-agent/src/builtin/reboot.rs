//! `agent-action-rebootDevice`.
//!
//! The dispatcher writes the reboot marker before this handler runs. A reboot
//! that starts leaves the function running; the next agent start finds the
//! marker and completes it with the new uptime.

use std::path::Path;

use tracing::{error, info};

use super::{HandlerContext, HandlerOutcome};
use crate::process::run_shell;

/// Issue the reboot command.
pub async fn run(ctx: &HandlerContext) -> Option<HandlerOutcome> {
    info!(command = %ctx.reboot_command, "Rebooting device");
    match run_shell(&ctx.reboot_command, Path::new("/"), ctx.script_timeout).await {
        Ok(output) if output.success() => None,
        Ok(output) => {
            error!(exit_code = ?output.exit_code, output = %output.output, "Reboot command failed");
            Some(HandlerOutcome::from_command(output))
        }
        Err(e) => Some(HandlerOutcome::failed(format!("Could not start reboot: {e}"))),
    }
}

/// Outcome recorded when the agent starts again after the reboot.
#[must_use]
pub fn recovered(uptime_secs: u64) -> HandlerOutcome {
    HandlerOutcome::completed(uptime_secs.to_string())
}
