//! `agent-action-runScriptBash`: run supplied script text once.

use davra_core::InvocationId;
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::{HandlerContext, HandlerOutcome};
use crate::process::{quote, run_shell};

/// Parameter holding the script text.
pub const SCRIPT: &str = "script";

/// Write the script to the scratch directory and run it under `bash -x`.
pub async fn run(
    ctx: &HandlerContext,
    invocation_id: &InvocationId,
    parameter_values: &Map<String, Value>,
) -> HandlerOutcome {
    let Some(script) = parameter_values.get(SCRIPT) else {
        warn!(invocation_id = %invocation_id, "No script to run");
        return HandlerOutcome::failed("script missing");
    };
    let script = match script {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    if let Err(e) = tokio::fs::create_dir_all(&ctx.scratch_dir).await {
        return HandlerOutcome::failed(format!("Could not prepare script directory: {e}"));
    }
    let path = ctx.scratch_dir.join(format!("script-{invocation_id}.sh"));
    if let Err(e) = tokio::fs::write(&path, script.as_bytes()).await {
        return HandlerOutcome::failed(format!("Could not write script: {e}"));
    }

    info!(invocation_id = %invocation_id, path = %path.display(), "Running script");
    // -x echoes each command so the server shows a readable log.
    let command = format!("bash -x {}", quote(&path.to_string_lossy()));
    let outcome = match run_shell(&command, &ctx.scratch_dir, ctx.script_timeout).await {
        Ok(output) => HandlerOutcome::from_command(output),
        Err(e) => HandlerOutcome::failed(format!("Could not start bash: {e}")),
    };

    if let Err(e) = tokio::fs::remove_file(&path).await {
        warn!(path = %path.display(), error = %e, "Could not remove script file");
    }
    info!(invocation_id = %invocation_id, status = outcome.status.as_str(), "Script finished");
    outcome
}
