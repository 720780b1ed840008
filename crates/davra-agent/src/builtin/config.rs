//! `agent-action-reportAgentConfig` and `agent-action-updateAgentConfig`.

use serde_json::{Map, Value};
use tracing::{info, warn};

use super::{HandlerContext, HandlerOutcome};
use crate::telemetry;

/// Send the configuration to the server as a `davra.agent.configured` event.
///
/// Always completes; a failed send is logged and the next report repeats it.
pub async fn report(ctx: &HandlerContext) -> HandlerOutcome {
    let config = telemetry::redacted(&ctx.config.snapshot());
    info!(keys = config.len(), "Reporting agent configuration");
    let event = telemetry::agent_configured(&ctx.device_id, &config);
    if let Err(e) = ctx.api.send_iot_data(&[event]).await {
        warn!(error = %e, "Configuration report not delivered");
    }
    HandlerOutcome::completed(Value::Object(config).to_string())
}

/// Upsert `key` = `value`, then report the configuration.
pub async fn update(ctx: &HandlerContext, parameter_values: &Map<String, Value>) -> HandlerOutcome {
    let Some(key) = parameter_values
        .get("key")
        .and_then(Value::as_str)
        .filter(|key| !key.trim().is_empty())
    else {
        return HandlerOutcome::failed("key missing");
    };
    let value = parameter_values.get("value").cloned().unwrap_or(Value::Null);

    info!(key, "Updating agent configuration");
    if let Err(e) = ctx.config.upsert(key, value) {
        return HandlerOutcome::failed(format!("Could not update configuration: {e}"));
    }
    report(ctx).await
}
