//! Builders for the telemetry records the agent sends to the server.

use davra_api::IotDatum;
use davra_core::{DeviceId, InvocationId};
use davra_store::{DeviceAssignment, FunctionRecord, FUNCTION_UUID_KEY};
use serde_json::{json, Map, Value};

use crate::metrics::HostMetrics;

/// Agent heartbeat event.
pub const AGENT_HEARTBEAT: &str = "davra.agent.heartbeat";
/// Agent process started.
pub const AGENT_STARTED: &str = "davra.agent.started";
/// Configuration reported.
pub const AGENT_CONFIGURED: &str = "davra.agent.configured";
/// A job reached a terminal status.
pub const JOB_FINISHED: &str = "davra.job.finished";
/// A function reached a terminal status.
pub const FUNCTION_FINISHED: &str = "davra.function.finished";

const API_TOKEN_KEY: &str = "apiToken";

/// Metrics plus the heartbeat event, sent as one batch.
#[must_use]
pub fn heartbeat(
    device_id: &DeviceId,
    metrics: &HostMetrics,
    agent_version: &str,
    heartbeat_interval_secs: u64,
) -> Vec<IotDatum> {
    vec![
        IotDatum::datum(device_id, "uptime", json!(metrics.uptime_secs)),
        IotDatum::datum(device_id, "cpu", json!(metrics.cpu_load)),
        IotDatum::datum(device_id, "ram", json!(metrics.ram_available_mb)),
        IotDatum::event(
            device_id,
            AGENT_HEARTBEAT,
            json!({
                "davraAgentVersion": agent_version,
                "heartbeatInterval": heartbeat_interval_secs,
            }),
        ),
    ]
}

/// A job's assignment reached `status`.
#[must_use]
pub fn job_finished(device_id: &DeviceId, assignment: &DeviceAssignment) -> IotDatum {
    let value = serde_json::to_value(assignment).unwrap_or(Value::Null);
    IotDatum::event(device_id, JOB_FINISHED, value).with_tag("status", assignment.status.as_str())
}

/// A function reached a terminal status.
#[must_use]
pub fn function_finished(
    device_id: &DeviceId,
    invocation_id: Option<&InvocationId>,
    record: &FunctionRecord,
) -> IotDatum {
    let value = serde_json::to_value(record).unwrap_or(Value::Null);
    let datum = IotDatum::event(device_id, FUNCTION_FINISHED, value);
    match invocation_id {
        Some(id) => datum.with_tag(FUNCTION_UUID_KEY, id.as_str()),
        None => datum,
    }
}

/// The agent process started with `config`.
#[must_use]
pub fn agent_started(device_id: &DeviceId, config: &Map<String, Value>) -> IotDatum {
    IotDatum::event(device_id, AGENT_STARTED, Value::Object(redacted(config)))
}

/// The current configuration, as reported by the configuration capabilities.
#[must_use]
pub fn agent_configured(device_id: &DeviceId, config: &Map<String, Value>) -> IotDatum {
    IotDatum::event(
        device_id,
        AGENT_CONFIGURED,
        json!({ "deviceConfig": Value::Object(redacted(config)) }),
    )
}

/// Configuration without the bearer token.
#[must_use]
pub fn redacted(config: &Map<String, Value>) -> Map<String, Value> {
    let mut config = config.clone();
    config.remove(API_TOKEN_KEY);
    config
}
