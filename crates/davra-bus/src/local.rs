//! The device-local bus shared by the agent and device applications.
//!
//! All parties publish and subscribe on [`TOPIC`]. An envelope may carry several
//! requests at once; they are returned in a fixed handling order.

use davra_store::{CapabilityDetails, FunctionRecord, FunctionStatus};
use serde_json::{Map, Value};
use tracing::warn;

use crate::envelope::{keys, Decoded, Envelope, Origin};
use crate::error::Result;

/// The single local topic.
pub const TOPIC: &str = "/agent";

/// Completion report published by a device application.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedFunctionReport {
    /// Name of the function that finished.
    pub function_name: String,
    /// Reported status, if it was one the agent understands.
    pub status: Option<FunctionStatus>,
    /// Reported response, rendered as text.
    pub response: Option<String>,
}

/// A request an application makes of the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalMessage {
    /// Add or update a capability the application executes.
    RegisterCapability {
        /// Function name.
        name: String,
        /// Server-visible details.
        details: CapabilityDetails,
    },
    /// Remove a capability.
    UnregisterCapability {
        /// Function name.
        name: String,
    },
    /// Run a function through the agent's dispatcher.
    RunFunction {
        /// Function name.
        name: String,
        /// Parameter values.
        parameter_values: Map<String, Value>,
    },
    /// An application started and wants a heartbeat.
    Connect {
        /// Application name as announced.
        application: String,
    },
    /// Publish the agent configuration.
    RetrieveConfig,
    /// A delegated function finished.
    FinishedFunction(FinishedFunctionReport),
    /// Telemetry to forward to the server.
    SendIotData(Map<String, Value>),
}

/// Decode a local-bus payload.
///
/// Messages the agent published itself come back as [`Decoded::OwnEcho`].
///
/// # Errors
///
/// Returns `BusError::Malformed` if the payload is not a JSON object.
pub fn decode(payload: &[u8]) -> Result<Decoded<LocalMessage>> {
    let envelope = Envelope::decode(payload)?;
    Ok(match envelope.origin() {
        Origin::Agent => Decoded::OwnEcho,
        origin => Decoded::Messages {
            origin,
            messages: messages(&envelope),
        },
    })
}

/// Extract every recognised request from an envelope, in handling order.
#[must_use]
pub fn messages(envelope: &Envelope) -> Vec<LocalMessage> {
    let mut found = Vec::new();

    if let Some(name) = envelope.get_str(keys::REGISTER_CAPABILITY) {
        let details = match envelope.get(keys::CAPABILITY_DETAILS) {
            Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
                warn!(capability = name, error = %e, "Capability details unreadable, registering without them");
                CapabilityDetails::default()
            }),
            None => CapabilityDetails::default(),
        };
        found.push(LocalMessage::RegisterCapability {
            name: name.to_string(),
            details,
        });
    }

    if let Some(name) = envelope.get_str(keys::UNREGISTER_CAPABILITY) {
        found.push(LocalMessage::UnregisterCapability {
            name: name.to_string(),
        });
    }

    if let Some(name) = envelope.get_str(keys::RUN_FUNCTION_ON_AGENT) {
        found.push(LocalMessage::RunFunction {
            name: name.to_string(),
            parameter_values: object_field(envelope, keys::FUNCTION_PARAMETER_VALUES),
        });
    }

    if let Some(application) = envelope.get(keys::CONNECT_TO_AGENT) {
        found.push(LocalMessage::Connect {
            application: text(application),
        });
    }

    if envelope.contains(keys::RETRIEVE_CONFIG_FROM_AGENT) {
        found.push(LocalMessage::RetrieveConfig);
    }

    if let Some(name) = envelope.get_str(keys::FINISHED_FUNCTION_ON_APP) {
        let status = envelope.get_str(keys::STATUS).and_then(FunctionStatus::parse);
        if status.is_none() && envelope.contains(keys::STATUS) {
            warn!(function = name, "Completion report carries an unknown status");
        }
        found.push(LocalMessage::FinishedFunction(FinishedFunctionReport {
            function_name: name.to_string(),
            status,
            response: envelope.get(keys::RESPONSE).map(text),
        }));
    }

    if let Some(data) = envelope.get(keys::SEND_IOT_DATA) {
        match iot_payload(data) {
            Some(map) => found.push(LocalMessage::SendIotData(map)),
            None => warn!("Dropping sendIotData that is not a JSON object"),
        }
    }

    found
}

fn object_field(envelope: &Envelope, key: &str) -> Map<String, Value> {
    envelope
        .get(key)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn iot_payload(value: &Value) -> Option<Map<String, Value>> {
    match value {
        Value::String(raw) => match serde_json::from_str(raw) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        },
        Value::Object(map) => Some(map.clone()),
        _ => None,
    }
}

// =============================================================================
// Outbound
// =============================================================================

/// Heartbeat for applications.
#[must_use]
pub fn heartbeat(now_millis: i64) -> Envelope {
    Envelope::new().with(keys::AGENT_HEARTBEAT, now_millis)
}

/// Configuration snapshot for applications.
#[must_use]
pub fn agent_config(config: Map<String, Value>) -> Envelope {
    Envelope::new().with(keys::AGENT_CONFIG, Value::Object(config))
}

/// Ask applications to execute a delegated function.
#[must_use]
pub fn function_invocation(record: &FunctionRecord) -> Envelope {
    Envelope::new()
        .with(keys::FUNCTION_NAME, record.function_name.clone())
        .with(
            keys::FUNCTION_PARAMETER_VALUES,
            Value::Object(record.parameter_values.clone()),
        )
        .with(keys::STATUS, record.status.as_str())
        .with(keys::START_TIME, record.start_time)
}
