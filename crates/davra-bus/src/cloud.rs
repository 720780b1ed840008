//! The per-device cloud topic the server uses to nudge the agent.
//!
//! Messages here are optimisations: the periodic job poll stays authoritative, so
//! a lost or duplicated nudge costs latency at most.

use davra_core::DeviceId;
use serde_json::{Map, Value};

use crate::envelope::{keys, Decoded, Envelope, Origin};
use crate::error::{BusError, Result};

/// Bare-string form of the "check for jobs" announcement.
pub const CHECK_FOR_JOBS_SENTINEL: &str = "davra.announcement:check-for-jobs";

/// Value of `davra-announcement` asking the agent to poll for jobs.
pub const CHECK_FOR_JOBS: &str = "check-for-jobs";

/// Topic for a device.
#[must_use]
pub fn topic(device_id: &DeviceId) -> String {
    format!("devices/{device_id}")
}

/// A trigger from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum CloudMessage {
    /// Poll the jobs endpoint now.
    CheckForJobs,
    /// Run a function directly, outside any job.
    RunFunction {
        /// Function name.
        name: String,
        /// Parameter values.
        parameter_values: Map<String, Value>,
    },
}

/// Decode a cloud-bus payload.
///
/// # Errors
///
/// Returns `BusError::Malformed` if the payload is neither the sentinel string
/// nor a JSON object.
pub fn decode(payload: &[u8]) -> Result<Decoded<CloudMessage>> {
    let text = String::from_utf8_lossy(payload);
    let trimmed = text.trim();
    if trimmed == CHECK_FOR_JOBS_SENTINEL {
        return Ok(Decoded::Messages {
            origin: Origin::Unknown,
            messages: vec![CloudMessage::CheckForJobs],
        });
    }

    let envelope = match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Envelope::from_map(map),
        Ok(Value::String(s)) if s == CHECK_FOR_JOBS_SENTINEL => {
            return Ok(Decoded::Messages {
                origin: Origin::Unknown,
                messages: vec![CloudMessage::CheckForJobs],
            });
        }
        Ok(_) => return Err(BusError::Malformed("expected a JSON object".into())),
        Err(e) => return Err(BusError::Malformed(e.to_string())),
    };

    Ok(match envelope.origin() {
        Origin::Agent => Decoded::OwnEcho,
        origin => Decoded::Messages {
            origin,
            messages: messages(&envelope),
        },
    })
}

fn messages(envelope: &Envelope) -> Vec<CloudMessage> {
    let mut found = Vec::new();
    if envelope.get_str(keys::DAVRA_ANNOUNCEMENT) == Some(CHECK_FOR_JOBS) {
        found.push(CloudMessage::CheckForJobs);
    }
    if let Some(name) = envelope.get_str(keys::DAVRA_FUNCTION) {
        found.push(CloudMessage::RunFunction {
            name: name.to_string(),
            parameter_values: envelope
                .get(keys::FUNCTION_PARAMETER_VALUES)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        });
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn messages_of(payload: &[u8]) -> Vec<CloudMessage> {
        match decode(payload).unwrap() {
            Decoded::Messages { messages, .. } => messages,
            Decoded::OwnEcho => panic!("unexpected echo"),
        }
    }

    #[test]
    fn topic_is_device_scoped() {
        assert_eq!(topic(&DeviceId::new("D1").unwrap()), "devices/D1");
    }

    #[test]
    fn bare_sentinel() {
        assert_eq!(
            messages_of(b"davra.announcement:check-for-jobs"),
            vec![CloudMessage::CheckForJobs]
        );
        assert_eq!(
            messages_of(b"\"davra.announcement:check-for-jobs\""),
            vec![CloudMessage::CheckForJobs]
        );
    }

    #[test]
    fn announcement_object() {
        assert_eq!(
            messages_of(br#"{"davra-announcement": "check-for-jobs"}"#),
            vec![CloudMessage::CheckForJobs]
        );
        assert!(messages_of(br#"{"davra-announcement": "something-else"}"#).is_empty());
    }

    #[test]
    fn function_request_with_parameters() {
        let payload = serde_json::to_vec(&json!({
            "davra-function": "agent-action-runScriptBash",
            "functionParameterValues": {"script": "uptime"}
        }))
        .unwrap();
        assert_eq!(
            messages_of(&payload),
            vec![CloudMessage::RunFunction {
                name: "agent-action-runScriptBash".into(),
                parameter_values: json!({"script": "uptime"}).as_object().cloned().unwrap(),
            }]
        );
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(decode(b"hello there"), Err(BusError::Malformed(_))));
        assert!(matches!(decode(b"42"), Err(BusError::Malformed(_))));
    }

    #[test]
    fn tagged_agent_traffic_is_echo() {
        assert_eq!(
            decode(br#"{"origin": "agent", "davra-function": "x"}"#).unwrap(),
            Decoded::OwnEcho
        );
    }
}
