//! The JSON object carried on both buses, and who sent it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BusError, Result};

/// Well-known envelope field names.
pub mod keys {
    /// Origin tag, `agent` or `app:<name>`.
    pub const ORIGIN: &str = "origin";
    /// Legacy agent tag; value is the agent version.
    pub const FROM_AGENT: &str = "fromAgent";
    /// Legacy application tag; value is the application name.
    pub const FROM_APP: &str = "fromApp";

    /// Capability registration, value is the function name.
    pub const REGISTER_CAPABILITY: &str = "registerCapability";
    /// Details accompanying a registration.
    pub const CAPABILITY_DETAILS: &str = "capabilityDetails";
    /// Capability removal, value is the function name.
    pub const UNREGISTER_CAPABILITY: &str = "unregisterCapability";
    /// Request for the agent to run a function, value is the function name.
    pub const RUN_FUNCTION_ON_AGENT: &str = "runFunctionOnAgent";
    /// Parameters of a function run.
    pub const FUNCTION_PARAMETER_VALUES: &str = "functionParameterValues";
    /// An application announcing itself.
    pub const CONNECT_TO_AGENT: &str = "connectToAgent";
    /// Request for the agent configuration.
    pub const RETRIEVE_CONFIG_FROM_AGENT: &str = "retrieveConfigFromAgent";
    /// Completion report, value is the function name.
    pub const FINISHED_FUNCTION_ON_APP: &str = "finishedFunctionOnApp";
    /// Status of a completion report.
    pub const STATUS: &str = "status";
    /// Response of a completion report.
    pub const RESPONSE: &str = "response";
    /// Telemetry to forward to the server, as JSON text.
    pub const SEND_IOT_DATA: &str = "sendIotData";

    /// Outbound heartbeat, value is epoch millis.
    pub const AGENT_HEARTBEAT: &str = "agentHeartbeat";
    /// Outbound configuration snapshot.
    pub const AGENT_CONFIG: &str = "agentConfig";
    /// Outbound function invocation name.
    pub const FUNCTION_NAME: &str = "functionName";
    /// Outbound function invocation start time.
    pub const START_TIME: &str = "startTime";

    /// Cloud announcement field.
    pub const DAVRA_ANNOUNCEMENT: &str = "davra-announcement";
    /// Cloud function invocation field.
    pub const DAVRA_FUNCTION: &str = "davra-function";
}

const AGENT_ORIGIN: &str = "agent";
const APP_ORIGIN_PREFIX: &str = "app:";

/// Who published a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// This agent (or another agent instance on the same bus).
    Agent,
    /// A named device application.
    App(String),
    /// Untagged; treated as coming from an application or the server.
    Unknown,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent => f.write_str(AGENT_ORIGIN),
            Self::App(name) => write!(f, "{APP_ORIGIN_PREFIX}{name}"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// A bus message: a JSON object keyed by well-known field names.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope(Map<String, Value>);

impl Envelope {
    /// An empty envelope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing JSON object.
    #[must_use]
    pub const fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Insert or replace a field.
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Get a field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Get a string field.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Whether a field is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// The underlying object.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Derive the publisher from the tags present.
    ///
    /// An explicit `origin` wins over the legacy `fromAgent`/`fromApp` tags.
    #[must_use]
    pub fn origin(&self) -> Origin {
        if let Some(origin) = self.get_str(keys::ORIGIN) {
            if origin == AGENT_ORIGIN {
                return Origin::Agent;
            }
            if let Some(name) = origin.strip_prefix(APP_ORIGIN_PREFIX) {
                return Origin::App(name.to_string());
            }
        }
        if self.contains(keys::FROM_AGENT) {
            return Origin::Agent;
        }
        match self.get(keys::FROM_APP) {
            Some(Value::String(name)) => Origin::App(name.clone()),
            Some(other) => Origin::App(other.to_string()),
            None => Origin::Unknown,
        }
    }

    /// Tag the envelope as published by this agent.
    ///
    /// Both the `origin` tag and the legacy `fromAgent` tag are written so that
    /// applications built against either convention recognise the message.
    pub fn stamp_agent(&mut self, agent_version: &str) {
        self.insert(keys::ORIGIN, AGENT_ORIGIN);
        self.insert(keys::FROM_AGENT, agent_version);
    }

    /// Tag the envelope as published by an application.
    pub fn stamp_app(&mut self, name: &str) {
        self.insert(keys::ORIGIN, format!("{APP_ORIGIN_PREFIX}{name}"));
        self.insert(keys::FROM_APP, name);
    }

    /// Parse a payload that must be a JSON object.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Malformed` if the payload is not a JSON object.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(other) => Err(BusError::Malformed(format!(
                "expected a JSON object, got {}",
                kind_of(&other)
            ))),
            Err(e) => Err(BusError::Malformed(e.to_string())),
        }
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Encode` if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.0).map_err(|e| BusError::Encode(e.to_string()))
    }
}

const fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Result of decoding an inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    /// The agent's own message looped back; ignore it.
    OwnEcho,
    /// Messages for the agent, possibly none.
    Messages {
        /// Who published the envelope.
        origin: Origin,
        /// Recognised messages, in handling order.
        messages: Vec<T>,
    },
}
