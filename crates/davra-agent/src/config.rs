//! Typed view of the agent configuration.
//!
//! Settings are read from the `config.json` key/value store. Unknown keys are
//! ignored here but kept in the store, since device applications and the
//! update-configuration capability may put arbitrary keys there.

use std::path::PathBuf;
use std::time::Duration;

use davra_api::ApiConfig;
use davra_bus::BrokerAddress;
use davra_core::DeviceId;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{AgentError, Result};

/// Agent settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    /// Server base URL.
    #[serde(rename = "server")]
    pub server_url: String,

    /// Identity of this device.
    #[serde(rename = "UUID")]
    pub device_id: DeviceId,

    /// Bearer token for the server API and the cloud broker.
    #[serde(rename = "apiToken", default)]
    pub api_token: String,

    /// Heartbeat period in control-loop ticks (seconds).
    #[serde(
        rename = "heartbeatInterval",
        default = "AgentSettings::default_heartbeat_interval",
        deserialize_with = "lenient_u64"
    )]
    pub heartbeat_interval_secs: u64,

    /// Longest a function may stay running, in seconds.
    #[serde(
        rename = "scriptMaxTime",
        default = "AgentSettings::default_script_max_time",
        deserialize_with = "lenient_u64"
    )]
    pub script_max_time_secs: u64,

    /// Device-local broker, `host[:port]`.
    #[serde(rename = "mqttBrokerAgentHost", default)]
    pub local_broker: Option<String>,

    /// Cloud broker, `host[:port]`.
    #[serde(rename = "mqttBrokerServerHost", default)]
    pub cloud_broker: Option<String>,

    /// Where persisted state and installed applications live.
    #[serde(
        rename = "installationDir",
        default = "AgentSettings::default_installation_dir"
    )]
    pub installation_dir: PathBuf,

    /// Command used by the reboot capability.
    #[serde(rename = "rebootCommand", default = "AgentSettings::default_reboot_command")]
    pub reboot_command: String,
}

impl AgentSettings {
    /// Default installation directory.
    pub const DEFAULT_INSTALLATION_DIR: &'static str = "/usr/bin/davra";

    const fn default_heartbeat_interval() -> u64 {
        600
    }

    const fn default_script_max_time() -> u64 {
        600
    }

    fn default_installation_dir() -> PathBuf {
        PathBuf::from(Self::DEFAULT_INSTALLATION_DIR)
    }

    fn default_reboot_command() -> String {
        "sudo reboot -h now".to_string()
    }

    /// Build settings from a configuration snapshot.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::Config` if `server` or `UUID` is missing or a value
    /// has the wrong shape.
    pub fn from_map(values: &Map<String, Value>) -> Result<Self> {
        let mut settings: Self = serde_json::from_value(Value::Object(values.clone()))
            .map_err(|e| AgentError::Config(e.to_string()))?;
        if settings.server_url.trim().is_empty() {
            return Err(AgentError::Config("server is empty".into()));
        }
        // Zero would stall the modulo schedule and fail every function at once.
        settings.heartbeat_interval_secs = settings.heartbeat_interval_secs.max(1);
        settings.script_max_time_secs = settings.script_max_time_secs.max(1);
        Ok(settings)
    }

    /// Override the installation directory.
    #[must_use]
    pub fn with_installation_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.installation_dir = dir.into();
        self
    }

    /// Script timeout as a Duration.
    #[must_use]
    pub const fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_max_time_secs)
    }

    /// Scratch directory for ad-hoc scripts.
    #[must_use]
    pub fn scratch_dir(&self) -> PathBuf {
        self.installation_dir.join("scratch")
    }

    /// Parent directory of unpacked application bundles.
    #[must_use]
    pub fn apps_dir(&self) -> PathBuf {
        self.installation_dir.join("apps")
    }

    /// Server API connection settings.
    #[must_use]
    pub fn api_config(&self) -> ApiConfig {
        ApiConfig::new(self.server_url.clone(), self.api_token.clone())
    }

    /// Local broker address, if configured and valid.
    #[must_use]
    pub fn local_broker_address(&self) -> Option<BrokerAddress> {
        parse_broker("mqttBrokerAgentHost", self.local_broker.as_deref())
    }

    /// Cloud broker address, if configured and valid.
    #[must_use]
    pub fn cloud_broker_address(&self) -> Option<BrokerAddress> {
        parse_broker("mqttBrokerServerHost", self.cloud_broker.as_deref())
    }

    /// MQTT client id on the local bus.
    #[must_use]
    pub fn local_client_id(&self) -> String {
        format!("davra-agent-{}-local", self.device_id)
    }

    /// MQTT client id on the cloud bus. Differs from the local one so both
    /// sessions can share a broker.
    #[must_use]
    pub fn cloud_client_id(&self) -> String {
        format!("davra-agent-{}-cloud", self.device_id)
    }
}

fn parse_broker(key: &str, value: Option<&str>) -> Option<BrokerAddress> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    match value.parse() {
        Ok(address) => Some(address),
        Err(e) => {
            warn!(key, value, error = %e, "Ignoring invalid broker address");
            None
        }
    }
}

/// Accept `600`, `"600"` and `600.0`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| f as u64)
            })
            .ok_or_else(|| D::Error::custom(format!("expected a non-negative number, got {n}"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("expected a number, got {s:?}"))),
        other => Err(D::Error::custom(format!("expected a number, got {other}"))),
    }
}
