//! Capabilities the agent executes itself.
//!
//! Every handler follows the same contract: read its parameters, do the work,
//! and return the terminal status plus response text for the function record.
//! Handlers never touch the state store; the dispatcher applies their outcome.
//!
//! | Capability | Runs | Outcome |
//! |------------|------|---------|
//! | `agent-action-pushAppWithInstaller` | background | exit code of `install.sh` |
//! | `agent-action-rebootDevice` | background | stays running until the device is back |
//! | `agent-action-reportAgentConfig` | inline | always completed |
//! | `agent-action-updateAgentConfig` | inline | always completed |
//! | `agent-action-runScriptBash` | background | exit code of the script |

pub mod config;
pub mod install;
pub mod reboot;
pub mod script;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use davra_api::ServerApi;
use davra_core::{Clock, DeviceId, InvocationId};
use davra_store::{CapabilityDetails, ConfigStore, FunctionStatus};
use serde_json::{Map, Value};

use crate::process::CommandOutput;

/// A built-in capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinFunction {
    /// Download, unpack and install an application bundle.
    PushAppWithInstaller,
    /// Reboot the device.
    RebootDevice,
    /// Send the configuration to the server.
    ReportAgentConfig,
    /// Upsert one configuration key, then report.
    UpdateAgentConfig,
    /// Run a bash script.
    RunScriptBash,
}

impl BuiltinFunction {
    /// Every built-in, in registration order.
    pub const ALL: [Self; 5] = [
        Self::PushAppWithInstaller,
        Self::RebootDevice,
        Self::ReportAgentConfig,
        Self::UpdateAgentConfig,
        Self::RunScriptBash,
    ];

    /// Capability name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PushAppWithInstaller => "agent-action-pushAppWithInstaller",
            Self::RebootDevice => "agent-action-rebootDevice",
            Self::ReportAgentConfig => "agent-action-reportAgentConfig",
            Self::UpdateAgentConfig => "agent-action-updateAgentConfig",
            Self::RunScriptBash => "agent-action-runScriptBash",
        }
    }

    /// Look up a built-in by capability name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|builtin| builtin.name() == name)
    }

    /// Whether the handler may take long enough that it must not block the agent.
    #[must_use]
    pub const fn runs_in_background(self) -> bool {
        matches!(
            self,
            Self::PushAppWithInstaller | Self::RebootDevice | Self::RunScriptBash
        )
    }

    /// Server-visible details.
    #[must_use]
    pub fn details(self) -> CapabilityDetails {
        let (parameters, label, description) = match self {
            Self::PushAppWithInstaller => (
                &[(install::INSTALLATION_FILE, "file")][..],
                "Push Device App (with installer)",
                "To run a device Application alongside the Device Agent on a device. \
                 Supply a tar.gz file containing an install.sh script to install it.",
            ),
            Self::RebootDevice => (
                &[][..],
                "Reboot Device",
                "Reboot the device immediately",
            ),
            Self::ReportAgentConfig => (
                &[][..],
                "Report Agent Config to Server",
                "Send the agent configuration from agent to server",
            ),
            Self::UpdateAgentConfig => (
                &[("key", "string"), ("value", "string")][..],
                "Update Config on Device Agent",
                "Upsert a configuration item on the device",
            ),
            Self::RunScriptBash => (
                &[(script::SCRIPT, "textarea")][..],
                "Run bash script on Device",
                "Run a bash script once on the device, launched by the Device Agent",
            ),
        };
        CapabilityDetails {
            parameters: Some(
                parameters
                    .iter()
                    .map(|(name, kind)| ((*name).to_string(), Value::from(*kind)))
                    .collect(),
            ),
            label: Some(label.to_string()),
            description: Some(description.to_string()),
            extra: Map::new(),
        }
    }
}

/// Terminal status and response produced by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    /// `completed` or `failed`.
    pub status: FunctionStatus,
    /// Text for the function record.
    pub response: Option<String>,
}

impl HandlerOutcome {
    /// Successful outcome.
    #[must_use]
    pub fn completed(response: impl Into<String>) -> Self {
        Self {
            status: FunctionStatus::Completed,
            response: Some(response.into()),
        }
    }

    /// Failed outcome.
    #[must_use]
    pub fn failed(response: impl Into<String>) -> Self {
        Self {
            status: FunctionStatus::Failed,
            response: Some(response.into()),
        }
    }

    /// Map a command's exit status; its output is the response.
    #[must_use]
    pub fn from_command(output: CommandOutput) -> Self {
        let status = if output.success() {
            FunctionStatus::Completed
        } else {
            FunctionStatus::Failed
        };
        Self {
            status,
            response: Some(output.output),
        }
    }
}

/// Everything a handler may use.
#[derive(Clone)]
pub struct HandlerContext {
    /// Agent configuration.
    pub config: Arc<ConfigStore>,
    /// Server API.
    pub api: Arc<dyn ServerApi>,
    /// This device.
    pub device_id: DeviceId,
    /// Client for bundle downloads.
    pub http: reqwest::Client,
    /// Where ad-hoc scripts are written.
    pub scratch_dir: PathBuf,
    /// Where bundles are unpacked.
    pub apps_dir: PathBuf,
    /// Deadline for scripts and installers.
    pub script_timeout: Duration,
    /// Command that reboots the device.
    pub reboot_command: String,
    /// Time source for bundle directory names.
    pub clock: Arc<dyn Clock>,
}

/// Run a built-in handler.
///
/// Returns `None` when the function stays running after the handler returns
/// (a reboot that was successfully started).
pub async fn execute(
    function: BuiltinFunction,
    ctx: &HandlerContext,
    invocation_id: &InvocationId,
    parameter_values: &Map<String, Value>,
) -> Option<HandlerOutcome> {
    match function {
        BuiltinFunction::PushAppWithInstaller => Some(install::run(ctx, parameter_values).await),
        BuiltinFunction::RebootDevice => reboot::run(ctx).await,
        BuiltinFunction::ReportAgentConfig => Some(config::report(ctx).await),
        BuiltinFunction::UpdateAgentConfig => Some(config::update(ctx, parameter_values).await),
        BuiltinFunction::RunScriptBash => {
            Some(script::run(ctx, invocation_id, parameter_values).await)
        }
    }
}
