//! Domain types persisted by the agent.
//!
//! Field names follow the server's JSON contract so that a job fetched from the
//! server can be persisted, mutated and sent back without loss. Fields the agent
//! does not interpret are carried through `extra`.

use davra_core::{AssignmentId, InvocationId, JobId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Parameter key carrying the function invocation identifier.
pub const FUNCTION_UUID_KEY: &str = "functionUuid";

/// A persisted record together with its compare-and-swap version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    /// Monotonic version, starting at 1 when the record is created.
    pub version: u64,
    /// The record itself.
    pub record: T,
}

// =============================================================================
// Jobs
// =============================================================================

/// Status of the device-assignment portion of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    /// Assigned by the server, not yet picked up.
    Pending,
    /// Accepted by the agent.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Any status this agent does not understand.
    #[serde(other)]
    Unknown,
}

impl AssignmentStatus {
    /// Whether the status is final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

impl From<FunctionStatus> for AssignmentStatus {
    fn from(status: FunctionStatus) -> Self {
        match status {
            FunctionStatus::Running => Self::Running,
            FunctionStatus::Completed => Self::Completed,
            FunctionStatus::Failed => Self::Failed,
        }
    }
}

/// The per-device portion of a job, which is what the agent reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAssignment {
    /// Device-assignment identifier.
    #[serde(rename = "UUID")]
    pub assignment_id: AssignmentId,
    /// Assignment status.
    pub status: AssignmentStatus,
    /// When the agent accepted the job (epoch millis).
    #[serde(rename = "startTime", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    /// When the job reached a terminal status (epoch millis).
    #[serde(rename = "endTime", default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    /// Human-readable outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Fields the agent passes through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What a job asks the device to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Job type, e.g. `runFunction`.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Function to run for `runFunction` jobs.
    #[serde(rename = "functionName", default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    /// Parameters for the function.
    #[serde(
        rename = "functionParameterValues",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub parameter_values: Option<Map<String, Value>>,
    /// Fields the agent passes through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The interpreted action of a [`JobConfig`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobAction {
    /// Run a named function.
    RunFunction {
        /// Function name.
        function_name: String,
        /// Parameter values, possibly empty.
        parameter_values: Map<String, Value>,
    },
    /// A `runFunction` job without a function name.
    MissingFunctionName,
    /// A job type this agent cannot execute.
    Unknown(String),
}

impl JobConfig {
    /// Interpret the configuration. The type comparison is case-insensitive.
    #[must_use]
    pub fn action(&self) -> JobAction {
        if !self.kind.eq_ignore_ascii_case("runFunction") {
            return JobAction::Unknown(self.kind.clone());
        }
        match self.function_name.as_deref() {
            Some(name) if !name.is_empty() => JobAction::RunFunction {
                function_name: name.to_string(),
                parameter_values: self.parameter_values.clone().unwrap_or_default(),
            },
            _ => JobAction::MissingFunctionName,
        }
    }
}

/// A server-assigned unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job identifier.
    #[serde(rename = "UUID")]
    pub job_id: JobId,
    /// Device assignments; the server sends exactly one for the querying device.
    #[serde(default)]
    pub devices: Vec<DeviceAssignment>,
    /// What the job asks for.
    #[serde(rename = "jobConfig", default, skip_serializing_if = "Option::is_none")]
    pub config: Option<JobConfig>,
    /// Invocation started on behalf of this job, recorded locally.
    #[serde(
        rename = "agentFunctionInvocation",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub function_invocation: Option<InvocationId>,
    /// Fields the agent passes through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    /// The device assignment this agent works on.
    #[must_use]
    pub fn assignment(&self) -> Option<&DeviceAssignment> {
        self.devices.first()
    }

    /// Mutable access to the device assignment.
    pub fn assignment_mut(&mut self) -> Option<&mut DeviceAssignment> {
        self.devices.first_mut()
    }

    /// Read a job document as served by the server.
    ///
    /// A document whose configuration or assignment fields have unexpected
    /// shapes still yields a job, so that it can be failed and reported instead
    /// of being offered again on every poll. Only the identifiers are kept in
    /// that case and the configuration is dropped.
    ///
    /// # Errors
    ///
    /// Returns the original parse error if the job or assignment identifiers
    /// cannot be read.
    pub fn from_server(document: Value) -> Result<Self, serde_json::Error> {
        let strict = match serde_json::from_value::<Self>(document.clone()) {
            Ok(job) => return Ok(job),
            Err(e) => e,
        };
        let skeleton: JobSkeleton = serde_json::from_value(document).map_err(|_| strict)?;
        Ok(Self {
            job_id: skeleton.job_id,
            devices: skeleton
                .devices
                .into_iter()
                .map(|device| DeviceAssignment {
                    assignment_id: device.assignment_id,
                    status: serde_json::from_value(device.status)
                        .unwrap_or(AssignmentStatus::Unknown),
                    start_time: None,
                    end_time: None,
                    response: None,
                    extra: Map::new(),
                })
                .collect(),
            config: None,
            function_invocation: None,
            extra: Map::new(),
        })
    }
}

/// Identifiers of a job document that failed to parse in full.
#[derive(Deserialize)]
struct JobSkeleton {
    #[serde(rename = "UUID")]
    job_id: JobId,
    #[serde(default)]
    devices: Vec<AssignmentSkeleton>,
}

#[derive(Deserialize)]
struct AssignmentSkeleton {
    #[serde(rename = "UUID")]
    assignment_id: AssignmentId,
    #[serde(default)]
    status: Value,
}

// =============================================================================
// Functions
// =============================================================================

/// Status of a function invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionStatus {
    /// Executing, either in the agent or in a device application.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully or timed out.
    Failed,
}

impl FunctionStatus {
    /// Whether the status is final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse a status reported by a device application. Case-insensitive.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// The single in-flight function invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionRecord {
    /// Capability name.
    #[serde(rename = "functionName")]
    pub function_name: String,
    /// Parameter values, including `functionUuid`.
    #[serde(rename = "functionParameterValues", default)]
    pub parameter_values: Map<String, Value>,
    /// Current status.
    pub status: FunctionStatus,
    /// Start time (epoch millis).
    #[serde(rename = "startTime")]
    pub start_time: i64,
    /// End time (epoch millis), set on the terminal transition.
    #[serde(rename = "endTime", default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    /// Outcome text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Set once the finished-function event has been emitted for this record.
    #[serde(rename = "finishedEventSent", default, skip_serializing_if = "is_false")]
    pub finished_event_sent: bool,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_false(value: &bool) -> bool {
    !*value
}

impl FunctionRecord {
    /// The invocation identifier stored in the parameters, if any.
    #[must_use]
    pub fn invocation_id(&self) -> Option<InvocationId> {
        self.parameter_values
            .get(FUNCTION_UUID_KEY)
            .and_then(Value::as_str)
            .and_then(|s| InvocationId::new(s).ok())
    }

    /// Move to a terminal status, stamping the end time.
    pub fn finish(&mut self, status: FunctionStatus, response: Option<String>, now_millis: i64) {
        self.status = status;
        self.end_time = Some(now_millis);
        if response.is_some() {
            self.response = response;
        }
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// Server-visible description of a capability.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CapabilityDetails {
    /// Expected parameters and their input kinds.
    #[serde(rename = "functionParameters", default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    /// Short human label.
    #[serde(rename = "functionLabel", default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Longer description.
    #[serde(
        rename = "functionDescription",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<String>,
    /// Any additional fields an application supplies.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// =============================================================================
// Reboot marker
// =============================================================================

/// Written before a purposeful reboot so the next start can close the function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebootMarker {
    /// The reboot invocation.
    pub invocation_id: InvocationId,
    /// When the reboot was requested (epoch millis).
    pub requested_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_job() -> Value {
        json!({
            "UUID": "J1",
            "name": "nightly",
            "devices": [{"UUID": "A1", "status": "pending", "deviceUUID": "D1"}],
            "jobConfig": {
                "type": "runFunction",
                "functionName": "agent-action-runScriptBash",
                "functionParameterValues": {"script": "echo hi"}
            }
        })
    }

    #[test]
    fn job_parses_server_document() {
        let job: Job = serde_json::from_value(sample_job()).unwrap();
        assert_eq!(job.job_id.as_str(), "J1");
        let assignment = job.assignment().unwrap();
        assert_eq!(assignment.assignment_id.as_str(), "A1");
        assert_eq!(assignment.status, AssignmentStatus::Pending);
        assert_eq!(assignment.extra["deviceUUID"], "D1");
        assert_eq!(job.extra["name"], "nightly");
    }

    #[test]
    fn job_preserves_unknown_fields_on_write() {
        let job: Job = serde_json::from_value(sample_job()).unwrap();
        let back = serde_json::to_value(&job).unwrap();
        assert_eq!(back["name"], "nightly");
        assert_eq!(back["devices"][0]["deviceUUID"], "D1");
        assert!(back.get("agentFunctionInvocation").is_none());
    }

    #[test]
    fn malformed_job_config_keeps_identifiers() {
        let job = Job::from_server(json!({
            "UUID": "J1",
            "devices": [{"UUID": "A1", "status": "pending"}],
            "jobConfig": {"type": 5, "functionParameterValues": "x"}
        }))
        .unwrap();
        assert_eq!(job.job_id.as_str(), "J1");
        assert!(job.config.is_none());
        let assignment = job.assignment().unwrap();
        assert_eq!(assignment.assignment_id.as_str(), "A1");
        assert_eq!(assignment.status, AssignmentStatus::Pending);
    }

    #[test]
    fn well_formed_job_is_read_in_full() {
        let job = Job::from_server(sample_job()).unwrap();
        assert_eq!(job.extra["name"], "nightly");
        assert!(job.config.is_some());
    }

    #[test]
    fn job_without_identifier_is_unreadable() {
        assert!(Job::from_server(json!({"not": "a job"})).is_err());
    }

    #[test]
    fn run_function_action_is_case_insensitive() {
        let config: JobConfig = serde_json::from_value(json!({
            "type": "RUNFUNCTION",
            "functionName": "x"
        }))
        .unwrap();
        assert_eq!(
            config.action(),
            JobAction::RunFunction {
                function_name: "x".into(),
                parameter_values: Map::new()
            }
        );
    }

    #[test]
    fn unknown_and_incomplete_actions() {
        let unknown: JobConfig = serde_json::from_value(json!({"type": "unknownType"})).unwrap();
        assert_eq!(unknown.action(), JobAction::Unknown("unknownType".into()));

        let nameless: JobConfig = serde_json::from_value(json!({"type": "runFunction"})).unwrap();
        assert_eq!(nameless.action(), JobAction::MissingFunctionName);
    }

    #[test]
    fn unexpected_assignment_status_is_tolerated() {
        let status: AssignmentStatus = serde_json::from_value(json!("cancelled")).unwrap();
        assert_eq!(status, AssignmentStatus::Unknown);
    }

    #[test]
    fn function_status_parse() {
        assert_eq!(FunctionStatus::parse("Completed"), Some(FunctionStatus::Completed));
        assert_eq!(FunctionStatus::parse("done"), None);
    }

    #[test]
    fn function_record_invocation_and_finish() {
        let mut record = FunctionRecord {
            function_name: "x".into(),
            parameter_values: json!({"functionUuid": "inv-1"}).as_object().cloned().unwrap(),
            status: FunctionStatus::Running,
            start_time: 10,
            end_time: None,
            response: None,
            finished_event_sent: false,
        };
        assert_eq!(record.invocation_id().unwrap().as_str(), "inv-1");

        record.finish(FunctionStatus::Completed, Some("ok".into()), 20);
        assert_eq!(record.end_time, Some(20));
        assert_eq!(record.response.as_deref(), Some("ok"));

        let wire = serde_json::to_value(&record).unwrap();
        assert!(wire.get("finishedEventSent").is_none());
        assert_eq!(wire["status"], "completed");
    }

    #[test]
    fn capability_details_keep_free_form_fields() {
        let details: CapabilityDetails = serde_json::from_value(json!({"a": 1})).unwrap();
        assert_eq!(details.extra["a"], 1);
        assert_eq!(serde_json::to_value(&details).unwrap(), json!({"a": 1}));
    }
}
