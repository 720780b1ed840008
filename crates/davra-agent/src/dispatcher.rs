//! Function dispatcher.
//!
//! Runs one function at a time and tracks it through its persisted record:
//!
//! ```text
//!   run ──► create record (running) ──┬─► unknown name      ──► failed
//!                                     ├─► inline built-in   ──► completed / failed
//!                                     ├─► background built-in ··► HandlerFinished intent
//!                                     └─► delegated         ··► device app reports back
//!
//!   poll_finished (every tick while a record exists)
//!     terminal            ──► finished event, hand to the job manager, then consume
//!     running past limit  ──► failed + finished event; consumed on the next poll
//! ```
//!
//! The record in the store is the only answer to "is a function running".

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use davra_api::ServerApi;
use davra_bus::{local, AgentPublisher, FinishedFunctionReport};
use davra_core::{Clock, DeviceId, InvocationId};
use davra_store::{
    ConfigStore, FunctionRecord, FunctionStatus, RebootMarker, StateStore, StoreError,
    FUNCTION_UUID_KEY,
};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::builtin::{self, reboot, BuiltinFunction, HandlerContext, HandlerOutcome};
use crate::error::Result;
use crate::intent::{AgentHandle, Intent};
use crate::lifecycle::validate_function_transition;
use crate::registry::{CapabilityRegistry, Executor};
use crate::telemetry;

/// Response recorded when a function name is not registered.
pub const NOT_A_CAPABILITY: &str = "not a recognized capability";

/// Result of asking the dispatcher to run a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The function is running or already finished.
    Started(InvocationId),
    /// The function was recorded as failed because nothing can execute it.
    Rejected(InvocationId),
    /// Another function is in progress; nothing was recorded.
    Busy,
}

impl RunOutcome {
    /// The invocation that was recorded, if any.
    #[must_use]
    pub const fn invocation_id(&self) -> Option<&InvocationId> {
        match self {
            Self::Started(id) | Self::Rejected(id) => Some(id),
            Self::Busy => None,
        }
    }
}

/// A terminal function, ready to be handed to the job manager.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedFunction {
    /// Invocation identifier, if the record carries one.
    pub invocation_id: Option<InvocationId>,
    /// The terminal record.
    pub record: FunctionRecord,
}

/// Settings the dispatcher needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Device identity.
    pub device_id: DeviceId,
    /// Script and function deadline.
    pub script_max_time_secs: u64,
    /// Scratch directory for scripts.
    pub scratch_dir: PathBuf,
    /// Bundle directory.
    pub apps_dir: PathBuf,
    /// Reboot command.
    pub reboot_command: String,
}

/// Executes functions and tracks the single in-flight invocation.
pub struct FunctionDispatcher {
    store: Arc<dyn StateStore>,
    publisher: AgentPublisher,
    clock: Arc<dyn Clock>,
    handle: AgentHandle,
    handlers: HandlerContext,
    script_max_time_secs: u64,
}

impl FunctionDispatcher {
    /// Create a dispatcher.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn StateStore>,
        api: Arc<dyn ServerApi>,
        config: Arc<ConfigStore>,
        publisher: AgentPublisher,
        clock: Arc<dyn Clock>,
        handle: AgentHandle,
        http: reqwest::Client,
        settings: DispatcherSettings,
    ) -> Self {
        let handlers = HandlerContext {
            config,
            api,
            device_id: settings.device_id,
            http,
            scratch_dir: settings.scratch_dir,
            apps_dir: settings.apps_dir,
            script_timeout: Duration::from_secs(settings.script_max_time_secs),
            reboot_command: settings.reboot_command,
            clock: clock.clone(),
        };
        Self {
            store,
            publisher,
            clock,
            handle,
            handlers,
            script_max_time_secs: settings.script_max_time_secs,
        }
    }

    /// Change the function deadline.
    pub fn set_script_max_time(&mut self, secs: u64) {
        self.script_max_time_secs = secs;
        self.handlers.script_timeout = Duration::from_secs(secs);
    }

    /// Whether a function record exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn is_busy(&self) -> Result<bool> {
        Ok(self.store.load_function()?.is_some())
    }

    /// Run `name` with `parameter_values`.
    ///
    /// Assigns `functionUuid` if absent and persists the record before anything
    /// executes.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be persisted.
    pub async fn run(
        &self,
        registry: &CapabilityRegistry,
        name: &str,
        mut parameter_values: Map<String, Value>,
    ) -> Result<RunOutcome> {
        if let Some(current) = self.store.load_function()? {
            warn!(
                function = name,
                running = %current.record.function_name,
                "Function already in progress, not starting another"
            );
            return Ok(RunOutcome::Busy);
        }

        let invocation_id = ensure_invocation_id(&mut parameter_values);
        let record = FunctionRecord {
            function_name: name.to_string(),
            parameter_values,
            status: FunctionStatus::Running,
            start_time: self.clock.now_millis(),
            end_time: None,
            response: None,
            finished_event_sent: false,
        };
        let created = match self.store.create_function(&record) {
            Ok(created) => created,
            Err(StoreError::AlreadyExists) => return Ok(RunOutcome::Busy),
            Err(e) => return Err(e.into()),
        };
        info!(function = name, invocation_id = %invocation_id, "Function started");

        let Some(executor) = registry.resolve(name) else {
            error!(
                function = name,
                known = ?registry.names(),
                "Function is not a recognized capability"
            );
            let mut failed = created.record;
            failed.finish(
                FunctionStatus::Failed,
                Some(NOT_A_CAPABILITY.to_string()),
                self.clock.now_millis(),
            );
            self.store.update_function(created.version, &failed)?;
            return Ok(RunOutcome::Rejected(invocation_id));
        };

        match executor {
            Executor::AgentNative(function) if function.runs_in_background() => {
                self.spawn_handler(function, invocation_id.clone(), &created.record)?;
            }
            Executor::AgentNative(function) => {
                let outcome = builtin::execute(
                    function,
                    &self.handlers,
                    &invocation_id,
                    &created.record.parameter_values,
                )
                .await;
                if let Some(outcome) = outcome {
                    self.complete_handler(&invocation_id, outcome)?;
                }
            }
            Executor::Delegated => {
                if let Err(e) = self
                    .publisher
                    .publish(local::function_invocation(&created.record))
                    .await
                {
                    warn!(
                        function = name,
                        error = %e,
                        "Could not publish function to applications, it will time out"
                    );
                }
            }
        }
        Ok(RunOutcome::Started(invocation_id))
    }

    fn spawn_handler(
        &self,
        function: BuiltinFunction,
        invocation_id: InvocationId,
        record: &FunctionRecord,
    ) -> Result<()> {
        if function == BuiltinFunction::RebootDevice {
            self.store.set_reboot_marker(&RebootMarker {
                invocation_id: invocation_id.clone(),
                requested_at: self.clock.now_millis(),
            })?;
        }
        let ctx = self.handlers.clone();
        let handle = self.handle.clone();
        let parameter_values = record.parameter_values.clone();
        tokio::spawn(async move {
            let outcome =
                builtin::execute(function, &ctx, &invocation_id, &parameter_values).await;
            if let Some(outcome) = outcome {
                let intent = Intent::HandlerFinished {
                    invocation_id,
                    outcome,
                };
                if handle.submit(intent).await.is_err() {
                    debug!(function = function.name(), "Agent stopped before handler finished");
                }
            }
        });
        Ok(())
    }

    /// Apply a built-in handler's outcome.
    ///
    /// Returns `false` if the record no longer belongs to `invocation_id` or is
    /// already terminal (it timed out first).
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn complete_handler(
        &self,
        invocation_id: &InvocationId,
        outcome: HandlerOutcome,
    ) -> Result<bool> {
        let Some(current) = self.store.load_function()? else {
            debug!(invocation_id = %invocation_id, "Handler finished after its function was cleared");
            return Ok(false);
        };
        if current.record.invocation_id().as_ref() != Some(invocation_id) {
            warn!(invocation_id = %invocation_id, "Handler finished for a different function");
            return Ok(false);
        }
        if current.record.status.is_terminal() {
            debug!(invocation_id = %invocation_id, "Handler finished after the function already ended");
            return Ok(false);
        }
        let status = validate_function_transition(current.record.status, outcome.status)?;

        let mut record = current.record;
        record.finish(status, outcome.response, self.clock.now_millis());
        self.store.update_function(current.version, &record)?;
        info!(
            function = %record.function_name,
            invocation_id = %invocation_id,
            status = status.as_str(),
            "Function finished"
        );
        Ok(true)
    }

    /// Merge a completion report from a device application.
    ///
    /// Returns `true` if the record became terminal. A report without a status
    /// only updates the response.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn report_external_completion(&self, report: &FinishedFunctionReport) -> Result<bool> {
        let Some(current) = self.store.load_function()? else {
            debug!(function = %report.function_name, "Completion report with no function running");
            return Ok(false);
        };
        if current.record.function_name != report.function_name {
            warn!(
                reported = %report.function_name,
                running = %current.record.function_name,
                "Completion report for a function that is not running"
            );
            return Ok(false);
        }
        if current.record.status.is_terminal() {
            debug!(function = %report.function_name, "Function already finished");
            return Ok(false);
        }

        let mut record = current.record;
        let terminal = match report.status {
            Some(status) if status.is_terminal() => {
                let status = validate_function_transition(record.status, status)?;
                record.finish(status, report.response.clone(), self.clock.now_millis());
                true
            }
            _ => {
                if report.response.is_none() {
                    return Ok(false);
                }
                record.response.clone_from(&report.response);
                false
            }
        };
        self.store.update_function(current.version, &record)?;
        info!(
            function = %record.function_name,
            status = record.status.as_str(),
            "Application reported function progress"
        );
        Ok(terminal)
    }

    /// Check the persisted function for completion or timeout.
    ///
    /// A terminal record is returned for the job manager and stays in the store
    /// until [`consume`](Self::consume). A record that ran past the deadline is
    /// failed here and returned by the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn poll_finished(&self) -> Result<Option<FinishedFunction>> {
        let Some(current) = self.store.load_function()? else {
            return Ok(None);
        };
        let invocation_id = current.record.invocation_id();

        if current.record.status.is_terminal() {
            if !current.record.finished_event_sent {
                self.emit_finished(invocation_id.as_ref(), &current.record).await;
            }
            return Ok(Some(FinishedFunction {
                invocation_id,
                record: current.record,
            }));
        }

        let now = self.clock.now_millis();
        let elapsed = now.saturating_sub(current.record.start_time);
        let limit = i64::try_from(self.script_max_time_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        if elapsed < limit {
            return Ok(None);
        }

        warn!(
            function = %current.record.function_name,
            elapsed_ms = elapsed,
            limit_secs = self.script_max_time_secs,
            "Function timed out"
        );
        let mut record = current.record;
        let status = validate_function_transition(record.status, FunctionStatus::Failed)?;
        record.finish(
            status,
            Some(format!("Timed out after {} seconds", self.script_max_time_secs)),
            now,
        );
        self.emit_finished(invocation_id.as_ref(), &record).await;
        record.finished_event_sent = true;
        self.store.update_function(current.version, &record)?;
        Ok(None)
    }

    /// Remove the finished function, freeing the slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn consume(&self, finished: &FinishedFunction) -> Result<bool> {
        let cleared = self.store.clear_function()?;
        if cleared {
            debug!(function = %finished.record.function_name, "Function record cleared");
        }
        Ok(cleared)
    }

    /// Complete a reboot function after the device came back.
    ///
    /// Returns `true` if a reboot was recovered.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn recover_after_reboot(&self, uptime_secs: u64) -> Result<bool> {
        let Some(marker) = self.store.take_reboot_marker()? else {
            return Ok(false);
        };
        let Some(current) = self.store.load_function()? else {
            debug!("Reboot marker without a function record");
            return Ok(false);
        };
        let is_reboot = current.record.function_name == BuiltinFunction::RebootDevice.name();
        if !is_reboot || current.record.invocation_id().as_ref() != Some(&marker.invocation_id) {
            warn!(
                function = %current.record.function_name,
                "Reboot marker does not match the current function"
            );
            return Ok(false);
        }
        info!(uptime_secs, "Back from a requested reboot");
        self.complete_handler(&marker.invocation_id, reboot::recovered(uptime_secs))
    }

    async fn emit_finished(&self, invocation_id: Option<&InvocationId>, record: &FunctionRecord) {
        let event = telemetry::function_finished(&self.handlers.device_id, invocation_id, record);
        if let Err(e) = self.handlers.api.send_iot_data(&[event]).await {
            warn!(function = %record.function_name, error = %e, "Function finished event not delivered");
        }
    }
}

/// The invocation id carried in `parameter_values`, generated and inserted if absent.
pub(crate) fn ensure_invocation_id(parameter_values: &mut Map<String, Value>) -> InvocationId {
    let existing = parameter_values
        .get(FUNCTION_UUID_KEY)
        .and_then(Value::as_str)
        .and_then(|s| InvocationId::new(s).ok());
    existing.unwrap_or_else(|| {
        let id = InvocationId::generate();
        parameter_values.insert(FUNCTION_UUID_KEY.to_string(), Value::String(id.to_string()));
        id
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use davra_api::MockServerApi;
    use davra_bus::{keys, RecordingTransport};
    use davra_core::ManualClock;
    use davra_store::{CapabilityDetails, MemoryStore};
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Fixture {
        dispatcher: FunctionDispatcher,
        registry: CapabilityRegistry,
        store: Arc<MemoryStore>,
        api: Arc<MockServerApi>,
        bus: Arc<RecordingTransport>,
        clock: Arc<ManualClock>,
        intents: mpsc::Receiver<Intent>,
        _dir: TempDir,
    }

    async fn setup() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let api = Arc::new(MockServerApi::new());
        let bus = Arc::new(RecordingTransport::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let config = Arc::new(ConfigStore::in_memory(Map::new()));
        let device_id = DeviceId::new("D1").unwrap();
        let (handle, intents) = AgentHandle::channel(8);

        let mut registry = CapabilityRegistry::load(config.clone(), api.clone(), device_id.clone());
        registry.register_builtins().await.unwrap();
        registry
            .register("app-action", CapabilityDetails::default())
            .await
            .unwrap();

        let dispatcher = FunctionDispatcher::new(
            store.clone(),
            api.clone(),
            config,
            AgentPublisher::new(bus.clone(), "1.8.0"),
            clock.clone(),
            handle,
            reqwest::Client::new(),
            DispatcherSettings {
                device_id,
                script_max_time_secs: 10,
                scratch_dir: dir.path().join("scratch"),
                apps_dir: dir.path().join("apps"),
                reboot_command: "true".into(),
            },
        );
        Fixture {
            dispatcher,
            registry,
            store,
            api,
            bus,
            clock,
            intents,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn assigns_invocation_id_when_absent() {
        let f = setup().await;
        let outcome = f
            .dispatcher
            .run(&f.registry, "app-action", Map::new())
            .await
            .unwrap();
        let id = outcome.invocation_id().unwrap().clone();

        let stored = f.store.load_function().unwrap().unwrap().record;
        assert_eq!(stored.invocation_id(), Some(id));
        assert_eq!(stored.status, FunctionStatus::Running);
        assert_eq!(stored.start_time, 1_000_000);
    }

    #[tokio::test]
    async fn keeps_supplied_invocation_id() {
        let f = setup().await;
        let params = json!({"functionUuid": "F1"}).as_object().cloned().unwrap();
        let outcome = f
            .dispatcher
            .run(&f.registry, "app-action", params)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Started(InvocationId::new("F1").unwrap()));
    }

    #[tokio::test]
    async fn at_most_one_function() {
        let f = setup().await;
        f.dispatcher
            .run(&f.registry, "app-action", Map::new())
            .await
            .unwrap();
        let second = f
            .dispatcher
            .run(&f.registry, "app-action", Map::new())
            .await
            .unwrap();
        assert_eq!(second, RunOutcome::Busy);
        assert!(f.dispatcher.is_busy().unwrap());
    }

    #[tokio::test]
    async fn unknown_capability_fails_immediately() {
        let f = setup().await;
        let outcome = f
            .dispatcher
            .run(&f.registry, "nope", Map::new())
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Rejected(_)));

        let stored = f.store.load_function().unwrap().unwrap().record;
        assert_eq!(stored.status, FunctionStatus::Failed);
        assert_eq!(stored.response.as_deref(), Some(NOT_A_CAPABILITY));
    }

    #[tokio::test]
    async fn delegated_functions_are_published() {
        let f = setup().await;
        let params = json!({"p": 1}).as_object().cloned().unwrap();
        f.dispatcher
            .run(&f.registry, "app-action", params)
            .await
            .unwrap();

        let sent = f.bus.envelopes_with(keys::FUNCTION_NAME);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].get_str(keys::FUNCTION_NAME), Some("app-action"));
        assert_eq!(sent[0].get_str(keys::STATUS), Some("running"));
        assert_eq!(sent[0].get(keys::FUNCTION_PARAMETER_VALUES).unwrap()["p"], 1);
    }

    #[tokio::test]
    async fn timeout_boundary() {
        let f = setup().await;
        f.dispatcher
            .run(&f.registry, "app-action", Map::new())
            .await
            .unwrap();

        f.clock.advance(9_999);
        assert!(f.dispatcher.poll_finished().await.unwrap().is_none());
        assert_eq!(
            f.store.load_function().unwrap().unwrap().record.status,
            FunctionStatus::Running
        );

        f.clock.advance(1);
        assert!(f.dispatcher.poll_finished().await.unwrap().is_none());
        let stored = f.store.load_function().unwrap().unwrap().record;
        assert_eq!(stored.status, FunctionStatus::Failed);
        assert!(stored.finished_event_sent);
        assert_eq!(f.api.events_named(telemetry::FUNCTION_FINISHED).len(), 1);

        // Consumed on the next poll without a second event.
        let finished = f.dispatcher.poll_finished().await.unwrap().unwrap();
        assert_eq!(finished.record.status, FunctionStatus::Failed);
        assert_eq!(f.api.events_named(telemetry::FUNCTION_FINISHED).len(), 1);
        assert!(f.dispatcher.consume(&finished).unwrap());
        assert!(!f.dispatcher.is_busy().unwrap());
    }

    #[tokio::test]
    async fn external_completion() {
        let f = setup().await;
        f.dispatcher
            .run(&f.registry, "app-action", Map::new())
            .await
            .unwrap();

        let wrong = FinishedFunctionReport {
            function_name: "other".into(),
            status: Some(FunctionStatus::Completed),
            response: None,
        };
        assert!(!f.dispatcher.report_external_completion(&wrong).unwrap());

        let progress = FinishedFunctionReport {
            function_name: "app-action".into(),
            status: None,
            response: Some("half way".into()),
        };
        assert!(!f.dispatcher.report_external_completion(&progress).unwrap());

        let done = FinishedFunctionReport {
            function_name: "app-action".into(),
            status: Some(FunctionStatus::Completed),
            response: Some("ok".into()),
        };
        assert!(f.dispatcher.report_external_completion(&done).unwrap());

        let finished = f.dispatcher.poll_finished().await.unwrap().unwrap();
        assert_eq!(finished.record.status, FunctionStatus::Completed);
        assert_eq!(finished.record.response.as_deref(), Some("ok"));
        assert_eq!(f.api.events_named(telemetry::FUNCTION_FINISHED).len(), 1);
    }

    #[tokio::test]
    async fn inline_builtins_finish_during_run() {
        let f = setup().await;
        f.dispatcher
            .run(&f.registry, BuiltinFunction::ReportAgentConfig.name(), Map::new())
            .await
            .unwrap();
        let stored = f.store.load_function().unwrap().unwrap().record;
        assert_eq!(stored.status, FunctionStatus::Completed);
        assert_eq!(f.api.events_named(telemetry::AGENT_CONFIGURED).len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn background_builtins_report_through_intents() {
        let mut f = setup().await;
        let params = json!({"script": "echo from-script"}).as_object().cloned().unwrap();
        let outcome = f
            .dispatcher
            .run(&f.registry, BuiltinFunction::RunScriptBash.name(), params)
            .await
            .unwrap();

        let Some(Intent::HandlerFinished {
            invocation_id,
            outcome: handler_outcome,
        }) = f.intents.recv().await
        else {
            panic!("expected a handler result");
        };
        assert_eq!(Some(&invocation_id), outcome.invocation_id());
        assert!(f
            .dispatcher
            .complete_handler(&invocation_id, handler_outcome)
            .unwrap());

        let stored = f.store.load_function().unwrap().unwrap().record;
        assert_eq!(stored.status, FunctionStatus::Completed);
        assert!(stored.response.unwrap().contains("from-script"));
    }

    #[tokio::test]
    async fn stale_handler_results_are_ignored() {
        let f = setup().await;
        f.dispatcher
            .run(&f.registry, "app-action", Map::new())
            .await
            .unwrap();
        let applied = f
            .dispatcher
            .complete_handler(
                &InvocationId::new("someone-else").unwrap(),
                HandlerOutcome::completed("late"),
            )
            .unwrap();
        assert!(!applied);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reboot_recovery() {
        let mut f = setup().await;
        let outcome = f
            .dispatcher
            .run(&f.registry, BuiltinFunction::RebootDevice.name(), Map::new())
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Started(_)));

        // The reboot command succeeded, so no outcome is submitted.
        assert!(tokio::time::timeout(Duration::from_millis(500), f.intents.recv())
            .await
            .is_err());

        assert!(f.dispatcher.recover_after_reboot(42).unwrap());
        let stored = f.store.load_function().unwrap().unwrap().record;
        assert_eq!(stored.status, FunctionStatus::Completed);
        assert_eq!(stored.response.as_deref(), Some("42"));
        assert!(!f.dispatcher.recover_after_reboot(42).unwrap());
    }
}
