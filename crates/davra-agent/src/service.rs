//! The agent service.
//!
//! One task owns every piece of mutable agent state. The tick timer, the bus
//! forwarders and background handlers only submit [`Intent`]s; the service
//! applies them one at a time, so job and function records are never touched
//! concurrently.
//!
//! ```text
//!   interval (1s) ──┐
//!   local bus    ───┤   select!   ┌──► CapabilityRegistry
//!   cloud bus    ───┼──────────► AgentService ──► FunctionDispatcher ──► StateStore
//!   handlers     ───┘             └──► JobManager ─────────────────────► ServerApi
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use davra_api::{DeviceUpdate, IotDatum, ServerApi};
use davra_bus::{local, AgentPublisher, CloudMessage, FinishedFunctionReport, LocalMessage, Origin};
use davra_core::{Clock, AGENT_VERSION};
use davra_store::{ConfigStore, StateStore};
use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::AgentSettings;
use crate::control_loop::TickPlan;
use crate::dispatcher::{DispatcherSettings, FunctionDispatcher, RunOutcome};
use crate::error::{AgentError, Result};
use crate::intent::{AgentHandle, Intent};
use crate::jobs::{AcceptOutcome, JobManager};
use crate::metrics::MetricsSource;
use crate::registry::CapabilityRegistry;
use crate::telemetry;

/// Label merged into the device's labels at startup.
pub const VERSION_LABEL: &str = "davraAgentVersion";

// ============================================================================
// Construction
// ============================================================================

/// Collaborators the service is built from.
pub struct ServiceParts {
    /// Typed view of the configuration at startup.
    pub settings: AgentSettings,
    /// Durable configuration.
    pub config: Arc<ConfigStore>,
    /// Job and function records.
    pub store: Arc<dyn StateStore>,
    /// Server API.
    pub api: Arc<dyn ServerApi>,
    /// Publisher on the local bus.
    pub local: AgentPublisher,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Host metrics for the heartbeat.
    pub metrics: Arc<dyn MetricsSource>,
    /// HTTP client for bundle downloads.
    pub http: reqwest::Client,
}

/// Owns the agent state and applies intents in order.
pub struct AgentService {
    settings: AgentSettings,
    config: Arc<ConfigStore>,
    api: Arc<dyn ServerApi>,
    local: AgentPublisher,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSource>,
    registry: CapabilityRegistry,
    dispatcher: FunctionDispatcher,
    jobs: JobManager,
    config_changes: watch::Receiver<u64>,
    tick: u64,
}

impl AgentService {
    /// Assemble the service. Background handlers report back through `handle`.
    #[must_use]
    pub fn new(parts: ServiceParts, handle: AgentHandle) -> Self {
        let ServiceParts {
            settings,
            config,
            store,
            api,
            local,
            clock,
            metrics,
            http,
        } = parts;

        let registry =
            CapabilityRegistry::load(config.clone(), api.clone(), settings.device_id.clone());
        let dispatcher = FunctionDispatcher::new(
            store.clone(),
            api.clone(),
            config.clone(),
            local.clone(),
            clock.clone(),
            handle,
            http,
            DispatcherSettings {
                device_id: settings.device_id.clone(),
                script_max_time_secs: settings.script_max_time_secs,
                scratch_dir: settings.scratch_dir(),
                apps_dir: settings.apps_dir(),
                reboot_command: settings.reboot_command.clone(),
            },
        );
        let jobs = JobManager::new(store, api.clone(), clock.clone(), settings.device_id.clone());
        let config_changes = config.subscribe();

        Self {
            settings,
            config,
            api,
            local,
            clock,
            metrics,
            registry,
            dispatcher,
            jobs,
            config_changes,
            tick: 0,
        }
    }

    /// Current settings.
    #[must_use]
    pub const fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// The capability registry.
    #[must_use]
    pub const fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// One-off work before the loop starts.
    ///
    /// Registers the built-ins, completes a pending reboot, announces the start
    /// and checks the token's identity. Only the registry persist can fail;
    /// everything that talks to the server is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the built-in capabilities cannot be persisted.
    pub async fn startup(&mut self) -> Result<()> {
        info!(
            device_id = %self.settings.device_id,
            version = AGENT_VERSION,
            server = %self.settings.server_url,
            "Agent starting"
        );
        self.registry.register_builtins().await?;

        let uptime = self.metrics.sample().uptime_secs;
        match self.dispatcher.recover_after_reboot(uptime) {
            Ok(true) => log_step("reboot report", self.poll_function().await),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Reboot recovery failed"),
        }

        let started = telemetry::agent_started(&self.settings.device_id, &self.config.snapshot());
        if let Err(e) = self.api.send_iot_data(&[started]).await {
            warn!(error = %e, "Agent started event not delivered");
        }
        self.merge_version_label().await;
        self.check_identity().await;
        Ok(())
    }

    async fn merge_version_label(&self) {
        let device_id = &self.settings.device_id;
        let mut labels = match self.api.device_labels(device_id).await {
            Ok(labels) => labels,
            Err(e) => {
                warn!(error = %e, "Could not read device labels");
                return;
            }
        };
        if labels.get(VERSION_LABEL).and_then(Value::as_str) == Some(AGENT_VERSION) {
            debug!("Version label already current");
            return;
        }
        labels.insert(VERSION_LABEL.to_string(), Value::from(AGENT_VERSION));
        match self
            .api
            .update_device(device_id, &DeviceUpdate::labels(labels))
            .await
        {
            Ok(()) => debug!(version = AGENT_VERSION, "Version label updated"),
            Err(e) => warn!(error = %e, "Could not update device labels"),
        }
    }

    async fn check_identity(&self) {
        match self.api.whoami().await {
            Ok(user) if user.device_id == self.settings.device_id => {
                debug!("API token belongs to this device");
            }
            Ok(user) => warn!(
                configured = %self.settings.device_id,
                token_owner = %user.device_id,
                "API token belongs to a different device"
            ),
            Err(e) => warn!(error = %e, "Could not verify the API token"),
        }
    }

    // ========================================================================
    // Event loop
    // ========================================================================

    /// Run until a `Shutdown` intent arrives or every handle is dropped.
    ///
    /// A panic while handling one tick or intent is logged and the loop
    /// continues.
    pub async fn run(mut self, mut intents: mpsc::Receiver<Intent>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if AssertUnwindSafe(self.on_tick()).catch_unwind().await.is_err() {
                        error!(tick = self.tick, "Tick panicked");
                    }
                }
                intent = intents.recv() => {
                    let Some(intent) = intent else {
                        info!("All intent senders dropped");
                        break;
                    };
                    if matches!(intent, Intent::Shutdown) {
                        break;
                    }
                    match AssertUnwindSafe(self.handle_intent(intent)).catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!(error = %e, "Intent failed"),
                        Err(_) => error!("Intent handler panicked"),
                    }
                }
            }
        }
        info!("Agent stopped");
    }

    /// Run one control-loop tick.
    pub async fn on_tick(&mut self) {
        self.reload_settings();

        let function_active = self.dispatcher.is_busy().unwrap_or_else(|e| {
            warn!(error = %e, "Could not read function record");
            true
        });
        let job_active = self.jobs.is_busy().unwrap_or_else(|e| {
            warn!(error = %e, "Could not read job record");
            true
        });
        let tick = self.tick;
        self.tick = tick.wrapping_add(1);
        let plan = TickPlan::for_tick(
            tick,
            self.settings.heartbeat_interval_secs,
            function_active,
            job_active,
        );
        if plan.is_idle() {
            return;
        }
        debug!(tick, ?plan, "Tick");

        if plan.heartbeat {
            self.send_heartbeat().await;
            log_step("pending job poll", self.check_for_jobs().await);
        }
        if plan.poll_function {
            log_step("function poll", self.poll_function().await);
        }
        if plan.poll_job {
            log_step("job poll", self.poll_job().await);
        }
        if plan.report_capabilities {
            log_step("capability report", self.registry.report().await);
        }
    }

    /// Apply one intent.
    ///
    /// # Errors
    ///
    /// Returns the first store failure; server and bus failures are logged.
    pub async fn handle_intent(&mut self, intent: Intent) -> Result<()> {
        match intent {
            Intent::Local { origin, messages } => {
                for message in messages {
                    self.handle_local(&origin, message).await?;
                }
                Ok(())
            }
            Intent::Cloud(messages) => {
                for message in messages {
                    self.handle_cloud(message).await?;
                }
                Ok(())
            }
            Intent::HandlerFinished {
                invocation_id,
                outcome,
            } => {
                if self.dispatcher.complete_handler(&invocation_id, outcome)? {
                    self.poll_function().await?;
                }
                Ok(())
            }
            Intent::Shutdown => Ok(()),
        }
    }

    async fn handle_local(&mut self, origin: &Origin, message: LocalMessage) -> Result<()> {
        match message {
            LocalMessage::RegisterCapability { name, details } => {
                info!(%origin, capability = %name, "Application registering capability");
                self.registry.register(&name, details).await?;
            }
            LocalMessage::UnregisterCapability { name } => {
                info!(%origin, capability = %name, "Application removing capability");
                self.registry.unregister(&name).await?;
            }
            LocalMessage::RunFunction {
                name,
                parameter_values,
            } => {
                info!(%origin, function = %name, "Application requested a function");
                self.run_function(&name, parameter_values).await?;
            }
            LocalMessage::Connect { application } => {
                info!(application = %application, "Application connected");
                self.publish_local(local::heartbeat(self.clock.now_millis()))
                    .await;
            }
            LocalMessage::RetrieveConfig => {
                debug!(%origin, "Application requested configuration");
                self.publish_local(local::agent_config(self.config.snapshot()))
                    .await;
            }
            LocalMessage::FinishedFunction(report) => {
                self.finish_external(&origin.to_string(), &report).await?;
            }
            LocalMessage::SendIotData(data) => {
                self.forward_iot_data(data).await;
            }
        }
        Ok(())
    }

    async fn handle_cloud(&mut self, message: CloudMessage) -> Result<()> {
        match message {
            CloudMessage::CheckForJobs => {
                info!("Server announced pending jobs");
                self.check_for_jobs().await
            }
            CloudMessage::RunFunction {
                name,
                parameter_values,
            } => {
                info!(function = %name, "Server requested a function");
                self.run_function(&name, parameter_values).await
            }
        }
    }

    // ========================================================================
    // Steps
    // ========================================================================

    async fn run_function(&self, name: &str, parameter_values: Map<String, Value>) -> Result<()> {
        match self
            .dispatcher
            .run(&self.registry, name, parameter_values)
            .await?
        {
            RunOutcome::Busy => {
                info!(function = %name, "Function request ignored, another function is running");
                Ok(())
            }
            RunOutcome::Started(_) | RunOutcome::Rejected(_) => self.poll_function().await,
        }
    }

    async fn finish_external(&self, origin: &str, report: &FinishedFunctionReport) -> Result<()> {
        info!(%origin, function = %report.function_name, "Application finished a function");
        if self.dispatcher.report_external_completion(report)? {
            self.poll_function().await?;
        }
        Ok(())
    }

    async fn check_for_jobs(&self) -> Result<()> {
        match self
            .jobs
            .check_for_pending(&self.dispatcher, &self.registry)
            .await?
        {
            Some(AcceptOutcome::Accepted(job_id)) => {
                debug!(job_id = %job_id, "Job accepted");
                self.poll_function().await
            }
            Some(outcome) => {
                debug!(?outcome, "Pending job not started");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Observe a finished function, hand it to the job, and free the slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn poll_function(&self) -> Result<()> {
        let Some(finished) = self.dispatcher.poll_finished().await? else {
            return Ok(());
        };
        self.jobs.on_function_finished(&finished)?;
        self.dispatcher.consume(&finished)?;
        self.jobs.poll_terminal().await?;
        Ok(())
    }

    async fn poll_job(&self) -> Result<()> {
        if !self.jobs.release_orphaned(&self.dispatcher).await? {
            self.jobs.poll_terminal().await?;
        }
        Ok(())
    }

    async fn send_heartbeat(&self) {
        self.publish_local(local::heartbeat(self.clock.now_millis()))
            .await;
        let batch = telemetry::heartbeat(
            &self.settings.device_id,
            &self.metrics.sample(),
            AGENT_VERSION,
            self.settings.heartbeat_interval_secs,
        );
        if let Err(e) = self.api.send_iot_data(&batch).await {
            warn!(error = %e, "Heartbeat not delivered");
        }
    }

    async fn forward_iot_data(&self, mut data: Map<String, Value>) {
        data.entry("UUID")
            .or_insert_with(|| Value::from(self.settings.device_id.as_str()));
        data.entry("timestamp")
            .or_insert_with(|| Value::from(self.clock.now_millis()));
        if !["name", "value", "msg_type"]
            .iter()
            .all(|key| data.contains_key(*key))
        {
            let data = Value::Object(data);
            warn!(data = %data, "Not forwarding incomplete telemetry");
            return;
        }
        let datum: IotDatum = match serde_json::from_value(Value::Object(data)) {
            Ok(datum) => datum,
            Err(e) => {
                warn!(error = %e, "Not forwarding malformed telemetry");
                return;
            }
        };
        debug!(name = %datum.name, "Forwarding application telemetry");
        if let Err(e) = self.api.send_iot_data(&[datum]).await {
            warn!(error = %e, "Application telemetry not delivered");
        }
    }

    async fn publish_local(&self, envelope: davra_bus::Envelope) {
        if let Err(e) = self.local.publish(envelope).await {
            warn!(error = %e, "Local bus publish failed");
        }
    }

    fn reload_settings(&mut self) {
        if !self.config_changes.has_changed().unwrap_or(false) {
            return;
        }
        self.config_changes.borrow_and_update();
        match AgentSettings::from_map(&self.config.snapshot()) {
            Ok(settings) => {
                let settings = settings.with_installation_dir(self.settings.installation_dir.clone());
                if settings.script_max_time_secs != self.settings.script_max_time_secs {
                    self.dispatcher
                        .set_script_max_time(settings.script_max_time_secs);
                }
                info!(
                    heartbeat_interval_secs = settings.heartbeat_interval_secs,
                    script_max_time_secs = settings.script_max_time_secs,
                    "Configuration reloaded"
                );
                self.settings = settings;
            }
            Err(e) => warn!(error = %e, "Keeping previous settings, configuration is invalid"),
        }
    }
}

fn log_step(step: &str, result: Result<()>) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_transient() => warn!(step, error = %e, "Step failed, will retry"),
        Err(AgentError::ShuttingDown) => debug!(step, "Step skipped during shutdown"),
        Err(e) => error!(step, error = %e, "Step failed"),
    }
}
