//! Job lifecycle manager.
//!
//! A job wraps one function invocation requested by the server. Its device
//! assignment moves `pending → running → completed | failed` and is reported
//! back once terminal. The persisted job is removed only after the server
//! acknowledges the report, so an unreachable server means a retry on the next
//! tick rather than a lost result.

use std::sync::Arc;

use davra_api::ServerApi;
use davra_core::{Clock, DeviceId, JobId};
use davra_store::{AssignmentStatus, Job, JobAction, StateStore, StoreError, Versioned};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::dispatcher::{ensure_invocation_id, FinishedFunction, FunctionDispatcher, RunOutcome};
use crate::error::Result;
use crate::lifecycle::validate_assignment_transition;
use crate::registry::CapabilityRegistry;
use crate::telemetry;

/// Response recorded for a job configuration the agent does not understand.
pub const UNKNOWN_JOB_TYPE: &str = "Unknown job type";

/// Response recorded for a running job whose function disappeared.
pub const ORPHANED_JOB: &str = "Job function is no longer running";

/// Result of offering a job to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Persisted and dispatched (or failed and reported).
    Accepted(JobId),
    /// A job is already in progress.
    Busy,
    /// A standalone function is running; the job stays pending on the server.
    Deferred,
    /// The job cannot be run on this device.
    Rejected,
}

/// Owns the single persisted job.
pub struct JobManager {
    store: Arc<dyn StateStore>,
    api: Arc<dyn ServerApi>,
    clock: Arc<dyn Clock>,
    device_id: DeviceId,
}

impl JobManager {
    /// Create a manager.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        api: Arc<dyn ServerApi>,
        clock: Arc<dyn Clock>,
        device_id: DeviceId,
    ) -> Self {
        Self {
            store,
            api,
            clock,
            device_id,
        }
    }

    /// Whether a job record exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn is_busy(&self) -> Result<bool> {
        Ok(self.store.load_job()?.is_some())
    }

    /// Fetch the oldest pending job and accept it.
    ///
    /// Does nothing while a job is already persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the server or the store fails.
    pub async fn check_for_pending(
        &self,
        dispatcher: &FunctionDispatcher,
        registry: &CapabilityRegistry,
    ) -> Result<Option<AcceptOutcome>> {
        if self.is_busy()? {
            debug!("Job in progress, not polling for another");
            return Ok(None);
        }
        let jobs = self.api.fetch_pending_jobs(&self.device_id).await?;
        let Some(job) = jobs.into_iter().next() else {
            debug!("No pending jobs");
            return Ok(None);
        };
        self.accept(dispatcher, registry, job).await.map(Some)
    }

    /// Take on `job`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn accept(
        &self,
        dispatcher: &FunctionDispatcher,
        registry: &CapabilityRegistry,
        mut job: Job,
    ) -> Result<AcceptOutcome> {
        let job_id = job.job_id.clone();
        if let Some(current) = self.store.load_job()? {
            info!(
                job_id = %job_id,
                current = %current.record.job_id,
                "Already running a job, ignoring"
            );
            return Ok(AcceptOutcome::Busy);
        }
        if dispatcher.is_busy()? {
            info!(job_id = %job_id, "Function in progress, leaving job pending");
            return Ok(AcceptOutcome::Deferred);
        }

        let now = self.clock.now_millis();
        let Some(assignment) = job.assignment_mut() else {
            warn!(job_id = %job_id, "Job has no device assignment");
            return Ok(AcceptOutcome::Rejected);
        };
        match validate_assignment_transition(assignment.status, AssignmentStatus::Running) {
            Ok(status) => assignment.status = status,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Job is not pending");
                return Ok(AcceptOutcome::Rejected);
            }
        }
        assignment.start_time = Some(now);

        // The invocation is fixed before anything is persisted so that the job
        // always names the function it waits for.
        let action = match job
            .config
            .as_ref()
            .map_or_else(|| JobAction::Unknown(String::new()), davra_store::JobConfig::action)
        {
            JobAction::RunFunction {
                function_name,
                mut parameter_values,
            } => {
                job.function_invocation = Some(ensure_invocation_id(&mut parameter_values));
                JobAction::RunFunction {
                    function_name,
                    parameter_values,
                }
            }
            other => other,
        };

        let created = match self.store.create_job(&job) {
            Ok(created) => created,
            Err(StoreError::AlreadyExists) => return Ok(AcceptOutcome::Busy),
            Err(e) => return Err(e.into()),
        };
        info!(job_id = %job_id, "Job accepted");

        let failure = match action {
            JobAction::RunFunction {
                function_name,
                parameter_values,
            } => {
                self.dispatch(dispatcher, registry, created, &function_name, parameter_values)
                    .await?
            }
            JobAction::MissingFunctionName => Some((created, "Job names no function to run".to_string())),
            JobAction::Unknown(kind) => {
                warn!(job_id = %job_id, kind = %kind, "Unknown job type");
                Some((created, UNKNOWN_JOB_TYPE.to_string()))
            }
        };

        if let Some((current, response)) = failure {
            self.fail(current, response)?;
            self.report_logged().await;
        }
        Ok(AcceptOutcome::Accepted(job_id))
    }

    /// Run the job's function. Returns the job and a response if it must fail.
    async fn dispatch(
        &self,
        dispatcher: &FunctionDispatcher,
        registry: &CapabilityRegistry,
        current: Versioned<Job>,
        function_name: &str,
        parameter_values: Map<String, Value>,
    ) -> Result<Option<(Versioned<Job>, String)>> {
        let outcome = match dispatcher.run(registry, function_name, parameter_values).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(job_id = %current.record.job_id, error = %e, "Job dispatch failed");
                return Ok(Some((current, format!("Job dispatch failed: {e}"))));
            }
        };
        match outcome {
            RunOutcome::Started(invocation_id) | RunOutcome::Rejected(invocation_id) => {
                debug!(
                    job_id = %current.record.job_id,
                    invocation_id = %invocation_id,
                    "Job function dispatched"
                );
                Ok(None)
            }
            RunOutcome::Busy => Ok(Some((
                current,
                "Another function is already running".to_string(),
            ))),
        }
    }

    fn fail(&self, current: Versioned<Job>, response: String) -> Result<()> {
        let mut job = current.record;
        let now = self.clock.now_millis();
        if let Some(assignment) = job.assignment_mut() {
            assignment.status =
                validate_assignment_transition(assignment.status, AssignmentStatus::Failed)?;
            assignment.end_time = Some(now);
            assignment.response = Some(response);
        }
        self.store.update_job(current.version, &job)?;
        info!(job_id = %job.job_id, "Job failed");
        Ok(())
    }

    /// Copy a finished function's outcome into the job that started it.
    ///
    /// Returns `false` when there is no job or the function was not the job's.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn on_function_finished(&self, finished: &FinishedFunction) -> Result<bool> {
        let Some(current) = self.store.load_job()? else {
            return Ok(false);
        };
        let adopted = match (&current.record.function_invocation, &finished.invocation_id) {
            (Some(expected), Some(actual)) if expected == actual => false,
            (None, _) => true,
            _ => {
                debug!(job_id = %current.record.job_id, "Finished function does not belong to the job");
                return Ok(false);
            }
        };

        let job_id = current.record.job_id.clone();
        let mut job = current.record;
        let Some(assignment) = job.assignment_mut() else {
            return Ok(false);
        };
        if assignment.status.is_terminal() {
            return Ok(false);
        }
        if adopted {
            info!(job_id = %job_id, "Job adopts the finished function");
        }
        assignment.status =
            validate_assignment_transition(assignment.status, finished.record.status.into())?;
        assignment.response.clone_from(&finished.record.response);
        assignment.end_time = Some(
            finished
                .record
                .end_time
                .unwrap_or_else(|| self.clock.now_millis()),
        );
        let status = assignment.status;
        self.store.update_job(current.version, &job)?;
        info!(job_id = %job.job_id, status = status.as_str(), "Job finished");
        Ok(true)
    }

    /// Fail a running job whose function record no longer exists.
    ///
    /// Covers a restart between persisting the job and its function, or a
    /// function that was consumed without reaching the job. Returns `true` if
    /// the job was failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn release_orphaned(&self, dispatcher: &FunctionDispatcher) -> Result<bool> {
        let Some(current) = self.store.load_job()? else {
            return Ok(false);
        };
        let running = current
            .record
            .assignment()
            .is_some_and(|a| !a.status.is_terminal());
        if !running || dispatcher.is_busy()? {
            return Ok(false);
        }
        warn!(job_id = %current.record.job_id, "Job function is gone, failing the job");
        self.fail(current, ORPHANED_JOB.to_string())?;
        self.report_logged().await;
        Ok(true)
    }

    /// Report the job if it is terminal.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn poll_terminal(&self) -> Result<bool> {
        let terminal = self
            .store
            .load_job()?
            .and_then(|current| current.record.assignment().map(|a| a.status.is_terminal()))
            .unwrap_or(false);
        if terminal {
            self.report().await
        } else {
            Ok(false)
        }
    }

    /// Send the terminal assignment to the server and clear the job once it is
    /// acknowledged.
    ///
    /// Returns `true` if the job was reported and cleared. Without a terminal
    /// job this does nothing; a failed update leaves the job for the next poll.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn report(&self) -> Result<bool> {
        let Some(current) = self.store.load_job()? else {
            debug!("No job to report");
            return Ok(false);
        };
        let job = current.record;
        let Some(assignment) = job.assignment() else {
            warn!(job_id = %job.job_id, "Dropping job without a device assignment");
            self.store.clear_job()?;
            return Ok(false);
        };
        if !assignment.status.is_terminal() {
            return Ok(false);
        }

        if let Err(e) = self.api.update_job_assignment(&job.job_id, assignment).await {
            warn!(job_id = %job.job_id, error = %e, "Job report failed, will retry");
            return Ok(false);
        }
        let event = telemetry::job_finished(&self.device_id, assignment);
        if let Err(e) = self.api.send_iot_data(&[event]).await {
            warn!(job_id = %job.job_id, error = %e, "Job finished event not delivered");
        }
        self.store.clear_job()?;
        info!(
            job_id = %job.job_id,
            status = assignment.status.as_str(),
            "Job reported"
        );
        Ok(true)
    }

    async fn report_logged(&self) {
        if let Err(e) = self.report().await {
            warn!(error = %e, "Job report failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherSettings;
    use crate::intent::AgentHandle;
    use davra_api::MockServerApi;
    use davra_bus::{AgentPublisher, RecordingTransport};
    use davra_core::ManualClock;
    use davra_store::{CapabilityDetails, ConfigStore, FunctionStatus, MemoryStore};
    use serde_json::json;

    struct Fixture {
        jobs: JobManager,
        dispatcher: FunctionDispatcher,
        registry: CapabilityRegistry,
        store: Arc<MemoryStore>,
        api: Arc<MockServerApi>,
    }

    async fn setup() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let api = Arc::new(MockServerApi::new());
        let clock = Arc::new(ManualClock::new(5_000));
        let config = Arc::new(ConfigStore::in_memory(Map::new()));
        let device_id = DeviceId::new("D1").unwrap();
        let (handle, _intents) = AgentHandle::channel(8);

        let mut registry = CapabilityRegistry::load(config.clone(), api.clone(), device_id.clone());
        registry
            .register("x", CapabilityDetails::default())
            .await
            .unwrap();
        let dispatcher = FunctionDispatcher::new(
            store.clone(),
            api.clone(),
            config,
            AgentPublisher::new(Arc::new(RecordingTransport::new()), "1.8.0"),
            clock.clone(),
            handle,
            reqwest::Client::new(),
            DispatcherSettings {
                device_id: device_id.clone(),
                script_max_time_secs: 600,
                scratch_dir: std::env::temp_dir(),
                apps_dir: std::env::temp_dir(),
                reboot_command: "true".into(),
            },
        );
        let jobs = JobManager::new(store.clone(), api.clone(), clock, device_id);
        Fixture {
            jobs,
            dispatcher,
            registry,
            store,
            api,
        }
    }

    fn job(id: &str, config: Value) -> Job {
        serde_json::from_value(json!({
            "UUID": id,
            "devices": [{"UUID": format!("A-{id}"), "status": "pending"}],
            "jobConfig": config,
        }))
        .unwrap()
    }

    fn run_x(id: &str) -> Job {
        job(id, json!({"type": "runFunction", "functionName": "x"}))
    }

    #[tokio::test]
    async fn accepted_job_runs_its_function() {
        let f = setup().await;
        let outcome = f
            .jobs
            .accept(&f.dispatcher, &f.registry, run_x("J1"))
            .await
            .unwrap();
        assert_eq!(outcome, AcceptOutcome::Accepted(JobId::new("J1").unwrap()));

        let stored = f.store.load_job().unwrap().unwrap().record;
        let assignment = stored.assignment().unwrap();
        assert_eq!(assignment.status, AssignmentStatus::Running);
        assert_eq!(assignment.start_time, Some(5_000));

        let function = f.store.load_function().unwrap().unwrap().record;
        assert_eq!(stored.function_invocation, function.invocation_id());
    }

    #[tokio::test]
    async fn at_most_one_job() {
        let f = setup().await;
        f.jobs
            .accept(&f.dispatcher, &f.registry, run_x("J1"))
            .await
            .unwrap();
        let second = f
            .jobs
            .accept(&f.dispatcher, &f.registry, run_x("J2"))
            .await
            .unwrap();
        assert_eq!(second, AcceptOutcome::Busy);
        assert_eq!(
            f.store.load_job().unwrap().unwrap().record.job_id.as_str(),
            "J1"
        );
    }

    #[tokio::test]
    async fn standalone_function_defers_jobs() {
        let f = setup().await;
        f.dispatcher.run(&f.registry, "x", Map::new()).await.unwrap();
        let outcome = f
            .jobs
            .accept(&f.dispatcher, &f.registry, run_x("J1"))
            .await
            .unwrap();
        assert_eq!(outcome, AcceptOutcome::Deferred);
        assert!(!f.jobs.is_busy().unwrap());
    }

    #[tokio::test]
    async fn unknown_type_fails_and_reports() {
        let f = setup().await;
        f.jobs
            .accept(&f.dispatcher, &f.registry, job("J1", json!({"type": "unknownType"})))
            .await
            .unwrap();

        assert!(f.store.load_function().unwrap().is_none());
        assert!(f.store.load_job().unwrap().is_none());
        let updates = f.api.assignment_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.status, AssignmentStatus::Failed);
        assert_eq!(updates[0].1.response.as_deref(), Some(UNKNOWN_JOB_TYPE));
        assert_eq!(f.api.events_named(telemetry::JOB_FINISHED).len(), 1);
    }

    #[tokio::test]
    async fn missing_function_name_fails() {
        let f = setup().await;
        f.api.set_reject_assignment_updates(true);
        f.jobs
            .accept(&f.dispatcher, &f.registry, job("J1", json!({"type": "runFunction"})))
            .await
            .unwrap();
        let stored = f.store.load_job().unwrap().unwrap().record;
        assert_eq!(stored.assignment().unwrap().status, AssignmentStatus::Failed);
    }

    #[tokio::test]
    async fn function_outcome_flows_into_job() {
        let f = setup().await;
        f.jobs
            .accept(&f.dispatcher, &f.registry, run_x("J1"))
            .await
            .unwrap();
        let mut function = f.store.load_function().unwrap().unwrap();
        function
            .record
            .finish(FunctionStatus::Completed, Some("ok".into()), 6_000);
        f.store
            .update_function(function.version, &function.record)
            .unwrap();

        let finished = f.dispatcher.poll_finished().await.unwrap().unwrap();
        assert!(f.jobs.on_function_finished(&finished).unwrap());
        assert!(f.jobs.poll_terminal().await.unwrap());

        let updates = f.api.assignment_updates();
        assert_eq!(updates[0].0.as_str(), "J1");
        assert_eq!(updates[0].1.status, AssignmentStatus::Completed);
        assert_eq!(updates[0].1.response.as_deref(), Some("ok"));
        assert_eq!(updates[0].1.end_time, Some(6_000));
        assert!(!f.jobs.is_busy().unwrap());
    }

    fn running(mut job: Job, invocation: Option<&str>) -> Job {
        job.assignment_mut().unwrap().status = AssignmentStatus::Running;
        job.function_invocation = invocation.map(|id| davra_core::InvocationId::new(id).unwrap());
        job
    }

    #[tokio::test]
    async fn job_names_its_invocation_when_persisted() {
        let f = setup().await;
        f.jobs
            .accept(&f.dispatcher, &f.registry, run_x("J1"))
            .await
            .unwrap();
        // Written once: the invocation is part of the created record.
        let stored = f.store.load_job().unwrap().unwrap();
        assert_eq!(stored.version, 1);
        let function = f.store.load_function().unwrap().unwrap().record;
        assert_eq!(stored.record.function_invocation, function.invocation_id());
    }

    #[tokio::test]
    async fn job_without_invocation_adopts_the_finished_function() {
        let f = setup().await;
        f.store.create_job(&running(run_x("J1"), None)).unwrap();
        f.dispatcher.run(&f.registry, "x", Map::new()).await.unwrap();
        let mut function = f.store.load_function().unwrap().unwrap();
        function
            .record
            .finish(FunctionStatus::Completed, Some("ok".into()), 6_000);
        f.store
            .update_function(function.version, &function.record)
            .unwrap();

        let finished = f.dispatcher.poll_finished().await.unwrap().unwrap();
        assert!(f.jobs.on_function_finished(&finished).unwrap());
        f.dispatcher.consume(&finished).unwrap();
        assert!(f.jobs.poll_terminal().await.unwrap());
        assert_eq!(f.api.assignment_updates()[0].1.status, AssignmentStatus::Completed);

        // The slot is free again.
        f.api.push_pending_jobs(vec![run_x("J2")]);
        let outcome = f
            .jobs
            .check_for_pending(&f.dispatcher, &f.registry)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Some(AcceptOutcome::Accepted(JobId::new("J2").unwrap()))
        );
    }

    #[tokio::test]
    async fn running_job_without_function_is_failed() {
        let f = setup().await;
        f.store
            .create_job(&running(run_x("J1"), Some("gone")))
            .unwrap();

        assert!(f.jobs.release_orphaned(&f.dispatcher).await.unwrap());
        let updates = f.api.assignment_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.status, AssignmentStatus::Failed);
        assert_eq!(updates[0].1.response.as_deref(), Some(ORPHANED_JOB));
        assert!(!f.jobs.is_busy().unwrap());
    }

    #[tokio::test]
    async fn job_with_live_function_is_not_orphaned() {
        let f = setup().await;
        f.jobs
            .accept(&f.dispatcher, &f.registry, run_x("J1"))
            .await
            .unwrap();
        assert!(!f.jobs.release_orphaned(&f.dispatcher).await.unwrap());
        assert!(f.api.assignment_updates().is_empty());
    }

    #[tokio::test]
    async fn unrelated_function_does_not_touch_job() {
        let f = setup().await;
        f.jobs
            .accept(&f.dispatcher, &f.registry, run_x("J1"))
            .await
            .unwrap();
        let finished = FinishedFunction {
            invocation_id: Some(davra_core::InvocationId::new("other").unwrap()),
            record: f.store.load_function().unwrap().unwrap().record,
        };
        assert!(!f.jobs.on_function_finished(&finished).unwrap());
    }

    #[tokio::test]
    async fn report_is_idempotent() {
        let f = setup().await;
        f.jobs
            .accept(&f.dispatcher, &f.registry, job("J1", json!({"type": "bogus"})))
            .await
            .unwrap();
        assert_eq!(f.api.assignment_updates().len(), 1);

        assert!(!f.jobs.report().await.unwrap());
        assert!(!f.jobs.report().await.unwrap());
        assert_eq!(f.api.assignment_updates().len(), 1);
        assert_eq!(f.api.events_named(telemetry::JOB_FINISHED).len(), 1);
    }

    #[tokio::test]
    async fn failed_report_keeps_the_job() {
        let f = setup().await;
        f.api.set_unreachable(true);
        f.jobs
            .accept(&f.dispatcher, &f.registry, job("J1", json!({"type": "bogus"})))
            .await
            .unwrap();
        assert!(f.jobs.is_busy().unwrap());

        f.api.set_unreachable(false);
        assert!(f.jobs.poll_terminal().await.unwrap());
        assert!(!f.jobs.is_busy().unwrap());
    }

    #[tokio::test]
    async fn pending_poll_claims_first_job() {
        let f = setup().await;
        f.api.push_pending_jobs(vec![run_x("J1"), run_x("J2")]);
        let outcome = f
            .jobs
            .check_for_pending(&f.dispatcher, &f.registry)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Some(AcceptOutcome::Accepted(JobId::new("J1").unwrap()))
        );

        // Busy: the server is not asked again.
        let calls = f.api.calls().len();
        assert!(f
            .jobs
            .check_for_pending(&f.dispatcher, &f.registry)
            .await
            .unwrap()
            .is_none());
        assert_eq!(f.api.calls().len(), calls);
    }

    #[tokio::test]
    async fn jobs_without_assignment_are_rejected() {
        let f = setup().await;
        let job: Job = serde_json::from_value(json!({"UUID": "J1", "devices": []})).unwrap();
        let outcome = f.jobs.accept(&f.dispatcher, &f.registry, job).await.unwrap();
        assert_eq!(outcome, AcceptOutcome::Rejected);
        assert!(!f.jobs.is_busy().unwrap());
    }
}
