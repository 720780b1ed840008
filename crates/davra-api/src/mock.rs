//! In-memory [`ServerApi`] that records every call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use davra_core::{DeviceId, JobId};
use davra_store::{DeviceAssignment, Job};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::{ApiError, Result};
use crate::types::{DeviceUpdate, IotDatum, UserInfo};
use crate::ServerApi;

/// A recorded server call.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    /// `fetch_pending_jobs`
    FetchPendingJobs(DeviceId),
    /// `update_job_assignment`
    UpdateJobAssignment {
        /// Job the update was for.
        job_id: JobId,
        /// Body sent.
        assignment: DeviceAssignment,
    },
    /// `send_iot_data`
    SendIotData(Vec<IotDatum>),
    /// `update_device`
    UpdateDevice {
        /// Device updated.
        device_id: DeviceId,
        /// Body sent.
        update: DeviceUpdate,
    },
    /// `device_labels`
    DeviceLabels(DeviceId),
    /// `whoami`
    Whoami,
}

/// A mock server that stores calls in memory.
#[derive(Default)]
pub struct MockServerApi {
    calls: Mutex<Vec<ApiCall>>,
    pending: Mutex<VecDeque<Vec<Job>>>,
    labels: Mutex<Map<String, Value>>,
    identity: Mutex<Option<DeviceId>>,
    unreachable: AtomicBool,
    reject_assignment_updates: AtomicBool,
}

impl MockServerApi {
    /// Create a new mock server.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the answer to the next pending-jobs query.
    pub fn push_pending_jobs(&self, jobs: Vec<Job>) {
        self.pending.lock().push_back(jobs);
    }

    /// Make every call fail with `ApiError::Unreachable`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make job assignment updates fail with a 500.
    pub fn set_reject_assignment_updates(&self, reject: bool) {
        self.reject_assignment_updates.store(reject, Ordering::SeqCst);
    }

    /// Set the labels returned by `device_labels`.
    pub fn set_labels(&self, labels: Map<String, Value>) {
        *self.labels.lock() = labels;
    }

    /// Set the device `whoami` resolves to.
    pub fn set_identity(&self, device_id: DeviceId) {
        *self.identity.lock() = Some(device_id);
    }

    /// Every call so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// All telemetry records sent, flattened.
    #[must_use]
    pub fn iot_data(&self) -> Vec<IotDatum> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ApiCall::SendIotData(data) => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Telemetry records with the given name.
    #[must_use]
    pub fn events_named(&self, name: &str) -> Vec<IotDatum> {
        self.iot_data()
            .into_iter()
            .filter(|datum| datum.name == name)
            .collect()
    }

    /// Job assignment updates sent.
    #[must_use]
    pub fn assignment_updates(&self) -> Vec<(JobId, DeviceAssignment)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ApiCall::UpdateJobAssignment { job_id, assignment } => {
                    Some((job_id.clone(), assignment.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Device updates sent.
    #[must_use]
    pub fn device_updates(&self) -> Vec<DeviceUpdate> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ApiCall::UpdateDevice { update, .. } => Some(update.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of capability reports sent.
    #[must_use]
    pub fn capability_report_count(&self) -> usize {
        self.device_updates()
            .iter()
            .filter(|update| update.capabilities.is_some())
            .count()
    }

    fn record(&self, call: ApiCall) -> Result<()> {
        self.calls.lock().push(call);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ApiError::Unreachable("mock server offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ServerApi for MockServerApi {
    async fn fetch_pending_jobs(&self, device_id: &DeviceId) -> Result<Vec<Job>> {
        self.record(ApiCall::FetchPendingJobs(device_id.clone()))?;
        Ok(self.pending.lock().pop_front().unwrap_or_default())
    }

    async fn update_job_assignment(
        &self,
        job_id: &JobId,
        assignment: &DeviceAssignment,
    ) -> Result<()> {
        self.record(ApiCall::UpdateJobAssignment {
            job_id: job_id.clone(),
            assignment: assignment.clone(),
        })?;
        if self.reject_assignment_updates.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 500,
                body: "rejected".into(),
            });
        }
        Ok(())
    }

    async fn send_iot_data(&self, data: &[IotDatum]) -> Result<()> {
        self.record(ApiCall::SendIotData(data.to_vec()))
    }

    async fn update_device(&self, device_id: &DeviceId, update: &DeviceUpdate) -> Result<()> {
        self.record(ApiCall::UpdateDevice {
            device_id: device_id.clone(),
            update: update.clone(),
        })
    }

    async fn device_labels(&self, device_id: &DeviceId) -> Result<Map<String, Value>> {
        self.record(ApiCall::DeviceLabels(device_id.clone()))?;
        Ok(self.labels.lock().clone())
    }

    async fn whoami(&self) -> Result<UserInfo> {
        self.record(ApiCall::Whoami)?;
        self.identity
            .lock()
            .clone()
            .map(|device_id| UserInfo {
                device_id,
                extra: Map::new(),
            })
            .ok_or_else(|| ApiError::Status {
                status: 401,
                body: "unknown token".into(),
            })
    }
}
