//! `reqwest` implementation of [`ServerApi`].

use async_trait::async_trait;
use davra_core::{DeviceId, JobId};
use davra_store::{DeviceAssignment, Job};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{ApiError, Result};
use crate::types::{DeviceRecords, DeviceUpdate, IotDatum, PendingJobsQuery, UserInfo};
use crate::{ApiConfig, ServerApi};

/// HTTP client for the server API.
#[derive(Debug, Clone)]
pub struct HttpServerApi {
    client: reqwest::Client,
    config: ApiConfig,
}

impl HttpServerApi {
    /// Create a new client.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Client` if the HTTP client cannot be built.
    pub fn new(config: ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ApiError::Client(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Create a new client with a custom reqwest client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client, config: ApiConfig) -> Self {
        Self { client, config }
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &ApiConfig {
        &self.config
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .bearer_auth(&self.config.api_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| ApiError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ServerApi for HttpServerApi {
    async fn fetch_pending_jobs(&self, device_id: &DeviceId) -> Result<Vec<Job>> {
        let url = self.config.url("/api/v1/jobs");
        let query = PendingJobsQuery::oldest_pending(device_id);
        let response = self.send(self.client.put(&url).json(&query)).await?;
        let candidates: Vec<Value> = Self::json(response).await?;

        let jobs = candidates
            .into_iter()
            .filter_map(|candidate| match Job::from_server(candidate) {
                Ok(job) => Some(job),
                Err(e) => {
                    warn!(error = %e, "Skipping job without readable identifiers");
                    None
                }
            })
            .collect::<Vec<_>>();
        debug!(device_id = %device_id, count = jobs.len(), "Fetched pending jobs");
        Ok(jobs)
    }

    async fn update_job_assignment(
        &self,
        job_id: &JobId,
        assignment: &DeviceAssignment,
    ) -> Result<()> {
        let url = self.config.url(&format!(
            "/api/v1/jobs/{job_id}/{}",
            assignment.assignment_id
        ));
        self.send(self.client.put(&url).json(assignment)).await?;
        debug!(job_id = %job_id, status = assignment.status.as_str(), "Job assignment updated");
        Ok(())
    }

    async fn send_iot_data(&self, data: &[IotDatum]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let url = self.config.url("/api/v1/iotdata");
        self.send(self.client.put(&url).json(data)).await?;
        debug!(count = data.len(), "Telemetry sent");
        Ok(())
    }

    async fn update_device(&self, device_id: &DeviceId, update: &DeviceUpdate) -> Result<()> {
        let url = self.config.url(&format!("/api/v1/devices/{device_id}"));
        self.send(self.client.put(&url).json(update)).await?;
        Ok(())
    }

    async fn device_labels(&self, device_id: &DeviceId) -> Result<Map<String, Value>> {
        let url = self.config.url(&format!("/api/v1/devices/{device_id}"));
        let response = self.send(self.client.get(&url)).await?;
        let devices: DeviceRecords = Self::json(response).await?;
        devices
            .records
            .into_iter()
            .next()
            .map(|record| record.labels)
            .ok_or_else(|| ApiError::Decode(format!("device {device_id} not found")))
    }

    async fn whoami(&self) -> Result<UserInfo> {
        let url = self.config.url("/user");
        let response = self.send(self.client.get(&url)).await?;
        Self::json(response).await
    }
}
