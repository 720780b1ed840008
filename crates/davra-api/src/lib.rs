//! Client for the Davra server REST API.
//!
//! The agent talks to the server through the [`ServerApi`] trait. Every call is
//! bearer-token authenticated JSON over HTTPS.
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | [`ServerApi::fetch_pending_jobs`] | `PUT /api/v1/jobs` |
//! | [`ServerApi::update_job_assignment`] | `PUT /api/v1/jobs/{job}/{assignment}` |
//! | [`ServerApi::send_iot_data`] | `PUT /api/v1/iotdata` |
//! | [`ServerApi::update_device`] | `PUT /api/v1/devices/{device}` |
//! | [`ServerApi::device_labels`] | `GET /api/v1/devices/{device}` |
//! | [`ServerApi::whoami`] | `GET /user` |
//!
//! A request that never gets an answer surfaces as [`ApiError::Unreachable`]; an
//! answer with a failure status surfaces as [`ApiError::Status`]. Callers log and
//! retry on their next natural cycle.
//!
//! # Testing
//!
//! Enable the `test-utils` feature for [`MockServerApi`], which records every
//! call and serves queued pending jobs.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod http;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

use std::time::Duration;

use async_trait::async_trait;
use davra_core::{DeviceId, JobId};
use davra_store::{DeviceAssignment, Job};
use serde_json::{Map, Value};

pub use error::{ApiError, Result};
pub use http::HttpServerApi;
pub use types::{DeviceUpdate, IotDatum, MsgType, UserInfo};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{ApiCall, MockServerApi};

/// Connection settings for the server API.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Server base URL, e.g. `https://acme.davra.com`.
    pub server_url: String,
    /// Bearer token of this device.
    pub api_token: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl ApiConfig {
    /// Default per-request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

    /// Create a configuration with the default timeout.
    #[must_use]
    pub fn new(server_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            api_token: api_token.into(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Build a full URL for an API path.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url.trim_end_matches('/'))
    }
}

/// Operations the agent performs against the server.
///
/// This trait abstracts the HTTP client, allowing for mock implementations in
/// tests.
#[async_trait]
pub trait ServerApi: Send + Sync {
    /// Query the oldest pending job assigned to this device.
    ///
    /// Returns an empty list when nothing is pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body is not a JSON array.
    async fn fetch_pending_jobs(&self, device_id: &DeviceId) -> Result<Vec<Job>>;

    /// Send the device-assignment portion of a job back to the server.
    ///
    /// # Errors
    ///
    /// Returns an error unless the server acknowledges the update.
    async fn update_job_assignment(
        &self,
        job_id: &JobId,
        assignment: &DeviceAssignment,
    ) -> Result<()>;

    /// Ingest telemetry records and events.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn send_iot_data(&self, data: &[IotDatum]) -> Result<()>;

    /// Update device metadata (capabilities or labels).
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn update_device(&self, device_id: &DeviceId, update: &DeviceUpdate) -> Result<()>;

    /// Current labels of the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the device is unknown.
    async fn device_labels(&self, device_id: &DeviceId) -> Result<Map<String, Value>>;

    /// Resolve the bearer token to the device it belongs to.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the token is rejected.
    async fn whoami(&self) -> Result<UserInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_without_double_slash() {
        let config = ApiConfig::new("https://example.davra.com/", "token");
        assert_eq!(
            config.url("/api/v1/iotdata"),
            "https://example.davra.com/api/v1/iotdata"
        );
    }
}
