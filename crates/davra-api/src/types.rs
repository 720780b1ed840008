//! Request and response bodies of the server API.

use davra_core::DeviceId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of telemetry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgType {
    /// A numeric or structured measurement.
    Datum,
    /// Something that happened.
    Event,
}

/// One telemetry record for `PUT /api/v1/iotdata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IotDatum {
    /// Device the record belongs to.
    #[serde(rename = "UUID")]
    pub device_id: DeviceId,
    /// Metric or event name, e.g. `davra.job.finished`.
    pub name: String,
    /// Payload.
    pub value: Value,
    /// Datum or event.
    pub msg_type: MsgType,
    /// Epoch millis; the server stamps arrival time when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Indexing tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Map<String, Value>>,
    /// Additional fields forwarded verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IotDatum {
    /// A measurement.
    #[must_use]
    pub fn datum(device_id: &DeviceId, name: impl Into<String>, value: Value) -> Self {
        Self::new(device_id, name, value, MsgType::Datum)
    }

    /// An event.
    #[must_use]
    pub fn event(device_id: &DeviceId, name: impl Into<String>, value: Value) -> Self {
        Self::new(device_id, name, value, MsgType::Event)
    }

    fn new(device_id: &DeviceId, name: impl Into<String>, value: Value, msg_type: MsgType) -> Self {
        Self {
            device_id: device_id.clone(),
            name: name.into(),
            value,
            msg_type,
            timestamp: None,
            tags: None,
            extra: Map::new(),
        }
    }

    /// Attach a tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }
}

/// Body of `PUT /api/v1/jobs`.
#[derive(Debug, Serialize)]
pub(crate) struct PendingJobsQuery<'a> {
    #[serde(rename = "deviceUUID")]
    pub device_id: &'a DeviceId,
    #[serde(rename = "deviceStatus")]
    pub device_status: &'static str,
    #[serde(rename = "jobStatus")]
    pub job_status: &'static str,
    pub oldest: bool,
}

impl<'a> PendingJobsQuery<'a> {
    pub(crate) const fn oldest_pending(device_id: &'a DeviceId) -> Self {
        Self {
            device_id,
            device_status: "pending",
            job_status: "active",
            oldest: true,
        }
    }
}

/// Body of `PUT /api/v1/devices/{id}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DeviceUpdate {
    /// Replacement capability map.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Map<String, Value>>,
    /// Replacement label map.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Map<String, Value>>,
}

impl DeviceUpdate {
    /// Update the capability set.
    #[must_use]
    pub fn capabilities(capabilities: Map<String, Value>) -> Self {
        Self {
            capabilities: Some(capabilities),
            labels: None,
        }
    }

    /// Update the labels.
    #[must_use]
    pub fn labels(labels: Map<String, Value>) -> Self {
        Self {
            capabilities: None,
            labels: Some(labels),
        }
    }
}

/// Response of `GET /api/v1/devices/{id}`.
#[derive(Debug, Deserialize)]
pub(crate) struct DeviceRecords {
    #[serde(default)]
    pub records: Vec<DeviceRecord>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DeviceRecord {
    #[serde(default)]
    pub labels: Map<String, Value>,
}

/// Response of `GET /user` for a device token.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserInfo {
    /// The device the token belongs to.
    #[serde(rename = "UUID")]
    pub device_id: DeviceId,
    /// Remaining fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn datum_wire_shape() {
        let device = DeviceId::new("D1").unwrap();
        let datum = IotDatum::event(&device, "davra.job.finished", json!({"a": 1}))
            .with_tag("status", "completed");
        assert_eq!(
            serde_json::to_value(&datum).unwrap(),
            json!({
                "UUID": "D1",
                "name": "davra.job.finished",
                "value": {"a": 1},
                "msg_type": "event",
                "tags": {"status": "completed"}
            })
        );
    }

    #[test]
    fn pending_query_wire_shape() {
        let device = DeviceId::new("D1").unwrap();
        assert_eq!(
            serde_json::to_value(PendingJobsQuery::oldest_pending(&device)).unwrap(),
            json!({
                "deviceUUID": "D1",
                "deviceStatus": "pending",
                "jobStatus": "active",
                "oldest": true
            })
        );
    }

    #[test]
    fn device_update_omits_unset_parts() {
        let update = DeviceUpdate::labels(Map::new());
        assert_eq!(serde_json::to_value(&update).unwrap(), json!({"labels": {}}));
    }
}
