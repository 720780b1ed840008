//! `HttpServerApi` against a local mock HTTP server.

use std::time::Duration;

use davra_api::{ApiConfig, ApiError, DeviceUpdate, HttpServerApi, IotDatum, ServerApi};
use davra_core::{AssignmentId, DeviceId, JobId};
use davra_store::{AssignmentStatus, DeviceAssignment};
use serde_json::{json, Map};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> HttpServerApi {
    HttpServerApi::new(ApiConfig::new(server.uri(), "secret-token")).unwrap()
}

fn device() -> DeviceId {
    DeviceId::new("D1").unwrap()
}

#[tokio::test]
async fn fetch_pending_jobs_sends_query_and_parses_jobs() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/jobs"))
        .and(header("authorization", "Bearer secret-token"))
        .and(body_json(json!({
            "deviceUUID": "D1",
            "deviceStatus": "pending",
            "jobStatus": "active",
            "oldest": true
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "UUID": "J1",
                "devices": [{"UUID": "A1", "status": "pending"}],
                "jobConfig": {"type": "runFunction", "functionName": "x"}
            },
            {"not": "a job"}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let jobs = client(&server).fetch_pending_jobs(&device()).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_id.as_str(), "J1");
}

#[tokio::test]
async fn job_with_unreadable_config_is_still_returned() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/jobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "UUID": "J1",
            "devices": [{"UUID": "A1", "status": "pending"}],
            "jobConfig": {"type": 5}
        }])))
        .mount(&server)
        .await;

    let jobs = client(&server).fetch_pending_jobs(&device()).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_id.as_str(), "J1");
    assert!(jobs[0].config.is_none());
    assert_eq!(
        jobs[0].assignment().unwrap().status,
        AssignmentStatus::Pending
    );
}

#[tokio::test]
async fn empty_pending_list() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/jobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let jobs = client(&server).fetch_pending_jobs(&device()).await.unwrap();
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn assignment_update_targets_job_and_assignment() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/jobs/J1/A1"))
        .and(body_json(json!({
            "UUID": "A1",
            "status": "completed",
            "endTime": 20,
            "response": "hi"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let assignment = DeviceAssignment {
        assignment_id: AssignmentId::new("A1").unwrap(),
        status: AssignmentStatus::Completed,
        start_time: None,
        end_time: Some(20),
        response: Some("hi".into()),
        extra: Map::new(),
    };
    client(&server)
        .update_job_assignment(&JobId::new("J1").unwrap(), &assignment)
        .await
        .unwrap();
}

#[tokio::test]
async fn failure_status_is_reported_with_body() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/iotdata"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let datum = IotDatum::datum(&device(), "uptime", json!(12));
    let err = client(&server).send_iot_data(&[datum]).await.unwrap_err();
    match err {
        ApiError::Status { status, body } => {
            assert_eq!(status, 503);
            assert_eq!(body, "maintenance");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn unreachable_server_is_distinguished() {
    let config = ApiConfig {
        server_url: "http://127.0.0.1:9".into(),
        api_token: "t".into(),
        timeout: Duration::from_secs(2),
    };
    let api = HttpServerApi::new(config).unwrap();
    let err = api.fetch_pending_jobs(&device()).await.unwrap_err();
    assert!(matches!(err, ApiError::Unreachable(_)));
    assert!(err.is_retriable());
}

#[tokio::test]
async fn device_labels_and_update() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/devices/D1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "totalRecords": 1,
            "records": [{"UUID": "D1", "labels": {"site": "cork"}}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/devices/D1"))
        .and(body_json(json!({"labels": {"site": "cork", "davraAgentVersion": "1.8.0"}})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server);
    let mut labels = api.device_labels(&device()).await.unwrap();
    assert_eq!(labels["site"], "cork");
    labels.insert("davraAgentVersion".into(), json!("1.8.0"));
    api.update_device(&device(), &DeviceUpdate::labels(labels))
        .await
        .unwrap();
}

#[tokio::test]
async fn whoami_resolves_device() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"UUID": "D1", "name": "pi"})))
        .mount(&server)
        .await;

    let user = client(&server).whoami().await.unwrap();
    assert_eq!(user.device_id, device());
}
