//! REST binding against a mock Buildkite server.

use std::sync::Arc;

use buildkite_client::{ApiConfig, BuildkiteApi};
use serde_json::{json, Value};
use unblock_core::fakes::{fields, MemoryAgent};
use unblock_core::{
    ErrorKind, GateConfig, GateError, Job, ReleaseCoordinator, ReleaseFields, RemoteControlClient,
};
use wiremock::matchers::{bearer_token, body_json, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BUILD_PATH: &str = "/organizations/acme/pipelines/deploy/builds/42";

fn api(server: &MockServer) -> BuildkiteApi {
    BuildkiteApi::new(ApiConfig::new("acme", "s3cret").with_base_url(&server.uri())).unwrap()
}

fn manual_job(server: &MockServer, id: &str, step_key: &str, unblockable: bool) -> Value {
    json!({
        "id": id,
        "type": "manual",
        "step_key": step_key,
        "state": if unblockable { "blocked" } else { "unblocked" },
        "unblockable": unblockable,
        "unblock_url": format!("{}/jobs/{id}/unblock", server.uri()),
    })
}

async fn mount_build(server: &MockServer, jobs: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path(BUILD_PATH))
        .and(bearer_token("s3cret"))
        .and(header_exists("user-agent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "build-uuid",
            "number": 42,
            "jobs": jobs,
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn listing_keeps_only_unblockable_jobs() {
    let server = MockServer::start().await;
    mount_build(
        &server,
        vec![
            json!({ "id": "0", "type": "script", "step_key": "build", "state": "passed" }),
            manual_job(&server, "1", "deploy-a", true),
            manual_job(&server, "2", "deploy-b", false),
            json!({ "id": "3", "type": "waiter" }),
        ],
    )
    .await;

    let jobs = api(&server).list_releasable_jobs("deploy", 42).await.unwrap();

    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, "1");
    assert_eq!(jobs[0].step_key.as_deref(), Some("deploy-a"));
    assert!(jobs[0].state.is_blocked());
}

#[tokio::test]
async fn listing_tolerates_null_job_fields() {
    let server = MockServer::start().await;
    mount_build(
        &server,
        vec![
            json!({
                "id": "0",
                "type": "waiter",
                "step_key": null,
                "state": null,
                "unblockable": null,
                "unblock_url": null
            }),
            manual_job(&server, "1", "deploy-a", true),
        ],
    )
    .await;

    let jobs = api(&server).list_releasable_jobs("deploy", 42).await.unwrap();

    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, "1");
}

#[tokio::test]
async fn listing_error_status_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(BUILD_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
        .mount(&server)
        .await;

    let err = api(&server)
        .list_releasable_jobs("deploy", 42)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Collaborator);
    match err {
        GateError::RemoteStatus {
            operation,
            status,
            body,
        } => {
            assert_eq!(status, 401);
            assert_eq!(body, "Unauthorized");
            assert!(operation.contains("deploy#42"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn unreachable_server_is_transport_error() {
    let config = ApiConfig::new("acme", "s3cret").with_base_url("http://127.0.0.1:1");
    let api = BuildkiteApi::new(config).unwrap();

    let err = api.list_releasable_jobs("deploy", 42).await.unwrap_err();
    assert!(matches!(err, GateError::RemoteTransport { .. }));
}

#[tokio::test]
async fn unblock_puts_fields() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/jobs/1/unblock"))
        .and(bearer_token("s3cret"))
        .and(body_json(json!({ "fields": { "release-name": "v1.4.0" } })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "id": "1", "state": "unblocked" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let job: Job = serde_json::from_value(manual_job(&server, "1", "deploy-a", true)).unwrap();
    let response = api(&server)
        .release_job(&job, &fields(&[("release-name", "v1.4.0")]))
        .await
        .unwrap();

    assert!(response.is_success());
    assert_eq!(response.body["state"], "unblocked");
}

#[tokio::test]
async fn unblock_without_fields_sends_empty_object() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/jobs/1/unblock"))
        .and(body_json(json!({ "fields": {} })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "1" })))
        .expect(1)
        .mount(&server)
        .await;

    let job: Job = serde_json::from_value(manual_job(&server, "1", "deploy-a", true)).unwrap();
    api(&server)
        .release_job(&job, &ReleaseFields::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn rejected_unblock_is_returned_not_raised() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/jobs/1/unblock"))
        .respond_with(
            ResponseTemplate::new(422)
                .set_body_json(json!({ "message": "This job has already been unblocked" })),
        )
        .mount(&server)
        .await;

    let job: Job = serde_json::from_value(manual_job(&server, "1", "deploy-a", true)).unwrap();
    let response = api(&server)
        .release_job(&job, &ReleaseFields::new())
        .await
        .unwrap();

    assert_eq!(response.status, 422);
    assert!(response.is_already_released());
}

#[tokio::test]
async fn plain_text_error_body_is_kept() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/jobs/1/unblock"))
        .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
        .mount(&server)
        .await;

    let job: Job = serde_json::from_value(manual_job(&server, "1", "deploy-a", true)).unwrap();
    let response = api(&server)
        .release_job(&job, &ReleaseFields::new())
        .await
        .unwrap();

    assert_eq!(response.status, 502);
    assert_eq!(response.message().as_deref(), Some("Bad Gateway"));
}

#[tokio::test]
async fn job_without_unblock_url_is_invalid_target() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let job = Job::blocked("1", "deploy-a").without_release_url();
    let err = api(&server)
        .release_job(&job, &ReleaseFields::new())
        .await
        .unwrap_err();

    assert!(matches!(err, GateError::InvalidTarget { ref job_id } if job_id == "1"));
}

#[tokio::test]
async fn immediate_gate_unblocks_selected_steps() {
    let server = MockServer::start().await;
    mount_build(
        &server,
        vec![
            manual_job(&server, "1", "deploy-a", true),
            manual_job(&server, "2", "deploy-c", true),
            manual_job(&server, "3", "other", true),
        ],
    )
    .await;
    for id in ["1", "2"] {
        Mock::given(method("PUT"))
            .and(path(format!("/jobs/{id}/unblock")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": id })))
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("PUT"))
        .and(path("/jobs/3/unblock"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let plan = GateConfig {
        block_steps: vec!["deploy-a".to_string(), "deploy-b".to_string()],
        block_step_pattern: Some("deploy-*".to_string()),
        ..GateConfig::default()
    }
    .plan()
    .unwrap();
    let report = ReleaseCoordinator::new(
        Arc::new(MemoryAgent::new("Gate")),
        Arc::new(api(&server)),
        "deploy",
        42,
        plan,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.selected, vec!["deploy-a", "deploy-c"]);
    assert!(report.all_released());
    assert_eq!(report.released_count(), 2);
}
