//! Control API contract tests.
//!
//! Drives the router directly (tower `oneshot`) against scripted stub
//! collaborators: error classification, body validation, readiness
//! semantics, and the shutdown flow.  Requests carry the Unix transport
//! marker so authentication stays out of the way; auth has its own
//! suite.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use kahid::api::{Transport, build_router};
use kahid::control::{ControlError, ProcessState};
use kahi_test_utils::{StubWorld, process_info};
use std::time::Duration;
use tower::ServiceExt;

fn router(world: &StubWorld) -> Router {
    build_router(world.state.clone())
}

fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .extension(Transport::Unix);
    match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn list_and_get_serve_process_info() {
    let world = StubWorld::new();
    *world.processes.processes.lock() =
        vec![process_info("web", ProcessState::Running)];

    let response = router(&world)
        .oneshot(request("GET", "/api/v1/processes", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body[0]["name"], "web");
    assert_eq!(body[0]["state"], "RUNNING");
    assert_eq!(body[0]["statecode"], 20);

    let response = router(&world)
        .oneshot(request("GET", "/api/v1/processes/web", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["pid"], 4242);

    let response = router(&world)
        .oneshot(request("GET", "/api/v1/processes/ghost", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["code"], "NOT_FOUND");
    assert_eq!(body["error"], "no such process: ghost");
}

#[tokio::test]
async fn stop_on_a_stopped_process_is_a_client_error() {
    let world = StubWorld::new();
    *world.processes.stop_result.lock() = Err(ControlError::NotRunning("web".into()));

    let response = router(&world)
        .oneshot(request("POST", "/api/v1/processes/web/stop", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "process not running: web");
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn start_on_a_running_process_conflicts() {
    let world = StubWorld::new();
    *world.processes.start_result.lock() = Err(ControlError::AlreadyStarted("web".into()));

    let response = router(&world)
        .oneshot(request("POST", "/api/v1/processes/web/start", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response).await["code"], "CONFLICT");
}

#[tokio::test]
async fn successful_verbs_report_their_status() {
    let world = StubWorld::new();
    for (verb, status) in [
        ("start", "started"),
        ("stop", "stopped"),
        ("restart", "restarted"),
    ] {
        let response = router(&world)
            .oneshot(request(
                "POST",
                &format!("/api/v1/processes/web/{verb}"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], status);
        assert_eq!(body["name"], "web");
    }
}

#[tokio::test]
async fn start_is_refused_while_shutting_down() {
    let world = StubWorld::new();
    world
        .daemon
        .shutting_down
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let response = router(&world)
        .oneshot(request("POST", "/api/v1/processes/web/start", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response).await["code"], "CONFLICT");

    // Stop stays allowed so operators can wind processes down.
    let response = router(&world)
        .oneshot(request("POST", "/api/v1/processes/web/stop", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn signal_requires_a_non_empty_signal_field() {
    let world = StubWorld::new();

    // Missing body entirely.
    let response = router(&world)
        .oneshot(request("POST", "/api/v1/processes/web/signal", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Valid JSON, empty signal.
    let response = router(&world)
        .oneshot(request(
            "POST",
            "/api/v1/processes/web/signal",
            Some(serde_json::json!({"signal": ""})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(world.processes.signals_seen.lock().is_empty());

    // The collaborator stays authoritative for signal validation.
    *world.processes.signal_result.lock() = Err(ControlError::InvalidSignal("WINCH".into()));
    let response = router(&world)
        .oneshot(request(
            "POST",
            "/api/v1/processes/web/signal",
            Some(serde_json::json!({"signal": "WINCH"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "invalid signal: WINCH");
    assert_eq!(
        world.processes.signals_seen.lock().as_slice(),
        [("web".to_owned(), "WINCH".to_owned())]
    );
}

#[tokio::test]
async fn stdin_forwards_even_empty_data() {
    let world = StubWorld::new();
    let response = router(&world)
        .oneshot(request(
            "POST",
            "/api/v1/processes/web/stdin",
            Some(serde_json::json!({"data": ""})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        world.processes.stdin_seen.lock().as_slice(),
        [("web".to_owned(), Vec::new())]
    );

    *world.processes.stdin_result.lock() =
        Err(ControlError::StdinNotAccepted("web".into()));
    let response = router(&world)
        .oneshot(request(
            "POST",
            "/api/v1/processes/web/stdin",
            Some(serde_json::json!({"data": "hello"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        json_body(response).await["error"],
        "process web does not accept stdin"
    );
}

#[tokio::test]
async fn log_snapshot_validates_stream_and_parameters() {
    let world = StubWorld::new();
    *world.processes.processes.lock() =
        vec![process_info("web", ProcessState::Running)];
    *world.processes.log_bytes.lock() = b"captured output".to_vec();

    let response = router(&world)
        .oneshot(request("GET", "/api/v1/processes/web/log/stdout", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/plain; charset=utf-8"
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"captured output");
    // Defaults: offset 0, length 1600.
    assert_eq!(world.processes.log_reads_seen.lock()[0].2, 0);
    assert_eq!(world.processes.log_reads_seen.lock()[0].3, 1600);

    let response = router(&world)
        .oneshot(request(
            "GET",
            "/api/v1/processes/web/log/stdout?offset=-100&length=10",
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(world.processes.log_reads_seen.lock()[1].2, -100);
    assert_eq!(world.processes.log_reads_seen.lock()[1].3, 10);

    for bad in [
        "/api/v1/processes/web/log/combined",
        "/api/v1/processes/web/log/stdout?length=0",
        "/api/v1/processes/web/log/stdout?offset=nope",
    ] {
        let response = router(&world)
            .oneshot(request("GET", bad, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{bad}");
    }
}

#[tokio::test]
async fn group_operations_fan_out_and_validate_the_verb() {
    let world = StubWorld::new();
    *world.groups.groups.lock() = vec!["frontend".to_owned(), "workers".to_owned()];

    let response = router(&world)
        .oneshot(request("GET", "/api/v1/groups", None))
        .await
        .unwrap();
    assert_eq!(
        json_body(response).await["groups"],
        serde_json::json!(["frontend", "workers"])
    );

    let response = router(&world)
        .oneshot(request("POST", "/api/v1/groups/workers/restart", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        world.groups.ops_seen.lock().as_slice(),
        [("workers".to_owned(), "restart".to_owned())]
    );

    let response = router(&world)
        .oneshot(request("POST", "/api/v1/groups/workers/reboot", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    *world.groups.op_result.lock() = Err(ControlError::NoSuchGroup("ghosts".into()));
    let response = router(&world)
        .oneshot(request("POST", "/api/v1/groups/ghosts/start", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"], "no such group: ghosts");
}

#[tokio::test]
async fn healthz_flips_to_unavailable_during_shutdown() {
    let world = StubWorld::new();
    let response = router(&world)
        .oneshot(request("GET", "/healthz", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ok");

    world
        .daemon
        .shutting_down
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let response = router(&world)
        .oneshot(request("GET", "/healthz", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["status"], "shutting_down");
}

#[tokio::test]
async fn readyz_reports_pending_processes() {
    let world = StubWorld::new();
    let response = router(&world)
        .oneshot(request("GET", "/readyz", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    world
        .daemon
        .ready
        .store(false, std::sync::atomic::Ordering::SeqCst);
    let response = router(&world)
        .oneshot(request("GET", "/readyz", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["status"], "not_ready");

    *world.daemon.pending.lock() = vec!["db".to_owned()];
    let response = router(&world)
        .oneshot(request("GET", "/readyz?process=web,db", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["pending"], serde_json::json!(["db"]));

    *world.daemon.pending.lock() = Vec::new();
    let response = router(&world)
        .oneshot(request("GET", "/readyz?process=web,db", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    *world.daemon.unknown_process.lock() = Some("ghost".to_owned());
    let response = router(&world)
        .oneshot(request("GET", "/readyz?process=ghost", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        json_body(response).await["error"],
        "no such process: ghost"
    );
}

#[tokio::test]
async fn config_round_trip_and_reload_outcomes() {
    let world = StubWorld::new();
    *world.config.config.lock() = serde_json::json!({"supervisor": {"log_level": "info"}});

    let response = router(&world)
        .oneshot(request("GET", "/api/v1/config", None))
        .await
        .unwrap();
    assert_eq!(
        json_body(response).await["supervisor"]["log_level"],
        "info"
    );

    *world.config.reload_outcome.lock() = (
        vec!["new".to_owned()],
        vec!["web".to_owned()],
        vec!["old".to_owned()],
    );
    let response = router(&world)
        .oneshot(request("POST", "/api/v1/config/reload", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "reloaded");
    assert_eq!(body["added"], serde_json::json!(["new"]));
    assert_eq!(body["changed"], serde_json::json!(["web"]));
    assert_eq!(body["removed"], serde_json::json!(["old"]));

    *world.config.reload_error.lock() = Some("parse error: bad toml".to_owned());
    let response = router(&world)
        .oneshot(request("POST", "/api/v1/config/reload", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["code"], "SERVER_ERROR");
    assert_eq!(body["error"], "parse error: bad toml");
}

#[tokio::test]
async fn shutdown_responds_before_requesting_the_daemon_stop() {
    let world = StubWorld::new();
    let response = router(&world)
        .oneshot(request("POST", "/api/v1/shutdown", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "shutting_down");

    // The daemon request lands shortly after the response.
    assert!(
        !world
            .daemon
            .shutdown_requested
            .load(std::sync::atomic::Ordering::SeqCst)
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        world
            .daemon
            .shutdown_requested
            .load(std::sync::atomic::Ordering::SeqCst)
    );
}

#[tokio::test]
async fn version_serves_the_daemon_map() {
    let world = StubWorld::new();
    let response = router(&world)
        .oneshot(request("GET", "/api/v1/version", None))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["name"], "kahi");
    assert_eq!(body["version"], "0.0.0-test");
}
