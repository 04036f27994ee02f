//! SSE streaming over a real TCP listener.
//!
//! Starts the control API on 127.0.0.1:0, connects with an HTTP
//! client, publishes events on the bus, and asserts on the raw
//! `text/event-stream` frames.

use futures_util::StreamExt;
use kahi_events::{Event, EventType};
use kahid::api::{Credentials, Server};
use kahid::control::ProcessState;
use kahi_test_utils::{StubWorld, process_info};
use std::time::Duration;

async fn start_server(world: &StubWorld, auth: Option<Credentials>) -> (Server, String) {
    let mut state = world.state.clone();
    state.auth = auth;
    let mut server = Server::new(state);
    server.start_tcp("127.0.0.1:0").await.unwrap();
    let addr = server.tcp_addr().unwrap();
    (server, format!("http://{addr}"))
}

/// Read the next non-keepalive frame from an SSE byte stream.
async fn read_frame<S>(stream: &mut S, pending: &mut String) -> String
where
    S: futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
{
    loop {
        if let Some(position) = pending.find("\n\n") {
            let frame = pending[..position].to_owned();
            pending.drain(..position + 2);
            if frame.starts_with(':') {
                continue; // keepalive comment
            }
            return frame;
        }
        let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for an SSE frame")
            .expect("SSE stream ended")
            .expect("SSE stream errored");
        pending.push_str(&String::from_utf8_lossy(&chunk));
    }
}

#[tokio::test]
async fn firehose_filters_on_requested_types() {
    let world = StubWorld::new();
    let (mut server, base) = start_server(&world, None).await;

    let response = reqwest::get(format!(
        "{base}/api/v1/events/stream?types=PROCESS_STATE_RUNNING"
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "text/event-stream"
    );
    assert_eq!(response.headers()["cache-control"], "no-cache");
    assert_eq!(response.headers()["connection"], "keep-alive");
    assert_eq!(response.headers()["x-accel-buffering"], "no");
    let mut stream = response.bytes_stream();
    let mut pending = String::new();

    // A filtered-out type produces no frame; the matching publish that
    // follows must be the first frame observed.
    world
        .bus
        .publish(Event::new(EventType::ProcessStateStopped).with_entry("name", "web"));
    world.bus.publish(
        Event::new(EventType::ProcessStateRunning)
            .with_entry("name", "web")
            .with_entry("group", "web"),
    );

    let frame = read_frame(&mut stream, &mut pending).await;
    let mut lines = frame.lines();
    assert_eq!(lines.next(), Some("event: PROCESS_STATE_RUNNING"));
    let data_line = lines.next().unwrap();
    let json: serde_json::Value =
        serde_json::from_str(data_line.strip_prefix("data: ").unwrap()).unwrap();
    assert_eq!(json["name"], "web");
    assert_eq!(json["group"], "web");

    server.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn firehose_defaults_exclude_logs_and_ticks() {
    let world = StubWorld::new();
    let (mut server, base) = start_server(&world, None).await;

    let response = reqwest::get(format!("{base}/api/v1/events/stream"))
        .await
        .unwrap();
    let mut stream = response.bytes_stream();
    let mut pending = String::new();

    world.bus.publish(
        Event::new(EventType::ProcessLogStdout)
            .with_entry("name", "web")
            .with_entry("data", "noise"),
    );
    world.bus.publish(Event::new(EventType::Tick5));
    world
        .bus
        .publish(Event::new(EventType::ProcessGroupAdded).with_entry("name", "workers"));

    let frame = read_frame(&mut stream, &mut pending).await;
    assert!(frame.starts_with("event: PROCESS_GROUP_ADDED"), "{frame}");

    server.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn firehose_rejects_unknown_types() {
    let world = StubWorld::new();
    let (mut server, base) = start_server(&world, None).await;

    let response = reqwest::get(format!("{base}/api/v1/events/stream?types=PROCESS_STATE_BOGUS"))
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "BAD_REQUEST");
    assert_eq!(body["error"], "unknown event type: PROCESS_STATE_BOGUS");

    server.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn log_tail_filters_by_process_name() {
    let world = StubWorld::new();
    *world.processes.processes.lock() =
        vec![process_info("web", ProcessState::Running)];
    let (mut server, base) = start_server(&world, None).await;

    let response = reqwest::get(format!("{base}/api/v1/processes/web/log/stdout/stream"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["cache-control"], "no-cache");
    assert_eq!(response.headers()["connection"], "keep-alive");
    assert_eq!(response.headers()["x-accel-buffering"], "no");
    let mut stream = response.bytes_stream();
    let mut pending = String::new();

    // Another process's chunk is filtered; web's chunk is the first
    // frame, carried as a bare data line.
    world.bus.publish(
        Event::new(EventType::ProcessLogStdout)
            .with_entry("name", "other")
            .with_entry("data", "wrong-process"),
    );
    world.bus.publish(
        Event::new(EventType::ProcessLogStdout)
            .with_entry("name", "web")
            .with_entry("data", "chunk-a"),
    );

    let frame = read_frame(&mut stream, &mut pending).await;
    assert_eq!(frame, "data: chunk-a");

    server.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn log_tail_validates_stream_and_process() {
    let world = StubWorld::new();
    *world.processes.processes.lock() =
        vec![process_info("web", ProcessState::Running)];
    let (mut server, base) = start_server(&world, None).await;

    let response = reqwest::get(format!("{base}/api/v1/processes/web/log/combined/stream"))
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = reqwest::get(format!("{base}/api/v1/processes/ghost/log/stdout/stream"))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    server.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn tcp_auth_applies_to_the_event_stream() {
    let world = StubWorld::new();
    let auth = Credentials {
        username: "admin".to_owned(),
        password: bcrypt::hash("secret", 4).unwrap(),
    };
    let (mut server, base) = start_server(&world, Some(auth)).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{base}/api/v1/events/stream"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert_eq!(
        response.headers()["www-authenticate"],
        "Basic realm=\"kahi\""
    );

    let response = client
        .get(format!("{base}/api/v1/events/stream"))
        .basic_auth("admin", Some("secret"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Probes stay open.
    let response = client.get(format!("{base}/healthz")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    server.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn slow_client_overflow_never_blocks_the_publisher() {
    let world = StubWorld::new();
    let (mut server, base) = start_server(&world, None).await;

    // Open a stream and never read from it, then flood well past the
    // per-connection channel capacity.  Publish must stay prompt.
    let response = reqwest::get(format!(
        "{base}/api/v1/events/stream?types=PROCESS_STATE_RUNNING"
    ))
    .await
    .unwrap();

    let publish_all = async {
        for index in 0..1000 {
            world.bus.publish(
                Event::new(EventType::ProcessStateRunning)
                    .with_entry("name", format!("p{index}")),
            );
        }
    };
    tokio::time::timeout(Duration::from_secs(5), publish_all)
        .await
        .expect("publishing blocked on a saturated SSE connection");

    drop(response);
    server.stop(Duration::from_secs(2)).await.unwrap();
}
