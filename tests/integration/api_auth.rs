//! Authentication and transport-guard tests.
//!
//! The router is driven directly with the per-listener transport marker
//! in the request extensions, the way each bound listener installs it.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use http_body_util::BodyExt;
use kahid::api::{Credentials, Transport, build_router};
use kahi_test_utils::StubWorld;
use tower::ServiceExt;

fn router_with_auth(world: &StubWorld, username: &str, password: &str) -> Router {
    let mut state = world.state.clone();
    state.auth = Some(Credentials {
        username: username.to_owned(),
        password: password.to_owned(),
    });
    build_router(state)
}

fn get(uri: &str, transport: Transport, authorization: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri).extension(transport);
    if let Some(value) = authorization {
        builder = builder.header(header::AUTHORIZATION, value);
    }
    builder.body(Body::empty()).unwrap()
}

fn basic(username: &str, password: &str) -> String {
    format!(
        "Basic {}",
        BASE64_STANDARD.encode(format!("{username}:{password}"))
    )
}

#[tokio::test]
async fn tcp_without_credentials_is_challenged() {
    let world = StubWorld::new();
    let hash = bcrypt::hash("secret", 4).unwrap();
    let response = router_with_auth(&world, "admin", &hash)
        .oneshot(get("/api/v1/processes", Transport::Tcp, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()[header::WWW_AUTHENTICATE],
        "Basic realm=\"kahi\""
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn tcp_with_valid_bcrypt_credentials_passes() {
    let world = StubWorld::new();
    let hash = bcrypt::hash("secret", 4).unwrap();
    let router = router_with_auth(&world, "admin", &hash);

    let response = router
        .clone()
        .oneshot(get(
            "/api/v1/processes",
            Transport::Tcp,
            Some(&basic("admin", "secret")),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(get(
            "/api/v1/processes",
            Transport::Tcp,
            Some(&basic("admin", "wrong")),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = router
        .oneshot(get(
            "/api/v1/processes",
            Transport::Tcp,
            Some(&basic("intruder", "secret")),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn plaintext_stored_password_works_for_test_setups() {
    let world = StubWorld::new();
    let response = router_with_auth(&world, "admin", "hunter2")
        .oneshot(get(
            "/api/v1/processes",
            Transport::Tcp,
            Some(&basic("admin", "hunter2")),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unix_transport_bypasses_authentication() {
    let world = StubWorld::new();
    let hash = bcrypt::hash("secret", 4).unwrap();
    let response = router_with_auth(&world, "admin", &hash)
        .oneshot(get("/api/v1/processes", Transport::Unix, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn no_configured_username_bypasses_authentication() {
    let world = StubWorld::new();
    let response = build_router(world.state.clone())
        .oneshot(get("/api/v1/processes", Transport::Tcp, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn probes_skip_authentication_on_every_transport() {
    let world = StubWorld::new();
    let hash = bcrypt::hash("secret", 4).unwrap();
    let router = router_with_auth(&world, "admin", &hash);
    for transport in [Transport::Tcp, Transport::Unix] {
        for probe in ["/healthz", "/readyz"] {
            let response = router
                .clone()
                .oneshot(get(probe, transport, None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{probe} over {transport:?}");
        }
    }
}
