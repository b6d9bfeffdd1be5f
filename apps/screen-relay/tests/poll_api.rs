use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use screen_relay::{router, AppState, ChannelProfile, ServerConfig};
use serde_json::{json, Value};
use tower::ServiceExt;

fn test_app() -> Router {
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".parse().expect("addr"),
        main: ChannelProfile::main(),
        pointer: ChannelProfile::pointer(),
        shutdown_grace: Duration::ZERO,
    };
    router(AppState::new(&config, None))
}

async fn call(app: &Router, method: &str, uri: &str, body: Body) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(body)
                .expect("request"),
        )
        .await
        .expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn poll_host_and_viewer_exchange_frames() {
    let app = test_app();

    let (status, host) = call(&app, "POST", "/register-host?sessionId=abc", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(host["success"], true);
    assert_eq!(host["sessionId"], "abc");
    assert_eq!(host["viewerOnline"], false);

    let (status, viewer) =
        call(&app, "POST", "/register-viewer?sessionId=abc", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(viewer["hostOnline"], true);
    assert_eq!(viewer["message"], "Connected to host");

    let (_, empty) = call(&app, "GET", "/get-frame?sessionId=abc", Body::empty()).await;
    assert_eq!(empty["success"], true);
    assert_eq!(empty["hostOnline"], true);
    assert_eq!(empty["data"], Value::Null);
    assert_eq!(empty["message"], "No frame data yet");

    let frame = json!({ "image": "XXXX", "width": 640 }).to_string();
    let (status, sent) = call(&app, "POST", "/send-frame?sessionId=abc", Body::from(frame)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sent["success"], true);

    let (_, latest) = call(&app, "GET", "/get-frame?sessionId=abc", Body::empty()).await;
    assert_eq!(latest["hostOnline"], true);
    assert_eq!(latest["data"]["image"], "XXXX");
    assert_eq!(latest["data"]["width"], 640);
    assert!(latest["data"]["timestamp"].is_string());

    let (status, stats) = call(&app, "GET", "/stats", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["status"], "healthy");
    assert_eq!(stats["stats"]["activeHosts"], 1);
    assert_eq!(stats["stats"]["activeViewers"], 1);
    assert_eq!(stats["stats"]["totalConnections"], 2);
    assert_eq!(stats["stats"]["bytesRelayed"], 4);
    assert_eq!(stats["pointer"]["activeHosts"], 0);
    assert_eq!(stats["sessions"], json!(["abc"]));
}

#[tokio::test]
async fn lone_viewer_waits_and_sees_host_offline() {
    let app = test_app();

    let (_, viewer) = call(&app, "POST", "/register-viewer?sessionId=lonely", Body::empty()).await;
    assert_eq!(viewer["hostOnline"], false);
    assert_eq!(viewer["message"], "Waiting for host");

    let (status, frame) = call(&app, "GET", "/get-frame?sessionId=lonely", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(frame["success"], false);
    assert_eq!(frame["hostOnline"], false);
    assert_eq!(frame["message"], "Host offline");
}

#[tokio::test]
async fn send_frame_without_host_is_not_found() {
    let app = test_app();
    let body = Body::from(json!({ "image": "AA" }).to_string());
    let (status, error) = call(&app, "POST", "/send-frame?sessionId=ghost", body).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["success"], false);
    assert!(error["error"].as_str().unwrap().contains("ghost"));
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let app = test_app();

    let (status, error) = call(&app, "POST", "/register-host", Body::empty()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["success"], false);

    let (status, _) = call(&app, "POST", "/register-host?sessionId=%20%20", Body::empty()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    call(&app, "POST", "/register-host?sessionId=abc", Body::empty()).await;
    let (status, _) = call(
        &app,
        "POST",
        "/send-frame?sessionId=abc",
        Body::from("{not json"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        "POST",
        "/heartbeat?sessionId=abc&role=spectator",
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn heartbeat_reports_whether_a_slot_was_refreshed() {
    let app = test_app();

    let (_, missing) = call(&app, "POST", "/heartbeat?sessionId=abc&role=host", Body::empty()).await;
    assert_eq!(missing["success"], true);
    assert_eq!(missing["refreshed"], false);

    call(&app, "POST", "/register-host?sessionId=abc", Body::empty()).await;
    let (_, present) = call(&app, "POST", "/heartbeat?sessionId=abc&role=host", Body::empty()).await;
    assert_eq!(present["refreshed"], true);
    assert!(present["timestamp"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn operational_endpoints_respond() {
    let app = test_app();

    let (status, health) = call(&app, "GET", "/healthz", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");

    let (status, info) = call(&app, "GET", "/", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["service"], "screen-relay");
    assert!(info["endpoints"].is_object());

    let (status, _) = call(&app, "GET", "/get-stats", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);

    // No recorder installed in tests.
    let (status, _) = call(&app, "GET", "/metrics", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
