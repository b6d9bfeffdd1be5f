use std::{net::SocketAddr, time::Duration};

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use screen_relay::{router, AppState, ChannelProfile, ServerConfig};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tower::ServiceExt;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server() -> SocketAddr {
    spawn_server_with_state().await.0
}

/// Serve the router on an ephemeral port and hand back the shared state, so
/// tests can also drive the poll endpoints in-process against the same channels.
async fn spawn_server_with_state() -> (SocketAddr, AppState) {
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".parse().expect("addr"),
        main: ChannelProfile::main(),
        pointer: ChannelProfile::pointer(),
        shutdown_grace: Duration::ZERO,
    };
    let state = AppState::new(&config, None);
    let app = router(state.clone());
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, state)
}

async fn poll(app: &Router, method: &str, uri: &str, body: Body) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(body)
                .expect("request"),
        )
        .await
        .expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn connect(addr: SocketAddr, path: &str) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}{path}"))
        .await
        .expect("connect websocket");
    ws
}

async fn send(ws: &mut Client, event: &str, data: Value) {
    let frame = json!({ "event": event, "data": data }).to_string();
    ws.send(Message::text(frame)).await.expect("send frame");
}

async fn next_event(ws: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).expect("json event");
        }
    }
}

#[tokio::test]
async fn host_and_viewer_pair_and_relay_over_websocket() {
    let addr = spawn_server().await;
    let mut host = connect(addr, "/ws").await;
    let mut viewer = connect(addr, "/ws").await;

    send(&mut host, "register-host", json!("s1")).await;
    let registered = next_event(&mut host).await;
    assert_eq!(registered["event"], "registered");
    assert_eq!(registered["data"]["role"], "host");
    assert_eq!(registered["data"]["sessionId"], "s1");
    let host_id = registered["data"]["connectionId"].clone();

    send(&mut viewer, "register-viewer", json!({ "sessionId": "s1" })).await;
    let registered = next_event(&mut viewer).await;
    assert_eq!(registered["event"], "registered");
    assert_eq!(registered["data"]["role"], "viewer");
    let viewer_id = registered["data"]["connectionId"].clone();

    let paired = next_event(&mut viewer).await;
    assert_eq!(paired["event"], "peer-connected");
    assert_eq!(paired["data"]["peerConnectionId"], host_id);
    let paired = next_event(&mut host).await;
    assert_eq!(paired["event"], "peer-connected");
    assert_eq!(paired["data"]["peerConnectionId"], viewer_id);

    send(&mut host, "screen-frame", json!({ "image": "XXXX" })).await;
    let frame = next_event(&mut viewer).await;
    assert_eq!(frame, json!({ "event": "screen-frame", "data": { "image": "XXXX" } }));

    send(&mut viewer, "pointer-click", json!({ "x": 5, "y": 5 })).await;
    let click = next_event(&mut host).await;
    assert_eq!(click, json!({ "event": "pointer-click", "data": { "x": 5, "y": 5 } }));

    send(&mut viewer, "get-stats", Value::Null).await;
    let stats = next_event(&mut viewer).await;
    assert_eq!(stats["event"], "stats");
    assert_eq!(stats["data"]["bytesRelayed"], 4);
    assert_eq!(stats["data"]["activeHosts"], 1);
    assert_eq!(stats["data"]["activeViewers"], 1);

    host.close(None).await.expect("close host");
    let left = next_event(&mut viewer).await;
    assert_eq!(
        left,
        json!({
            "event": "peer-disconnected",
            "data": { "sessionId": "s1", "reason": "client-closed" }
        })
    );
}

#[tokio::test]
async fn forbidden_direction_is_not_relayed() {
    let addr = spawn_server().await;
    let mut host = connect(addr, "/ws").await;
    let mut viewer = connect(addr, "/ws").await;

    send(&mut host, "register-host", json!("s2")).await;
    next_event(&mut host).await;
    send(&mut viewer, "register-viewer", json!("s2")).await;
    next_event(&mut viewer).await;
    next_event(&mut viewer).await;
    next_event(&mut host).await;

    // Viewers never emit screen frames; the next thing the host sees is the chat.
    send(&mut viewer, "screen-frame", json!({ "image": "nope" })).await;
    send(&mut viewer, "chat-message", json!({ "text": "hi" })).await;
    let chat = next_event(&mut host).await;
    assert_eq!(chat["event"], "chat-message");
    assert_eq!(chat["data"]["text"], "hi");
}

#[tokio::test]
async fn unknown_events_get_an_error_and_ping_gets_pong() {
    let addr = spawn_server().await;
    let mut client = connect(addr, "/ws").await;

    send(&mut client, "teleport", json!({})).await;
    let error = next_event(&mut client).await;
    assert_eq!(error["event"], "error");
    assert!(error["data"]["message"].as_str().unwrap().contains("teleport"));

    client
        .send(Message::text("this is not json".to_string()))
        .await
        .expect("send garbage");
    let error = next_event(&mut client).await;
    assert_eq!(error["event"], "error");

    send(&mut client, "ping", Value::Null).await;
    let pong = next_event(&mut client).await;
    assert_eq!(pong["event"], "pong");
}

#[tokio::test]
async fn pointer_channel_relays_mouse_input_only() {
    let addr = spawn_server().await;
    let mut host = connect(addr, "/ws/pointer").await;
    let mut viewer = connect(addr, "/ws/pointer").await;

    send(&mut host, "register-mouse-host", json!("p1")).await;
    let registered = next_event(&mut host).await;
    assert_eq!(registered["data"]["role"], "mouse-host");

    send(&mut viewer, "register-mouse-viewer", json!("p1")).await;
    let registered = next_event(&mut viewer).await;
    assert_eq!(registered["data"]["role"], "mouse-viewer");
    assert_eq!(next_event(&mut viewer).await["event"], "peer-connected");
    assert_eq!(next_event(&mut host).await["event"], "peer-connected");

    send(&mut viewer, "pointer-move", json!({ "x": 1, "y": 1 })).await;
    send(&mut viewer, "mouse-input", json!({ "x": 9, "y": 9, "type": "move" })).await;
    let input = next_event(&mut host).await;
    assert_eq!(input["event"], "mouse-input");
    assert_eq!(input["data"]["x"], 9);
}

#[tokio::test]
async fn poll_and_websocket_clients_share_sessions() {
    let (addr, state) = spawn_server_with_state().await;
    let app = router(state.clone());

    // Poll host feeding a push viewer.
    let mut viewer = connect(addr, "/ws").await;
    send(&mut viewer, "register-viewer", json!("mixed")).await;
    assert_eq!(next_event(&mut viewer).await["event"], "registered");
    assert_eq!(next_event(&mut viewer).await["event"], "waiting");

    let (status, host) = poll(&app, "POST", "/register-host?sessionId=mixed", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(host["viewerOnline"], true);
    let paired = next_event(&mut viewer).await;
    assert_eq!(paired["event"], "peer-connected");
    assert_eq!(paired["data"]["peerConnectionId"], host["connectionId"]);

    let before = state.main.stats().bytes_relayed;
    let frame = Body::from(json!({ "image": "ABCDEF" }).to_string());
    let (status, _) = poll(&app, "POST", "/send-frame?sessionId=mixed", frame).await;
    assert_eq!(status, StatusCode::OK);

    let relayed = next_event(&mut viewer).await;
    assert_eq!(relayed["event"], "screen-frame");
    assert_eq!(relayed["data"]["image"], "ABCDEF");
    assert!(relayed["data"]["timestamp"].is_string());
    assert_eq!(state.main.stats().bytes_relayed, before + 6);

    // Push host leaving is visible to a poll viewer.
    let mut host = connect(addr, "/ws").await;
    send(&mut host, "register-host", json!("leaving")).await;
    assert_eq!(next_event(&mut host).await["event"], "registered");
    let (_, frame) = poll(&app, "GET", "/get-frame?sessionId=leaving", Body::empty()).await;
    assert_eq!(frame["hostOnline"], true);

    host.close(None).await.expect("close host");
    let mut offline = Value::Null;
    for _ in 0..100 {
        let (_, frame) = poll(&app, "GET", "/get-frame?sessionId=leaving", Body::empty()).await;
        if frame["hostOnline"] == false {
            offline = frame;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(offline["success"], false);
    assert_eq!(offline["message"], "Host offline");
}
