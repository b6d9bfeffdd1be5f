//! Poll transport and operational endpoints.
//!
//! Poll clients never hold a socket, so each request runs the main channel's
//! liveness sweep before touching the registry, and pairing is reported
//! through presence flags rather than pushed events.

use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::debug;

use crate::{
    connection::ConnectionId,
    error::RelayError,
    protocol::{normalize_session_id, MessageKind, Role},
    registry::FrameLookup,
    relay::RelayOutcome,
    server::AppState,
    stats::StatsSnapshot,
};

const SERVICE_NAME: &str = "screen-relay";

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

impl SessionQuery {
    fn require(&self) -> Result<String, RelayError> {
        self.session_id
            .as_deref()
            .and_then(normalize_session_id)
            .ok_or(RelayError::MissingSessionId)
    }
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    role: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterHostResponse {
    success: bool,
    session_id: String,
    connection_id: ConnectionId,
    viewer_online: bool,
    message: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterViewerResponse {
    success: bool,
    session_id: String,
    connection_id: ConnectionId,
    host_online: bool,
    message: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameResponse {
    success: bool,
    data: Option<Value>,
    host_online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    success: bool,
    refreshed: bool,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    stats: StatsSnapshot,
    pointer: StatsSnapshot,
    sessions: Vec<String>,
}

/// POST /register-host?sessionId=
pub async fn register_host(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<RegisterHostResponse>, RelayError> {
    state.main.sweep(Instant::now());
    let session_id = query.require()?;

    let connection = state.main.open_detached();
    let status = state.main.register(Role::Host, &session_id, &connection);

    Ok(Json(RegisterHostResponse {
        success: true,
        session_id,
        connection_id: connection.id(),
        viewer_online: status.paired,
        message: "Host registered",
    }))
}

/// POST /register-viewer?sessionId=
pub async fn register_viewer(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<RegisterViewerResponse>, RelayError> {
    state.main.sweep(Instant::now());
    let session_id = query.require()?;

    let connection = state.main.open_detached();
    let status = state.main.register(Role::Viewer, &session_id, &connection);

    Ok(Json(RegisterViewerResponse {
        success: true,
        session_id,
        connection_id: connection.id(),
        host_online: status.paired,
        message: if status.paired {
            "Connected to host"
        } else {
            "Waiting for host"
        },
    }))
}

/// POST /send-frame?sessionId=  (body: JSON frame payload)
pub async fn send_frame(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    body: Bytes,
) -> Result<Json<Value>, RelayError> {
    state.main.sweep(Instant::now());
    let session_id = query.require()?;

    let mut payload: Value = serde_json::from_slice(&body)
        .map_err(|err| RelayError::InvalidPayload(err.to_string()))?;
    if let Value::Object(map) = &mut payload {
        let stamp = OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default();
        map.insert("timestamp".to_string(), Value::String(stamp));
    }

    match state
        .main
        .relay_as(&session_id, Role::Host, MessageKind::ScreenFrame, payload)
    {
        RelayOutcome::Unregistered => Err(RelayError::HostNotRegistered(session_id)),
        outcome => {
            debug!(session_id = %session_id, ?outcome, "frame submitted");
            Ok(Json(json!({ "success": true })))
        }
    }
}

/// GET /get-frame?sessionId=
pub async fn get_frame(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<FrameResponse>, RelayError> {
    state.main.sweep(Instant::now());
    let session_id = query.require()?;

    let response = match state.main.frame(&session_id) {
        FrameLookup::Frame(frame) => {
            debug!(
                session_id = %session_id,
                kind = %frame.kind,
                captured_at = %frame.captured_at,
                "serving cached frame"
            );
            FrameResponse {
                success: true,
                data: Some((*frame.payload).clone()),
                host_online: true,
                message: None,
            }
        }
        FrameLookup::NoDataYet => FrameResponse {
            success: true,
            data: None,
            host_online: true,
            message: Some("No frame data yet"),
        },
        FrameLookup::HostOffline => FrameResponse {
            success: false,
            data: None,
            host_online: false,
            message: Some("Host offline"),
        },
    };
    Ok(Json(response))
}

/// POST /heartbeat?sessionId=&role=host|viewer
pub async fn heartbeat(
    State(state): State<AppState>,
    Query(query): Query<HeartbeatQuery>,
) -> Result<Json<HeartbeatResponse>, RelayError> {
    state.main.sweep(Instant::now());
    let session_id = query
        .session_id
        .as_deref()
        .and_then(normalize_session_id)
        .ok_or(RelayError::MissingSessionId)?;
    let raw_role = query.role.unwrap_or_default();
    let role = Role::parse(&raw_role).ok_or(RelayError::InvalidRole(raw_role))?;

    let refreshed = state.main.heartbeat_slot(&session_id, role);
    Ok(Json(HeartbeatResponse {
        success: true,
        refreshed,
        timestamp: (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64,
    }))
}

/// GET /stats (also served as /get-stats)
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    state.main.sweep(Instant::now());
    Json(StatsResponse {
        status: "healthy",
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        stats: state.main.stats(),
        pointer: state.pointer.stats(),
        sessions: state.main.session_ids(),
    })
}

/// GET /
pub async fn service_info() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "POST /register-host?sessionId=ID": "Register host",
            "POST /register-viewer?sessionId=ID": "Register viewer",
            "POST /send-frame?sessionId=ID": "Submit a screen frame",
            "GET /get-frame?sessionId=ID": "Fetch the latest screen frame",
            "POST /heartbeat?sessionId=ID&role=host|viewer": "Keep a slot alive",
            "GET /stats": "Relay statistics",
            "GET /ws": "Push-event WebSocket",
            "GET /ws/pointer": "Low-latency pointer WebSocket",
        }
    }))
}

/// GET /healthz
pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
