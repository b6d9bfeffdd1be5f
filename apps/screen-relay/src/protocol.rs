//! Event-level wire protocol shared by the push transport and the relay core.
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}`. Control
//! events are parsed into [`ClientEvent`]; relayable events keep their payload
//! as an opaque [`serde_json::Value`] that is forwarded to the peer untouched.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{config::ChannelKind, connection::ConnectionId, stats::StatsSnapshot};

pub const REASON_CLIENT_CLOSED: &str = "client-closed";
pub const REASON_TRANSPORT_ERROR: &str = "transport-error";
pub const REASON_TIMEOUT: &str = "timeout";
pub const REASON_REREGISTERED: &str = "re-registered";

/// Which end of a session a connection represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Viewer,
}

impl Role {
    pub fn opposite(self) -> Role {
        match self {
            Role::Host => Role::Viewer,
            Role::Viewer => Role::Host,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Viewer => "viewer",
        }
    }

    pub fn parse(raw: &str) -> Option<Role> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "host" => Some(Role::Host),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message types that travel between the two peers of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ScreenFrame,
    VideoFrame,
    ControlStatus,
    PointerMove,
    PointerClick,
    KeyPress,
    ControlCommand,
    StartStream,
    StopStream,
    ChatMessage,
    ControlMessage,
    MouseInput,
}

impl MessageKind {
    pub const ALL: [MessageKind; 12] = [
        MessageKind::ScreenFrame,
        MessageKind::VideoFrame,
        MessageKind::ControlStatus,
        MessageKind::PointerMove,
        MessageKind::PointerClick,
        MessageKind::KeyPress,
        MessageKind::ControlCommand,
        MessageKind::StartStream,
        MessageKind::StopStream,
        MessageKind::ChatMessage,
        MessageKind::ControlMessage,
        MessageKind::MouseInput,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::ScreenFrame => "screen-frame",
            MessageKind::VideoFrame => "video-frame",
            MessageKind::ControlStatus => "control-status",
            MessageKind::PointerMove => "pointer-move",
            MessageKind::PointerClick => "pointer-click",
            MessageKind::KeyPress => "key-press",
            MessageKind::ControlCommand => "control-command",
            MessageKind::StartStream => "start-stream",
            MessageKind::StopStream => "stop-stream",
            MessageKind::ChatMessage => "chat-message",
            MessageKind::ControlMessage => "control-message",
            MessageKind::MouseInput => "mouse-input",
        }
    }

    pub fn from_name(name: &str) -> Option<MessageKind> {
        MessageKind::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Frames that are cached on the host slot for pull-based viewers.
    pub fn is_stream_frame(self) -> bool {
        matches!(self, MessageKind::ScreenFrame | MessageKind::VideoFrame)
    }

    /// Payload fields whose length counts towards `bytesRelayed`.
    pub fn metered_fields(self) -> &'static [&'static str] {
        match self {
            MessageKind::ScreenFrame => &["image"],
            MessageKind::VideoFrame => &["data", "video", "audio"],
            _ => &[],
        }
    }

    /// Byte length of the media fields carried by `payload`.
    pub fn metered_len(self, payload: &Value) -> usize {
        self.metered_fields()
            .iter()
            .filter_map(|field| payload.get(*field))
            .filter_map(Value::as_str)
            .map(str::len)
            .sum()
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Raw `{"event", "data"}` envelope as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl EventFrame {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::MalformedFrame)
    }
}

/// Events generated by the relay itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Registered {
        role: &'static str,
        session_id: String,
        connection_id: ConnectionId,
    },
    #[serde(rename_all = "camelCase")]
    PeerConnected {
        session_id: String,
        peer_connection_id: ConnectionId,
    },
    #[serde(rename_all = "camelCase")]
    Waiting { session_id: String },
    #[serde(rename_all = "camelCase")]
    PeerDisconnected { session_id: String, reason: String },
    Pong,
    Stats(StatsSnapshot),
    Error { message: String },
}

/// Everything a connection's writer task can be asked to put on the wire.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(ServerEvent),
    Relay { kind: MessageKind, payload: Arc<Value> },
    Close { reason: String },
}

impl Outbound {
    /// Serialize to the JSON text of a frame. Close directives have no body.
    pub fn encode(&self) -> Option<Result<String, serde_json::Error>> {
        match self {
            Outbound::Event(event) => Some(serde_json::to_string(event)),
            Outbound::Relay { kind, payload } => Some(serde_json::to_string(&RelayFrame {
                event: kind.name(),
                data: payload,
            })),
            Outbound::Close { .. } => None,
        }
    }
}

#[derive(Serialize)]
struct RelayFrame<'a> {
    event: &'static str,
    #[serde(skip_serializing_if = "Value::is_null")]
    data: &'a Value,
}

/// Inbound events after name resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Register { role: Role, session_id: String },
    Relay { kind: MessageKind, payload: Value },
    Ping,
    Heartbeat,
    GetStats,
}

impl ClientEvent {
    pub fn parse(frame: EventFrame, channel: ChannelKind) -> Result<Self, ProtocolError> {
        if let Some(role) = registration_role(&frame.event, channel) {
            let session_id =
                extract_session_id(&frame.data).ok_or(ProtocolError::MissingSessionId)?;
            return Ok(ClientEvent::Register { role, session_id });
        }

        match frame.event.as_str() {
            "ping" => Ok(ClientEvent::Ping),
            "heartbeat" => Ok(ClientEvent::Heartbeat),
            "get-stats" => Ok(ClientEvent::GetStats),
            other => match MessageKind::from_name(other) {
                Some(kind) => Ok(ClientEvent::Relay {
                    kind,
                    payload: frame.data,
                }),
                None => Err(ProtocolError::UnknownEvent(other.to_string())),
            },
        }
    }
}

fn registration_role(event: &str, channel: ChannelKind) -> Option<Role> {
    match (channel, event) {
        (ChannelKind::Main, "register-host") => Some(Role::Host),
        (ChannelKind::Main, "register-viewer") => Some(Role::Viewer),
        (ChannelKind::Pointer, "register-mouse-host") => Some(Role::Host),
        (ChannelKind::Pointer, "register-mouse-viewer") => Some(Role::Viewer),
        _ => None,
    }
}

/// Accepts either a bare string or `{"sessionId": "..."}`.
pub fn extract_session_id(data: &Value) -> Option<String> {
    let raw = match data {
        Value::String(id) => id.as_str(),
        Value::Object(map) => map.get("sessionId")?.as_str()?,
        _ => return None,
    };
    normalize_session_id(raw)
}

pub fn normalize_session_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message format: {0}")]
    MalformedFrame(serde_json::Error),
    #[error("unknown event: {0}")]
    UnknownEvent(String),
    #[error("sessionId required")]
    MissingSessionId,
}

impl ProtocolError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ProtocolError::MalformedFrame(_) => "malformed_frame",
            ProtocolError::UnknownEvent(_) => "unknown_event",
            ProtocolError::MissingSessionId => "missing_session_id",
        }
    }
}
