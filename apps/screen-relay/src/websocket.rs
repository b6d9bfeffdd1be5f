use std::borrow::Cow;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::{
    channel::RelayChannel,
    connection::{Connection, OutboxReceiver},
    protocol::{
        ClientEvent, EventFrame, Outbound, ProtocolError, ServerEvent, REASON_CLIENT_CLOSED,
        REASON_TRANSPORT_ERROR,
    },
    server::AppState,
    telemetry::METRIC_PROTOCOL_ERRORS,
};

/// GET /ws
pub async fn main_ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let channel = state.main.clone();
    ws.on_upgrade(move |socket| serve_socket(socket, channel))
}

/// GET /ws/pointer
pub async fn pointer_ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let channel = state.pointer.clone();
    ws.on_upgrade(move |socket| serve_socket(socket, channel))
}

async fn serve_socket(socket: WebSocket, channel: RelayChannel) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (connection, outbox) = channel.open_connection();
    let connection_id = connection.id();

    info!(
        channel = %channel.kind(),
        connection_id = %connection_id,
        "websocket connected"
    );

    let writer = tokio::spawn(write_outbox(ws_tx, outbox, channel.clone(), connection.clone()));

    let mut reason = REASON_CLIENT_CLOSED;
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => dispatch(&channel, &connection, &text),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => dispatch(&channel, &connection, text),
                Err(_) => {
                    debug!(
                        connection_id = %connection_id,
                        len = bytes.len(),
                        "ignoring non-UTF8 binary frame"
                    );
                }
            },
            Ok(Message::Close(frame)) => {
                debug!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(
                    channel = %channel.kind(),
                    connection_id = %connection_id,
                    error = %err,
                    "error receiving message"
                );
                reason = REASON_TRANSPORT_ERROR;
                break;
            }
        }
    }

    channel.disconnect(connection_id, reason);
    writer.abort();

    info!(
        channel = %channel.kind(),
        connection_id = %connection_id,
        reason,
        "websocket closed"
    );
}

fn dispatch(channel: &RelayChannel, connection: &Connection, text: &str) {
    let parsed = EventFrame::decode(text).and_then(|frame| ClientEvent::parse(frame, channel.kind()));
    match parsed {
        Ok(event) => channel.handle_event(connection, event),
        Err(err) => reject(channel, connection, err),
    }
}

fn reject(channel: &RelayChannel, connection: &Connection, err: ProtocolError) {
    counter!(
        METRIC_PROTOCOL_ERRORS,
        1,
        "channel" => channel.kind().as_str(),
        "reason" => err.metric_label()
    );
    debug!(connection_id = %connection.id(), error = %err, "rejected client event");
    channel.notify(
        connection,
        ServerEvent::Error {
            message: err.to_string(),
        },
    );
}

async fn write_outbox(
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbox: OutboxReceiver,
    channel: RelayChannel,
    connection: Connection,
) {
    while let Some(outbound) = outbox.recv().await {
        let message = match &outbound {
            Outbound::Close { reason } => {
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::POLICY,
                        reason: Cow::Owned(reason.clone()),
                    })))
                    .await;
                break;
            }
            other => match other.encode() {
                Some(Ok(text)) => Message::Text(text),
                Some(Err(err)) => {
                    warn!(connection_id = %connection.id(), error = %err, "failed to encode event");
                    continue;
                }
                None => continue,
            },
        };

        if ws_tx.send(message).await.is_err() {
            channel.disconnect(connection.id(), REASON_TRANSPORT_ERROR);
            break;
        }
    }

    debug!(connection_id = %connection.id(), "writer task finished");
}
