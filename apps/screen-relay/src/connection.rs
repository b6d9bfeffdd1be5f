use std::{fmt, sync::Arc};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

use crate::{
    protocol::{MessageKind, Outbound, ServerEvent},
    telemetry::METRIC_OUTBOX_LAGGED,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What happens to relayed frames when a connection's frame lane is full.
/// Control events and close directives are never subject to backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Keep what is queued and reject the new frame.
    DropNewest,
    /// Always accept the new frame, discarding the oldest queued one.
    DropOldest,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("outbox full, event dropped")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// Handle to one transport-level peer.
///
/// Cloning is cheap; all clones feed the same outbox. The outbox has two
/// lanes: an unbounded control lane for server events and close directives,
/// and a bounded frame lane for relayed traffic. Poll clients get a detached
/// handle whose sends succeed without going anywhere, since they learn about
/// their peer from presence flags in each response.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    outbox: Outbox,
}

#[derive(Clone)]
enum Outbox {
    Attached {
        control: mpsc::UnboundedSender<Outbound>,
        frames: FrameLane,
    },
    Detached,
}

#[derive(Clone)]
enum FrameLane {
    Queued(mpsc::Sender<Outbound>),
    Latest(broadcast::Sender<Outbound>),
}

impl Connection {
    pub fn open(backpressure: Backpressure, depth: usize) -> (Connection, OutboxReceiver) {
        let id = ConnectionId::new();
        let depth = depth.max(1);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (frames, frames_rx) = match backpressure {
            Backpressure::DropNewest => {
                let (tx, rx) = mpsc::channel(depth);
                (FrameLane::Queued(tx), FrameReceiver::Queued(rx))
            }
            Backpressure::DropOldest => {
                let (tx, rx) = broadcast::channel(depth);
                (FrameLane::Latest(tx), FrameReceiver::Latest(rx))
            }
        };
        (
            Connection {
                id,
                outbox: Outbox::Attached {
                    control: control_tx,
                    frames,
                },
            },
            OutboxReceiver {
                connection_id: id,
                control: control_rx,
                frames: frames_rx,
            },
        )
    }

    pub fn detached() -> Connection {
        Connection {
            id: ConnectionId::new(),
            outbox: Outbox::Detached,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_detached(&self) -> bool {
        matches!(self.outbox, Outbox::Detached)
    }

    /// Queue a control event. Only fails once the writer has gone away.
    pub fn send(&self, event: ServerEvent) -> Result<(), SendError> {
        self.push_control(Outbound::Event(event))
    }

    pub fn forward(&self, kind: MessageKind, payload: Arc<Value>) -> Result<(), SendError> {
        let Outbox::Attached { frames, .. } = &self.outbox else {
            return Ok(());
        };
        let outbound = Outbound::Relay { kind, payload };
        match frames {
            FrameLane::Queued(tx) => tx.try_send(outbound).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => SendError::Full,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            }),
            FrameLane::Latest(tx) => tx.send(outbound).map(|_| ()).map_err(|_| SendError::Closed),
        }
    }

    /// Ask the writer to close the socket. Fails only if the writer is gone.
    pub fn close(&self, reason: &str) -> Result<(), SendError> {
        self.push_control(Outbound::Close {
            reason: reason.to_string(),
        })
    }

    fn push_control(&self, outbound: Outbound) -> Result<(), SendError> {
        match &self.outbox {
            Outbox::Attached { control, .. } => {
                control.send(outbound).map_err(|_| SendError::Closed)
            }
            Outbox::Detached => Ok(()),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("detached", &self.is_detached())
            .finish()
    }
}

/// Receiving half of a connection's outbox, drained by the writer task.
/// Control events are always delivered ahead of queued frames.
pub struct OutboxReceiver {
    connection_id: ConnectionId,
    control: mpsc::UnboundedReceiver<Outbound>,
    frames: FrameReceiver,
}

enum FrameReceiver {
    Queued(mpsc::Receiver<Outbound>),
    Latest(broadcast::Receiver<Outbound>),
}

impl FrameReceiver {
    async fn recv(&mut self, connection_id: ConnectionId) -> Option<Outbound> {
        match self {
            FrameReceiver::Queued(rx) => rx.recv().await,
            FrameReceiver::Latest(rx) => loop {
                match rx.recv().await {
                    Ok(outbound) => return Some(outbound),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(
                            connection_id = %connection_id,
                            skipped,
                            "frame lane lagged; discarded oldest frames"
                        );
                        metrics::counter!(METRIC_OUTBOX_LAGGED, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }

    fn try_recv(&mut self) -> Option<Outbound> {
        match self {
            FrameReceiver::Queued(rx) => rx.try_recv().ok(),
            FrameReceiver::Latest(rx) => loop {
                match rx.try_recv() {
                    Ok(outbound) => return Some(outbound),
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(_) => return None,
                }
            },
        }
    }
}

impl OutboxReceiver {
    pub async fn recv(&mut self) -> Option<Outbound> {
        let connection_id = self.connection_id;
        let frame = tokio::select! {
            biased;
            control = self.control.recv() => return control,
            frame = self.frames.recv(connection_id) => frame,
        };
        match frame {
            Some(frame) => Some(frame),
            // Frame lane closed means every sender is gone; flush control.
            None => self.control.recv().await,
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.control
            .try_recv()
            .ok()
            .or_else(|| self.frames.try_recv())
    }
}
