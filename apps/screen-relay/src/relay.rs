//! Directional forwarding between the two peers of a paired session.

use std::{sync::Arc, time::Instant};

use metrics::counter;
use serde_json::Value;
use tracing::trace;

use crate::{
    channel::RelayChannel,
    config::ChannelKind,
    connection::{Connection, ConnectionId},
    protocol::{MessageKind, Role},
    registry::{SessionRegistry, SlotKey},
    telemetry::{METRIC_BYTES_RELAYED, METRIC_MESSAGES},
};

/// Which sender roles may emit a message kind. The receiver is always the
/// opposite role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToViewer,
    ViewerToHost,
    Either,
}

impl Direction {
    pub fn allows(self, sender: Role) -> bool {
        match self {
            Direction::HostToViewer => sender == Role::Host,
            Direction::ViewerToHost => sender == Role::Viewer,
            Direction::Either => true,
        }
    }
}

/// Permission table for a channel. `None` means the kind is not relayed there.
pub fn permission(channel: ChannelKind, kind: MessageKind) -> Option<Direction> {
    use MessageKind::*;

    match channel {
        ChannelKind::Main => match kind {
            ScreenFrame | VideoFrame | ControlStatus => Some(Direction::HostToViewer),
            PointerMove | PointerClick | KeyPress | ControlCommand | StartStream | StopStream => {
                Some(Direction::ViewerToHost)
            }
            ChatMessage | ControlMessage => Some(Direction::Either),
            MouseInput => None,
        },
        ChannelKind::Pointer => match kind {
            MouseInput => Some(Direction::ViewerToHost),
            _ => None,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered { bytes: usize },
    /// Sender holds no slot on this channel.
    Unregistered,
    /// Kind not permitted for the sender's role on this channel.
    Forbidden,
    /// Permitted, but nobody is registered on the other side.
    NoPeer,
    /// Peer's outbox refused the message.
    Dropped,
}

impl RelayOutcome {
    fn metric_label(self) -> &'static str {
        match self {
            RelayOutcome::Delivered { .. } => "delivered",
            RelayOutcome::Unregistered => "unregistered",
            RelayOutcome::Forbidden => "forbidden",
            RelayOutcome::NoPeer => "no_peer",
            RelayOutcome::Dropped => "dropped",
        }
    }
}

enum Route {
    Rejected(RelayOutcome),
    Accepted {
        session_id: String,
        peer: Option<Connection>,
    },
}

impl RelayChannel {
    /// Forward `payload` from `sender` to its peer if the table allows it.
    ///
    /// Fire and forget: nothing is reported back to the sender. Stream frames
    /// from a host are cached on its slot even when no viewer is attached.
    pub fn relay(&self, sender: ConnectionId, kind: MessageKind, payload: Value) -> RelayOutcome {
        self.relay_from(kind, payload, |registry| registry.locate(sender).cloned())
    }

    /// Relay on behalf of whoever occupies `role` in `session_id`.
    ///
    /// Used by the poll transport, which identifies callers by session rather
    /// than by connection. Returns `Unregistered` when the slot is empty.
    pub fn relay_as(
        &self,
        session_id: &str,
        role: Role,
        kind: MessageKind,
        payload: Value,
    ) -> RelayOutcome {
        self.relay_from(kind, payload, |registry| {
            registry.occupant(session_id, role).map(|_| SlotKey {
                session_id: session_id.to_string(),
                role,
            })
        })
    }

    /// Resolve the sender, check the table, cache and pick the peer in one
    /// critical section; deliver after the lock is released.
    fn relay_from(
        &self,
        kind: MessageKind,
        payload: Value,
        resolve: impl FnOnce(&SessionRegistry) -> Option<SlotKey>,
    ) -> RelayOutcome {
        let payload = Arc::new(payload);
        let route = self.with_registry(|registry| {
            let Some(key) = resolve(registry) else {
                return Route::Rejected(RelayOutcome::Unregistered);
            };
            if !permission(self.kind(), kind).is_some_and(|dir| dir.allows(key.role)) {
                return Route::Rejected(RelayOutcome::Forbidden);
            }
            registry.touch(&key.session_id, key.role, Instant::now());
            if key.role == Role::Host && kind.is_stream_frame() {
                registry.cache_frame(&key.session_id, kind, Arc::clone(&payload));
            }
            Route::Accepted {
                peer: registry.lookup_peer(&key.session_id, key.role).cloned(),
                session_id: key.session_id,
            }
        });

        let outcome = match route {
            Route::Rejected(outcome) => outcome,
            Route::Accepted { peer: None, .. } => RelayOutcome::NoPeer,
            Route::Accepted {
                peer: Some(peer),
                session_id,
            } => {
                let bytes = kind.metered_len(&payload);
                if self.forward(&peer, kind, payload) {
                    self.stats_counters().record_relay(bytes);
                    trace!(
                        channel = %self.kind(),
                        session_id = %session_id,
                        kind = %kind,
                        bytes,
                        "relayed"
                    );
                    RelayOutcome::Delivered { bytes }
                } else {
                    RelayOutcome::Dropped
                }
            }
        };

        counter!(
            METRIC_MESSAGES,
            1,
            "channel" => self.kind().as_str(),
            "outcome" => outcome.metric_label()
        );
        if let RelayOutcome::Delivered { bytes } = outcome {
            if bytes > 0 {
                counter!(
                    METRIC_BYTES_RELAYED,
                    bytes as u64,
                    "channel" => self.kind().as_str()
                );
            }
        }
        outcome
    }
}
