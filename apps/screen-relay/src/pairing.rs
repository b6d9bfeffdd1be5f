use std::time::Instant;

use metrics::counter;
use tracing::{debug, info};

use crate::{
    channel::RelayChannel,
    config::ChannelKind,
    connection::{Connection, ConnectionId},
    protocol::{Role, ServerEvent, REASON_REREGISTERED},
    telemetry::METRIC_REGISTRATIONS,
};

/// Result of a registration as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingStatus {
    pub paired: bool,
    pub session_id: String,
    pub peer_connection_id: Option<ConnectionId>,
}

impl RelayChannel {
    /// Register `connection` as `role` for `session_id` and tell both sides.
    ///
    /// The registrant always gets `registered`. When the opposite role is
    /// already present both peers get exactly one `peer-connected`; otherwise
    /// a viewer is told it is `waiting`. A connection displaced from the same
    /// slot is not notified. Repeating a registration for a slot the
    /// connection already holds only earns another `registered`.
    pub fn register(&self, role: Role, session_id: &str, connection: &Connection) -> PairingStatus {
        let registration = self.with_registry(|registry| {
            registry.register(role, session_id, connection.clone(), Instant::now())
        });

        counter!(
            METRIC_REGISTRATIONS,
            1,
            "channel" => self.kind().as_str(),
            "role" => role.as_str()
        );
        info!(
            channel = %self.kind(),
            session_id,
            role = %role,
            connection_id = %connection.id(),
            paired = registration.paired,
            "registered"
        );

        if let Some(previous) = &registration.superseded {
            debug!(
                channel = %self.kind(),
                session_id,
                role = %role,
                superseded = %previous.id(),
                "slot taken over by newer connection"
            );
        }

        if let Some(moved) = registration.moved_from {
            if let Some(peer) = moved.peer {
                self.notify(
                    &peer,
                    ServerEvent::PeerDisconnected {
                        session_id: moved.session_id,
                        reason: REASON_REREGISTERED.to_string(),
                    },
                );
            }
        }

        self.notify(
            connection,
            ServerEvent::Registered {
                role: role_label(self.kind(), role),
                session_id: session_id.to_string(),
                connection_id: connection.id(),
            },
        );

        match &registration.peer {
            // Pairing was already announced when this slot was first taken.
            _ if registration.already_registered => {
                debug!(channel = %self.kind(), session_id, "repeat registration acknowledged");
            }
            Some(peer) => {
                info!(channel = %self.kind(), session_id, "session paired");
                self.notify(
                    peer,
                    ServerEvent::PeerConnected {
                        session_id: session_id.to_string(),
                        peer_connection_id: connection.id(),
                    },
                );
                self.notify(
                    connection,
                    ServerEvent::PeerConnected {
                        session_id: session_id.to_string(),
                        peer_connection_id: peer.id(),
                    },
                );
            }
            None if role == Role::Viewer => {
                debug!(channel = %self.kind(), session_id, "viewer waiting for host");
                self.notify(
                    connection,
                    ServerEvent::Waiting {
                        session_id: session_id.to_string(),
                    },
                );
            }
            None => {}
        }

        PairingStatus {
            paired: registration.paired,
            session_id: session_id.to_string(),
            peer_connection_id: registration.peer.as_ref().map(Connection::id),
        }
    }
}

pub fn role_label(channel: ChannelKind, role: Role) -> &'static str {
    match (channel, role) {
        (ChannelKind::Main, Role::Host) => "host",
        (ChannelKind::Main, Role::Viewer) => "viewer",
        (ChannelKind::Pointer, Role::Host) => "mouse-host",
        (ChannelKind::Pointer, Role::Viewer) => "mouse-viewer",
    }
}
