//! One registry + router + liveness monitor, parameterized by a [`ChannelProfile`].
//!
//! The process runs two of these: the main channel (frames, input, chat) and
//! the pointer side channel. They share no lock and no queue. Pairing, relay
//! and liveness operations are implemented on [`RelayChannel`] in their own
//! modules; this one holds the shared state and event dispatch.

use std::{sync::Arc, time::Instant};

use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    config::{ChannelKind, ChannelProfile},
    connection::{Connection, OutboxReceiver, SendError},
    protocol::{ClientEvent, MessageKind, Role, ServerEvent, REASON_TRANSPORT_ERROR},
    registry::{FrameLookup, SessionRegistry},
    stats::{RelayStats, StatsSnapshot},
    telemetry::{
        METRIC_CONNECTIONS, METRIC_FLOW_CONTROL_DROPS, METRIC_HOSTS_ACTIVE, METRIC_VIEWERS_ACTIVE,
    },
};

#[derive(Clone)]
pub struct RelayChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    profile: ChannelProfile,
    registry: Mutex<SessionRegistry>,
    stats: RelayStats,
}

impl RelayChannel {
    pub fn new(profile: ChannelProfile) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                profile,
                registry: Mutex::new(SessionRegistry::new()),
                stats: RelayStats::new(),
            }),
        }
    }

    pub fn profile(&self) -> &ChannelProfile {
        &self.inner.profile
    }

    pub fn kind(&self) -> ChannelKind {
        self.inner.profile.kind
    }

    pub(crate) fn stats_counters(&self) -> &RelayStats {
        &self.inner.stats
    }

    /// Accept a new push connection. Counts towards `totalConnections`.
    pub fn open_connection(&self) -> (Connection, OutboxReceiver) {
        let profile = &self.inner.profile;
        let (connection, receiver) = Connection::open(profile.backpressure, profile.outbox_depth);
        self.record_new_connection();
        (connection, receiver)
    }

    /// Accept a poll client, which has no outbound path.
    pub fn open_detached(&self) -> Connection {
        self.record_new_connection();
        Connection::detached()
    }

    fn record_new_connection(&self) {
        let total = self.inner.stats.record_connection();
        counter!(METRIC_CONNECTIONS, 1, "channel" => self.kind().as_str());
        debug!(channel = %self.kind(), total, "connection opened");
    }

    /// Run `f` with exclusive access to the registry. Must not block.
    pub(crate) fn with_registry<R>(&self, f: impl FnOnce(&mut SessionRegistry) -> R) -> R {
        let mut guard = self.inner.registry.lock();
        let result = f(&mut guard);
        self.publish_gauges(&guard);
        result
    }

    fn publish_gauges(&self, registry: &SessionRegistry) {
        let channel = self.kind().as_str();
        gauge!(
            METRIC_HOSTS_ACTIVE,
            registry.host_count() as f64,
            "channel" => channel
        );
        gauge!(
            METRIC_VIEWERS_ACTIVE,
            registry.viewer_count() as f64,
            "channel" => channel
        );
    }

    pub fn stats(&self) -> StatsSnapshot {
        let registry = self.inner.registry.lock();
        self.inner.stats.snapshot(&registry)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.inner.registry.lock().session_ids()
    }

    /// Latest cached host frame, read on behalf of the session's viewer.
    /// Reading counts as viewer activity.
    pub fn frame(&self, session_id: &str) -> FrameLookup {
        self.with_registry(|registry| {
            registry.touch(session_id, Role::Viewer, Instant::now());
            registry.cached_frame(session_id)
        })
    }

    /// Entry point for the push transport's message-received hook.
    pub fn handle_event(&self, connection: &Connection, event: ClientEvent) {
        match event {
            ClientEvent::Register { role, session_id } => {
                self.register(role, &session_id, connection);
            }
            ClientEvent::Relay { kind, payload } => {
                self.relay(connection.id(), kind, payload);
            }
            ClientEvent::Ping => {
                self.heartbeat(connection.id());
                self.notify(connection, ServerEvent::Pong);
            }
            ClientEvent::Heartbeat => {
                self.heartbeat(connection.id());
            }
            ClientEvent::GetStats => {
                self.notify(connection, ServerEvent::Stats(self.stats()));
            }
        }
    }

    /// Send a control event. A closed outbox counts as the peer disconnecting.
    pub(crate) fn notify(&self, connection: &Connection, event: ServerEvent) -> bool {
        let result = connection.send(event);
        self.settle_send(connection, result)
    }

    pub(crate) fn forward(
        &self,
        connection: &Connection,
        kind: MessageKind,
        payload: Arc<Value>,
    ) -> bool {
        let result = connection.forward(kind, payload);
        self.settle_send(connection, result)
    }

    fn settle_send(&self, connection: &Connection, result: Result<(), SendError>) -> bool {
        match result {
            Ok(()) => true,
            Err(SendError::Full) => {
                counter!(
                    METRIC_FLOW_CONTROL_DROPS,
                    1,
                    "channel" => self.kind().as_str()
                );
                debug!(
                    channel = %self.kind(),
                    connection_id = %connection.id(),
                    "outbox full; event dropped"
                );
                false
            }
            Err(SendError::Closed) => {
                warn!(
                    channel = %self.kind(),
                    connection_id = %connection.id(),
                    "outbox closed; treating as disconnect"
                );
                self.disconnect(connection.id(), REASON_TRANSPORT_ERROR);
                false
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{test_support::*, *};
    use crate::protocol::{Outbound, REASON_CLIENT_CLOSED};
    use serde_json::json;

    #[test]
    fn ping_answers_pong_and_get_stats_reports_counts() {
        let channel = RelayChannel::new(ChannelProfile::main());
        let (host, mut host_rx) = channel.open_connection();

        channel.handle_event(
            &host,
            ClientEvent::Register {
                role: Role::Host,
                session_id: "abc".into(),
            },
        );
        channel.handle_event(&host, ClientEvent::Ping);
        channel.handle_event(&host, ClientEvent::GetStats);

        let events = events(&mut host_rx);
        assert!(matches!(events[0], ServerEvent::Registered { .. }));
        assert_eq!(events[1], ServerEvent::Pong);
        match &events[2] {
            ServerEvent::Stats(stats) => {
                assert_eq!(stats.total_connections, 1);
                assert_eq!(stats.active_hosts, 1);
                assert_eq!(stats.active_viewers, 0);
            }
            other => panic!("expected stats, got {other:?}"),
        }
    }

    #[test]
    fn closed_peer_outbox_triggers_implicit_disconnect() {
        let channel = RelayChannel::new(ChannelProfile::main());
        let (host, host_rx) = channel.open_connection();
        let (viewer, mut viewer_rx) = channel.open_connection();
        channel.register(Role::Host, "abc", &host);
        channel.register(Role::Viewer, "abc", &viewer);
        drain(&mut viewer_rx);
        drop(host_rx);

        channel.relay(
            viewer.id(),
            MessageKind::PointerMove,
            json!({ "x": 1, "y": 2 }),
        );

        assert_eq!(channel.stats().active_hosts, 0);
        assert_eq!(
            events(&mut viewer_rx),
            vec![ServerEvent::PeerDisconnected {
                session_id: "abc".into(),
                reason: REASON_TRANSPORT_ERROR.into(),
            }]
        );
        assert!(channel.disconnect(host.id(), REASON_CLIENT_CLOSED).is_none());
    }

    #[test]
    fn backlogged_viewer_still_hears_host_leave() {
        let channel = RelayChannel::new(ChannelProfile::main());
        let (host, _host_rx) = channel.open_connection();
        let (viewer, mut viewer_rx) = channel.open_connection();
        channel.register(Role::Host, "abc", &host);
        channel.register(Role::Viewer, "abc", &viewer);
        drain(&mut viewer_rx);

        let depth = channel.profile().outbox_depth;
        for n in 0..depth + 10 {
            channel.relay(host.id(), MessageKind::ScreenFrame, json!({ "image": "XX", "n": n }));
        }
        channel.disconnect(host.id(), REASON_CLIENT_CLOSED);

        let queued = drain(&mut viewer_rx);
        let frames = queued
            .iter()
            .filter(|item| matches!(item, Outbound::Relay { .. }))
            .count();
        assert_eq!(frames, depth);
        let events: Vec<&ServerEvent> = queued
            .iter()
            .filter_map(|item| match item {
                Outbound::Event(event) => Some(event),
                _ => None,
            })
            .collect();
        assert_eq!(
            events,
            vec![&ServerEvent::PeerDisconnected {
                session_id: "abc".into(),
                reason: REASON_CLIENT_CLOSED.into(),
            }]
        );
    }

    #[test]
    fn channels_are_independent() {
        let main = RelayChannel::new(ChannelProfile::main());
        let pointer = RelayChannel::new(ChannelProfile::pointer());
        let (host, _rx) = main.open_connection();
        main.register(Role::Host, "abc", &host);

        assert_eq!(main.stats().active_hosts, 1);
        assert_eq!(pointer.stats().active_hosts, 0);
        assert_eq!(pointer.stats().total_connections, 0);
    }
}
