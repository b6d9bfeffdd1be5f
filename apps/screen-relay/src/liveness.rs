//! Heartbeats, explicit disconnects and timeout-based reclamation.
//!
//! A slot occupant is alive while `now - last_seen <= idle_timeout`. Once past
//! that it is expired and the next sweep removes it. The sweep can run from a
//! background interval (push transports) or at the start of a request (poll
//! transports); worst-case staleness is sweep interval plus timeout.

use std::time::Instant;

use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::{
    channel::RelayChannel,
    connection::ConnectionId,
    protocol::{Role, ServerEvent, REASON_TIMEOUT},
    registry::Release,
    telemetry::METRIC_IDLE_EVICTIONS,
};

const IDLE_CLOSE_REASON: &str = "idle timeout";

impl RelayChannel {
    /// Refresh `last_seen` for the slot held by `connection_id`.
    pub fn heartbeat(&self, connection_id: ConnectionId) -> bool {
        self.with_registry(|registry| registry.touch_connection(connection_id, Instant::now()))
    }

    /// Refresh `last_seen` for whoever holds `role` in `session_id`.
    pub fn heartbeat_slot(&self, session_id: &str, role: Role) -> bool {
        self.with_registry(|registry| registry.touch(session_id, role, Instant::now()))
    }

    /// Remove `connection_id` immediately and tell its peer why.
    ///
    /// Returns `None` when the connection held no slot, e.g. because it was
    /// superseded or already reclaimed.
    pub fn disconnect(&self, connection_id: ConnectionId, reason: &str) -> Option<Release> {
        let release = self.with_registry(|registry| registry.release(connection_id))?;
        info!(
            channel = %self.kind(),
            session_id = %release.session_id,
            role = %release.role,
            connection_id = %connection_id,
            reason,
            "peer left"
        );
        self.announce_departure(&release, reason);
        Some(release)
    }

    /// Reclaim every slot whose occupant has been silent longer than the
    /// channel's idle timeout. Returns the number of slots removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let timeout = self.profile().idle_timeout;
        let evicted: Vec<Release> = self.with_registry(|registry| {
            registry
                .expired(now, timeout)
                .into_iter()
                .filter_map(|id| registry.release(id))
                .collect()
        });

        for release in &evicted {
            counter!(
                METRIC_IDLE_EVICTIONS,
                1,
                "channel" => self.kind().as_str(),
                "role" => release.role.as_str()
            );
            info!(
                channel = %self.kind(),
                session_id = %release.session_id,
                role = %release.role,
                connection_id = %release.connection.id(),
                "reclaimed idle slot"
            );
            if release.connection.close(IDLE_CLOSE_REASON).is_err() {
                debug!(
                    connection_id = %release.connection.id(),
                    "evicted connection already gone; no close frame sent"
                );
            }
            self.announce_departure(release, REASON_TIMEOUT);
        }

        evicted.len()
    }

    fn announce_departure(&self, release: &Release, reason: &str) {
        if let Some(peer) = &release.peer {
            self.notify(
                peer,
                ServerEvent::PeerDisconnected {
                    session_id: release.session_id.clone(),
                    reason: reason.to_string(),
                },
            );
        }
    }

    /// Run [`sweep`](Self::sweep) on the profile's interval until aborted.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let channel = self.clone();
        let mut interval = tokio::time::interval(self.profile().sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let removed = channel.sweep(Instant::now());
                if removed > 0 {
                    debug!(channel = %channel.kind(), removed, "liveness sweep");
                }
            }
        })
    }
}
