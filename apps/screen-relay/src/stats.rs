use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use serde::Serialize;
use time::OffsetDateTime;

use crate::registry::SessionRegistry;

/// Process-wide counters for one channel.
///
/// Only monotonic totals live here. Active host/viewer counts are read from
/// the registry on every snapshot so they can never drift from the maps.
#[derive(Debug)]
pub struct RelayStats {
    total_connections: AtomicU64,
    bytes_relayed: AtomicU64,
    messages_relayed: AtomicU64,
    started: Instant,
    started_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub active_hosts: usize,
    pub active_viewers: usize,
    pub active_sessions: usize,
    pub bytes_relayed: u64,
    pub messages_relayed: u64,
    /// Seconds since the channel was created.
    pub uptime: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            bytes_relayed: AtomicU64::new(0),
            messages_relayed: AtomicU64::new(0),
            started: Instant::now(),
            started_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn record_connection(&self) -> u64 {
        self.total_connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_relay(&self, bytes: usize) {
        self.messages_relayed.fetch_add(1, Ordering::Relaxed);
        if bytes > 0 {
            self.bytes_relayed.fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self, registry: &SessionRegistry) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_hosts: registry.host_count(),
            active_viewers: registry.viewer_count(),
            active_sessions: registry.session_count(),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
            uptime: self.started.elapsed().as_secs_f64(),
            start_time: self.started_at,
        }
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}
