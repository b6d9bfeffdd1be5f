//! In-memory session registry.
//!
//! Two maps keyed by session id (one per role) plus a reverse index from
//! connection to the slot it occupies. A session exists exactly as long as at
//! least one of its two slots is occupied; there is no separate session record
//! that could linger after both peers are gone.
//!
//! The registry does no I/O and no locking. Callers serialize access (see
//! [`crate::channel::RelayChannel`]) and deliver any notifications after the
//! mutation has been committed.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use serde_json::Value;
use time::OffsetDateTime;

use crate::{
    connection::{Connection, ConnectionId},
    protocol::{MessageKind, Role},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub session_id: String,
    pub role: Role,
}

#[derive(Debug)]
pub struct Slot {
    connection: Connection,
    last_seen: Instant,
    cached_frame: Option<CachedFrame>,
}

impl Slot {
    fn new(connection: Connection, now: Instant) -> Self {
        Self {
            connection,
            last_seen: now,
            cached_frame: None,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn liveness(&self, now: Instant, timeout: Duration) -> Liveness {
        if now.saturating_duration_since(self.last_seen) > timeout {
            Liveness::Expired
        } else {
            Liveness::Alive
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Expired,
}

/// Most recent stream payload sent by a host, kept for pull-based viewers.
#[derive(Debug, Clone)]
pub struct CachedFrame {
    pub kind: MessageKind,
    pub payload: Arc<Value>,
    pub captured_at: OffsetDateTime,
}

#[derive(Debug)]
pub enum FrameLookup {
    HostOffline,
    NoDataYet,
    Frame(CachedFrame),
}

/// A slot that was vacated, with the peer that should hear about it.
#[derive(Debug)]
pub struct Release {
    pub session_id: String,
    pub role: Role,
    pub connection: Connection,
    pub peer: Option<Connection>,
}

#[derive(Debug)]
pub struct Registration {
    /// The opposite role already holds a connection for this session.
    pub paired: bool,
    pub peer: Option<Connection>,
    /// Previous occupant of the same slot, replaced without notice.
    pub superseded: Option<Connection>,
    /// Slot this connection held before moving here.
    pub moved_from: Option<Release>,
    /// The connection already held this exact slot; only `last_seen` moved.
    pub already_registered: bool,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    hosts: HashMap<String, Slot>,
    viewers: HashMap<String, Slot>,
    index: HashMap<ConnectionId, SlotKey>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self, role: Role) -> &HashMap<String, Slot> {
        match role {
            Role::Host => &self.hosts,
            Role::Viewer => &self.viewers,
        }
    }

    fn slots_mut(&mut self, role: Role) -> &mut HashMap<String, Slot> {
        match role {
            Role::Host => &mut self.hosts,
            Role::Viewer => &mut self.viewers,
        }
    }

    /// Put `connection` into the `role` slot of `session_id`.
    ///
    /// Last writer wins: a connection already sitting elsewhere is released
    /// first, and whoever held the target slot is dropped from the index.
    pub fn register(
        &mut self,
        role: Role,
        session_id: &str,
        connection: Connection,
        now: Instant,
    ) -> Registration {
        let target = SlotKey {
            session_id: session_id.to_string(),
            role,
        };

        let mut moved_from = None;
        let mut superseded = None;
        let mut already_registered = false;
        match self.index.get(&connection.id()) {
            Some(current) if *current == target => {
                already_registered = true;
                if let Some(slot) = self.slots_mut(role).get_mut(session_id) {
                    slot.last_seen = now;
                }
            }
            Some(_) => moved_from = self.release(connection.id()),
            None => {}
        }

        if !already_registered {
            self.index.insert(connection.id(), target);
            let previous = self
                .slots_mut(role)
                .insert(session_id.to_string(), Slot::new(connection, now));
            if let Some(previous) = previous {
                self.index.remove(&previous.connection.id());
                superseded = Some(previous.connection);
            }
        }

        let peer = self.lookup_peer(session_id, role).cloned();
        Registration {
            paired: peer.is_some(),
            peer,
            superseded,
            moved_from,
            already_registered,
        }
    }

    /// Connection registered in the role opposite to `role`.
    pub fn lookup_peer(&self, session_id: &str, role: Role) -> Option<&Connection> {
        self.slots(role.opposite())
            .get(session_id)
            .map(Slot::connection)
    }

    pub fn occupant(&self, session_id: &str, role: Role) -> Option<&Connection> {
        self.slots(role).get(session_id).map(Slot::connection)
    }

    pub fn locate(&self, connection_id: ConnectionId) -> Option<&SlotKey> {
        self.index.get(&connection_id)
    }

    /// Vacate whatever slot `connection_id` occupies.
    pub fn release(&mut self, connection_id: ConnectionId) -> Option<Release> {
        let key = self.index.remove(&connection_id)?;
        let slot = self.slots_mut(key.role).remove(&key.session_id)?;
        let peer = self.lookup_peer(&key.session_id, key.role).cloned();
        Some(Release {
            session_id: key.session_id,
            role: key.role,
            connection: slot.connection,
            peer,
        })
    }

    pub fn touch(&mut self, session_id: &str, role: Role, now: Instant) -> bool {
        match self.slots_mut(role).get_mut(session_id) {
            Some(slot) => {
                slot.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn touch_connection(&mut self, connection_id: ConnectionId, now: Instant) -> bool {
        let Some(key) = self.index.get(&connection_id).cloned() else {
            return false;
        };
        self.touch(&key.session_id, key.role, now)
    }

    pub fn cache_frame(
        &mut self,
        session_id: &str,
        kind: MessageKind,
        payload: Arc<Value>,
    ) -> bool {
        match self.hosts.get_mut(session_id) {
            Some(slot) => {
                slot.cached_frame = Some(CachedFrame {
                    kind,
                    payload,
                    captured_at: OffsetDateTime::now_utc(),
                });
                true
            }
            None => false,
        }
    }

    pub fn cached_frame(&self, session_id: &str) -> FrameLookup {
        match self.hosts.get(session_id) {
            None => FrameLookup::HostOffline,
            Some(slot) => match &slot.cached_frame {
                Some(frame) => FrameLookup::Frame(frame.clone()),
                None => FrameLookup::NoDataYet,
            },
        }
    }

    /// Connections whose `last_seen` is older than `timeout` at `now`.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<ConnectionId> {
        self.hosts
            .values()
            .chain(self.viewers.values())
            .filter(|slot| slot.liveness(now, timeout) == Liveness::Expired)
            .map(|slot| slot.connection.id())
            .collect()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    pub fn session_count(&self) -> usize {
        self.session_ids().len()
    }

    /// Distinct session ids with at least one occupied slot, sorted.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .hosts
            .keys()
            .chain(self.viewers.keys().filter(|id| !self.hosts.contains_key(*id)))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        assert_eq!(self.index.len(), self.hosts.len() + self.viewers.len());
        for (id, key) in &self.index {
            let slot = self
                .slots(key.role)
                .get(&key.session_id)
                .expect("indexed slot must exist");
            assert_eq!(slot.connection.id(), *id);
        }
    }
}
