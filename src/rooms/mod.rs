//! Local socket rooms.
//!
//! Every connection owns an unbounded outbound channel drained by its socket
//! writer task; a room is a set of connection ids. Fan-out clones the event
//! per member, and a member whose channel is gone is logged and skipped —
//! one dead socket never blocks the rest of the room.

use crate::events::ServerEvent;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

pub fn chat_room(chat_id: &str) -> String {
    format!("chat:{chat_id}")
}

pub fn thread_room(thread_id: &str) -> String {
    format!("thread:{thread_id}")
}

/// One client socket: identity plus the outbound event channel.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: String,
    pub sender_id: String,
    outbound: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn new(sender_id: impl Into<String>, outbound: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            outbound,
        }
    }

    /// Queue an event for this socket; false when the socket is gone.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.outbound.send(event).is_ok()
    }
}

#[derive(Default)]
struct RoomState {
    connections: HashMap<String, ConnectionHandle>,
    rooms: HashMap<String, HashSet<String>>,
    /// Rooms per connection, for O(memberships) cleanup on disconnect.
    memberships: HashMap<String, HashSet<String>>,
}

/// Registry of local connections and their room memberships.
#[derive(Default)]
pub struct RoomRegistry {
    inner: Mutex<RoomState>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn: ConnectionHandle) {
        let mut state = self.inner.lock();
        state.memberships.entry(conn.id.clone()).or_default();
        state.connections.insert(conn.id.clone(), conn);
    }

    /// Remove the connection from the registry and every room it joined.
    pub fn unregister(&self, conn_id: &str) -> Option<ConnectionHandle> {
        let mut state = self.inner.lock();
        if let Some(rooms) = state.memberships.remove(conn_id) {
            for room in rooms {
                if let Some(members) = state.rooms.get_mut(&room) {
                    members.remove(conn_id);
                    if members.is_empty() {
                        state.rooms.remove(&room);
                    }
                }
            }
        }
        state.connections.remove(conn_id)
    }

    pub fn join(&self, room: &str, conn_id: &str) -> bool {
        let mut state = self.inner.lock();
        if !state.connections.contains_key(conn_id) {
            return false;
        }
        state
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(conn_id.to_string());
        state
            .memberships
            .entry(conn_id.to_string())
            .or_default()
            .insert(room.to_string());
        true
    }

    pub fn leave(&self, room: &str, conn_id: &str) -> bool {
        let mut state = self.inner.lock();
        let left = state
            .rooms
            .get_mut(room)
            .is_some_and(|members| members.remove(conn_id));
        if let Some(rooms) = state.memberships.get_mut(conn_id) {
            rooms.remove(room);
        }
        left
    }

    /// Synchronous fan-out to every member of the room. Returns how many
    /// sockets accepted the event.
    pub fn broadcast(&self, room: &str, event: &ServerEvent) -> usize {
        let handles: Vec<ConnectionHandle> = {
            let state = self.inner.lock();
            state
                .rooms
                .get(room)
                .map(|members| {
                    members
                        .iter()
                        .filter_map(|id| state.connections.get(id).cloned())
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut delivered = 0;
        for handle in handles {
            if handle.send(event.clone()) {
                delivered += 1;
            } else {
                warn!(connection = %handle.id, room, "skipping closed socket during fan-out");
            }
        }
        debug!(room, delivered, "room fan-out");
        delivered
    }

    pub fn send_to(&self, conn_id: &str, event: ServerEvent) -> bool {
        let handle = self.inner.lock().connections.get(conn_id).cloned();
        handle.is_some_and(|h| h.send(event))
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.inner.lock().rooms.get(room).map_or(0, HashSet::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(registry: &RoomRegistry, sender: &str) -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(sender, tx);
        registry.register(handle.clone());
        (handle, rx)
    }

    fn probe_event() -> ServerEvent {
        ServerEvent::MessageFailed {
            message_id: "m1".into(),
            error: "probe".into(),
        }
    }

    #[test]
    fn broadcast_reaches_only_room_members() {
        let registry = RoomRegistry::new();
        let (a, mut a_rx) = connect(&registry, "u1");
        let (_b, mut b_rx) = connect(&registry, "u2");
        registry.join("chat:c1", &a.id);

        assert_eq!(registry.broadcast("chat:c1", &probe_event()), 1);
        assert!(a_rx.try_recv().is_ok());
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn dead_socket_does_not_abort_fan_out() {
        let registry = RoomRegistry::new();
        let (a, a_rx) = connect(&registry, "u1");
        let (b, mut b_rx) = connect(&registry, "u2");
        registry.join("chat:c1", &a.id);
        registry.join("chat:c1", &b.id);
        drop(a_rx);

        assert_eq!(registry.broadcast("chat:c1", &probe_event()), 1);
        assert!(b_rx.try_recv().is_ok());
    }

    #[test]
    fn unregister_leaves_all_rooms() {
        let registry = RoomRegistry::new();
        let (a, _rx) = connect(&registry, "u1");
        registry.join("chat:c1", &a.id);
        registry.join("thread:t1", &a.id);

        let removed = registry.unregister(&a.id);
        assert_eq!(removed.map(|c| c.sender_id), Some("u1".to_string()));
        assert_eq!(registry.room_size("chat:c1"), 0);
        assert_eq!(registry.room_size("thread:t1"), 0);
        assert!(!registry.join("chat:c1", &a.id));
    }

    #[test]
    fn leave_is_scoped_to_one_room() {
        let registry = RoomRegistry::new();
        let (a, _rx) = connect(&registry, "u1");
        registry.join("chat:c1", &a.id);
        registry.join("thread:t1", &a.id);

        assert!(registry.leave("chat:c1", &a.id));
        assert_eq!(registry.room_size("chat:c1"), 0);
        assert_eq!(registry.room_size("thread:t1"), 1);
        assert!(!registry.leave("chat:c1", &a.id));
    }
}
