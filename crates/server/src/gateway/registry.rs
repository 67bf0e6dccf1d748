//! Connection and subscription registry.
//!
//! Tracks the live sockets and which room each one is subscribed to.
//! Mutated only by the gateway on join/leave/close, read by the
//! dispatcher on fan-out. The lock is held just long enough to snapshot
//! or mutate the maps, never across I/O; actual sends go through each
//! connection's mpsc channel after the lock is released.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::protocol::ServerEvent;

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

#[derive(Default)]
struct RegistryInner {
    /// connection id → outbound channel
    senders: HashMap<String, EventSender>,
    /// room id → subscribed connection ids
    rooms: HashMap<String, HashSet<String>>,
    /// connection id → currently subscribed room
    conn_room: HashMap<String, String>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn_id: &str, sender: EventSender) {
        self.inner
            .write()
            .senders
            .insert(conn_id.to_string(), sender);
    }

    /// Removes a connection entirely, returning the room it was
    /// subscribed to (if any) so the caller can announce the departure.
    pub fn deregister(&self, conn_id: &str) -> Option<String> {
        let mut inner = self.inner.write();
        inner.senders.remove(conn_id);
        let room_id = inner.conn_room.remove(conn_id);
        if let Some(ref room_id) = room_id {
            if let Some(subscribers) = inner.rooms.get_mut(room_id) {
                subscribers.remove(conn_id);
                if subscribers.is_empty() {
                    inner.rooms.remove(room_id);
                }
            }
        }
        room_id
    }

    /// Subscribes a connection to a room, dropping any prior
    /// subscription first: a connection is in at most one room at a
    /// time. Returns the replaced room, if any.
    pub fn subscribe(&self, conn_id: &str, room_id: &str) -> Option<String> {
        let mut inner = self.inner.write();

        let previous = inner.conn_room.remove(conn_id);
        if let Some(ref prev) = previous {
            if let Some(subscribers) = inner.rooms.get_mut(prev) {
                subscribers.remove(conn_id);
                if subscribers.is_empty() {
                    inner.rooms.remove(prev);
                }
            }
        }

        inner
            .conn_room
            .insert(conn_id.to_string(), room_id.to_string());
        inner
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(conn_id.to_string());

        previous.filter(|prev| prev != room_id)
    }

    pub fn current_room(&self, conn_id: &str) -> Option<String> {
        self.inner.read().conn_room.get(conn_id).cloned()
    }

    /// Pushes an event to one connection. Returns false when the
    /// connection is not (or no longer) registered.
    pub fn send_to(&self, conn_id: &str, event: ServerEvent) -> bool {
        let sender = self.inner.read().senders.get(conn_id).cloned();
        match sender {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Fans an event out to every connection currently subscribed to a
    /// room, at most once per connection. Closed channels are ignored;
    /// a momentarily disconnected subscriber simply misses the event.
    pub fn broadcast(&self, room_id: &str, event: ServerEvent, exclude: Option<&str>) {
        let targets: Vec<EventSender> = {
            let inner = self.inner.read();
            match inner.rooms.get(room_id) {
                Some(subscribers) => subscribers
                    .iter()
                    .filter(|conn_id| Some(conn_id.as_str()) != exclude)
                    .filter_map(|conn_id| inner.senders.get(conn_id).cloned())
                    .collect(),
                None => return,
            }
        };

        for tx in targets {
            let _ = tx.send(event.clone());
        }
    }
}
