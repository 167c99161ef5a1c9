use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::events::ServerFrame;

pub type ConnectionId = u64;

struct ConnectionHandle {
    user_id: Uuid,
    tx: UnboundedSender<ServerFrame>,
}

/// Owns the set of live sockets in this process. Each connection has an
/// unbounded outbound queue pumped by its socket task, so fan-out is a
/// non-blocking enqueue and per-connection delivery order is the enqueue
/// order. Lock order: this room table, then per-room map; nothing is
/// held across I/O (queue sends do not block).
pub struct ConnectionManager {
    rooms: RwLock<HashMap<String, HashMap<ConnectionId, ConnectionHandle>>>,
    next_id: AtomicU64,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a socket's outbound queue. Returns the connection id used
    /// for echo suppression and removal.
    pub fn accept(
        &self,
        room: &str,
        user_id: Uuid,
        tx: UnboundedSender<ServerFrame>,
    ) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        rooms
            .entry(room.to_string())
            .or_default()
            .insert(id, ConnectionHandle { user_id, tx });
        id
    }

    pub fn close(&self, room: &str, id: ConnectionId) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        if let Some(conns) = rooms.get_mut(room) {
            conns.remove(&id);
            if conns.is_empty() {
                rooms.remove(room);
            }
        }
    }

    /// Fan out to every local socket in the room, optionally excluding one
    /// connection. A closed receiver just drops the frame; the socket task
    /// cleans itself up.
    pub fn broadcast(&self, room: &str, frame: &ServerFrame, exclude: Option<ConnectionId>) {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        if let Some(conns) = rooms.get(room) {
            for (id, conn) in conns {
                if Some(*id) == exclude {
                    continue;
                }
                let _ = conn.tx.send(frame.clone());
            }
        }
    }

    /// Deliver to a single connection. Returns false if it is gone.
    pub fn send(&self, room: &str, id: ConnectionId, frame: ServerFrame) -> bool {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .get(room)
            .and_then(|conns| conns.get(&id))
            .map(|conn| conn.tx.send(frame).is_ok())
            .unwrap_or(false)
    }

    /// Whether this instance still hosts any connection for the user in
    /// the room. The bus subscriber uses this to re-assert presence when
    /// another instance announces a premature leave.
    pub fn has_user(&self, room: &str, user_id: Uuid) -> bool {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .get(room)
            .map(|conns| conns.values().any(|c| c.user_id == user_id))
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.values().map(|c| c.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn frame() -> ServerFrame {
        ServerFrame::error("x")
    }

    #[test]
    fn broadcast_reaches_room_members_only() {
        let mgr = ConnectionManager::new();
        let user = Uuid::new_v4();
        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        let (tx_other, mut rx_other) = unbounded_channel();
        mgr.accept("default", user, tx_a);
        mgr.accept("default", user, tx_b);
        mgr.accept("lounge", user, tx_other);

        mgr.broadcast("default", &frame(), None);

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_other.try_recv().is_err());
    }

    #[test]
    fn broadcast_respects_exclusion() {
        let mgr = ConnectionManager::new();
        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        let a = mgr.accept("default", Uuid::new_v4(), tx_a);
        mgr.accept("default", Uuid::new_v4(), tx_b);

        mgr.broadcast("default", &frame(), Some(a));

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn close_removes_connection_and_empty_room() {
        let mgr = ConnectionManager::new();
        let user = Uuid::new_v4();
        let (tx, _rx) = unbounded_channel();
        let id = mgr.accept("default", user, tx);
        assert!(mgr.has_user("default", user));

        mgr.close("default", id);
        assert!(!mgr.has_user("default", user));
        assert_eq!(mgr.connection_count(), 0);
    }

    #[test]
    fn send_targets_one_connection() {
        let mgr = ConnectionManager::new();
        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        let a = mgr.accept("default", Uuid::new_v4(), tx_a);
        mgr.accept("default", Uuid::new_v4(), tx_b);

        assert!(mgr.send("default", a, frame()));
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
        assert!(!mgr.send("default", 9999, frame()));
    }
}
