#![forbid(unsafe_code)]

// Connection registry - every live socket and its per-connection state

use super::protocol::Outbound;
use crate::room::{Member, Role, RoomManager};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};
use uuid::Uuid;

struct ConnectionRecord {
    role: Option<Role>,
    room: Option<String>,
    alive: Arc<AtomicBool>,
    sender: mpsc::Sender<Outbound>,
    terminate: Arc<Notify>,
}

/// Snapshot of one connection's state
#[derive(Clone, Debug)]
pub struct Connection {
    pub id: String,
    pub role: Option<Role>,
    /// Room the connection has joined; `None` while unjoined
    pub room: Option<String>,
    pub alive: Arc<AtomicBool>,
    pub sender: mpsc::Sender<Outbound>,
    /// Notified to make the socket task stop and run its disconnect cleanup
    pub terminate: Arc<Notify>,
}

impl Connection {
    pub fn is_joined(&self) -> bool {
        self.room.is_some()
    }

    /// Room membership entry delivering to this connection's socket
    pub fn member(&self, role: Role) -> Member {
        Member {
            role,
            sender: self.sender.clone(),
            terminate: self.terminate.clone(),
        }
    }
}

/// Live connections keyed by connection id.
///
/// Lookups take a brief std::sync::RwLock and never hold it across an await.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<StdRwLock<HashMap<String, ConnectionRecord>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an id for a freshly accepted socket. The connection starts
    /// alive and unjoined.
    pub fn register(&self, sender: mpsc::Sender<Outbound>) -> String {
        let id = Uuid::new_v4().to_string();
        let record = ConnectionRecord {
            role: None,
            room: None,
            alive: Arc::new(AtomicBool::new(true)),
            sender,
            terminate: Arc::new(Notify::new()),
        };
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.insert(id.clone(), record);
        debug!("Registered connection {}", id);
        id
    }

    pub fn lookup(&self, id: &str) -> Option<Connection> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(id).map(|record| snapshot(id, record))
    }

    /// Records the joined room and role, or clears them with `None`
    pub fn set_room(&self, id: &str, joined: Option<(String, Role)>) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = map.get_mut(id) {
            match joined {
                Some((room_id, role)) => {
                    record.room = Some(room_id);
                    record.role = Some(role);
                }
                None => {
                    record.room = None;
                    record.role = None;
                }
            }
        }
    }

    /// Refreshes the liveness flag
    pub fn mark_alive(&self, id: &str) {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = map.get(id) {
            record.alive.store(true, Ordering::Relaxed);
        }
    }

    /// Leaves the connection's room (releasing its resources) and forgets it.
    /// Unknown ids are a no-op. Returns whether the connection was registered.
    pub async fn unregister(&self, id: &str, rooms: &RoomManager) -> bool {
        let Some(connection) = self.lookup(id) else {
            return false;
        };

        if let Some(room_id) = &connection.room {
            rooms.leave(room_id, id).await;
        }

        let removed = {
            let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
            map.remove(id).is_some()
        };
        if removed {
            info!("Connection {} unregistered", id);
        }
        removed
    }

    /// Snapshots of every live connection
    pub fn connections(&self) -> Vec<Connection> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.iter().map(|(id, record)| snapshot(id, record)).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn snapshot(id: &str, record: &ConnectionRecord) -> Connection {
    Connection {
        id: id.to_string(),
        role: record.role,
        room: record.room.clone(),
        alive: record.alive.clone(),
        sender: record.sender.clone(),
        terminate: record.terminate.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::InMemoryEngine;
    use crate::metrics::ServerMetrics;

    fn rooms() -> (RoomManager, InMemoryEngine) {
        let engine = InMemoryEngine::new();
        (
            RoomManager::new(Arc::new(engine.clone()), ServerMetrics::new()),
            engine,
        )
    }

    #[tokio::test]
    async fn test_register_starts_unjoined_and_alive() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let id = registry.register(tx);

        let conn = registry.lookup(&id).unwrap();
        assert!(!conn.is_joined());
        assert!(conn.role.is_none());
        assert!(conn.alive.load(Ordering::Relaxed));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_set_room_and_clear() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let id = registry.register(tx);

        registry.set_room(&id, Some(("r1".to_string(), Role::Viewer)));
        let conn = registry.lookup(&id).unwrap();
        assert_eq!(conn.room.as_deref(), Some("r1"));
        assert_eq!(conn.role, Some(Role::Viewer));

        registry.set_room(&id, None);
        assert!(!registry.lookup(&id).unwrap().is_joined());
    }

    #[tokio::test]
    async fn test_unregister_leaves_room() {
        let registry = ConnectionRegistry::new();
        let (rooms, engine) = rooms();
        let (tx, _rx) = mpsc::channel(8);
        let id = registry.register(tx);

        let member = registry.lookup(&id).unwrap().member(Role::Broadcaster);
        rooms.join("r1", &id, member).await.unwrap();
        registry.set_room(&id, Some(("r1".to_string(), Role::Broadcaster)));

        assert!(registry.unregister(&id, &rooms).await);
        assert!(registry.lookup(&id).is_none());
        assert_eq!(rooms.room_count(), 0);
        assert_eq!(engine.routers_closed(), 1);

        assert!(!registry.unregister(&id, &rooms).await);
        assert!(registry.is_empty());
    }
}
