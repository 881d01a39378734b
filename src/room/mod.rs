#![forbid(unsafe_code)]

// Room module - per-room membership and resource tables, lazy creation and teardown
pub mod broker;

pub use broker::{ReleaseSummary, ResourceBroker};

use crate::error::{ProtocolError, ResourceKind, SignalError, SignalResult};
use crate::media::{
    ConsumerHandle, ConsumerInfo, MediaEngine, MediaKind, ProducerHandle, ProducerInfo,
    RouterHandle, TransportDirection, TransportHandle, TransportInfo,
};
use crate::metrics::ServerMetrics;
use crate::signaling::protocol::{Outbound, ServerMessage, UserInfo};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tokio::sync::{Notify, OnceCell};
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};

/// Role chosen by a connection when it joins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Broadcaster,
    Viewer,
}

impl Role {
    pub fn from_is_viewer(is_viewer: bool) -> Self {
        if is_viewer {
            Role::Viewer
        } else {
            Role::Broadcaster
        }
    }

    pub fn is_viewer(self) -> bool {
        self == Role::Viewer
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Broadcaster => f.write_str("broadcaster"),
            Role::Viewer => f.write_str("viewer"),
        }
    }
}

/// Room member: its role, where to deliver notifications, and how to drop
/// the connection when a notification cannot be queued
#[derive(Clone)]
pub struct Member {
    pub role: Role,
    pub sender: mpsc::Sender<Outbound>,
    pub terminate: Arc<Notify>,
}

struct TransportEntry {
    owner: String,
    direction: TransportDirection,
    handle: Box<dyn TransportHandle>,
}

struct ProducerEntry {
    owner: String,
    kind: MediaKind,
    handle: Box<dyn ProducerHandle>,
}

struct ConsumerEntry {
    owner: String,
    producer_id: String,
    handle: Box<dyn ConsumerHandle>,
}

/// Room state
pub struct Room {
    pub id: String,
    /// `None` once the room has been torn down
    router: Option<Box<dyn RouterHandle>>,
    members: HashMap<String, Member>,
    transports: HashMap<String, TransportEntry>,
    producers: HashMap<String, ProducerEntry>,
    consumers: HashMap<String, ConsumerEntry>,
    metrics: ServerMetrics,
}

impl Room {
    fn new(id: String, router: Box<dyn RouterHandle>, metrics: ServerMetrics) -> Self {
        Self {
            id,
            router: Some(router),
            members: HashMap::new(),
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            metrics,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.router.is_none()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_member(&self, connection_id: &str) -> bool {
        self.members.contains_key(connection_id)
    }

    fn router(&self) -> SignalResult<&dyn RouterHandle> {
        self.router
            .as_deref()
            .ok_or_else(|| SignalError::not_found(ResourceKind::Room, self.id.clone()))
    }

    fn ensure_member(&self, connection_id: &str) -> SignalResult<()> {
        if self.is_member(connection_id) {
            Ok(())
        } else {
            Err(ProtocolError::NotJoined.into())
        }
    }

    fn owned_transport(&self, connection_id: &str, transport_id: &str) -> SignalResult<&TransportEntry> {
        self.transports
            .get(transport_id)
            .filter(|entry| entry.owner == connection_id)
            .ok_or_else(|| SignalError::not_found(ResourceKind::Transport, transport_id))
    }

    fn producer_list(&self) -> Vec<ProducerInfo> {
        self.producers
            .iter()
            .map(|(id, entry)| ProducerInfo {
                producer_id: id.clone(),
                user_id: entry.owner.clone(),
                kind: entry.kind,
            })
            .collect()
    }

    fn user_list(&self) -> Vec<UserInfo> {
        self.members
            .iter()
            .map(|(id, member)| UserInfo {
                user_id: id.clone(),
                is_viewer: member.role.is_viewer(),
            })
            .collect()
    }

    /// Queues a room notification. A member whose channel is full has missed
    /// state it cannot recover, so its connection is terminated and the client
    /// resyncs from a fresh join.
    fn deliver(&self, member_id: &str, member: &Member, outbound: Outbound) {
        match member.sender.try_send(outbound) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Channel full for {} in room {}, terminating connection",
                    member_id, self.id
                );
                member.terminate.notify_one();
                self.metrics.delivery_overflow();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Channel closed for {} in room {} (disconnected)", member_id, self.id);
            }
        }
    }

    /// Send a message to a specific member
    fn send_to(&self, member_id: &str, message: &ServerMessage) {
        let Some(member) = self.members.get(member_id) else {
            return;
        };
        if let Some(outbound) = Outbound::encode(message) {
            self.deliver(member_id, member, outbound);
        }
    }

    /// Broadcast a message to all members except `sender_id`
    fn broadcast_except(&self, sender_id: &str, message: &ServerMessage) {
        let Some(outbound) = Outbound::encode(message) else {
            return;
        };
        for (id, member) in &self.members {
            if id != sender_id {
                self.deliver(id, member, outbound.clone());
            }
        }
    }

    /// Broadcast a message to every viewer except `sender_id`
    fn broadcast_to_viewers_except(&self, sender_id: &str, message: &ServerMessage) {
        let Some(outbound) = Outbound::encode(message) else {
            return;
        };
        for (id, member) in &self.members {
            if id != sender_id && member.role.is_viewer() {
                self.deliver(id, member, outbound.clone());
            }
        }
    }
}

/// Members and producers seen by a joining connection
#[derive(Debug, Clone)]
pub struct JoinSnapshot {
    pub users: Vec<UserInfo>,
    pub producers: Vec<ProducerInfo>,
}

type RoomSlot = Arc<OnceCell<Arc<TokioRwLock<Room>>>>;

/// Manages all rooms.
///
/// The outer map sits behind a std::sync::RwLock held only for brief
/// lookups and inserts, never across await points. Each room has its own
/// tokio::sync::RwLock, held across engine calls so that all mutation of one
/// room is serialized while other rooms proceed independently.
///
/// Map values are once-cells: concurrent joins of an unseen room share a
/// single router creation.
pub struct RoomManager {
    rooms: StdRwLock<HashMap<String, RoomSlot>>,
    /// Members across all rooms, readable without touching any room lock
    participants: AtomicUsize,
    engine: Arc<dyn MediaEngine>,
    broker: ResourceBroker,
    metrics: ServerMetrics,
}

impl RoomManager {
    pub fn new(engine: Arc<dyn MediaEngine>, metrics: ServerMetrics) -> Self {
        Self {
            rooms: StdRwLock::new(HashMap::new()),
            participants: AtomicUsize::new(0),
            engine,
            broker: ResourceBroker::new(metrics.clone()),
            metrics,
        }
    }

    /// Gets a live room (brief outer read lock, no await)
    fn existing(&self, room_id: &str) -> Option<Arc<TokioRwLock<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).and_then(|slot| slot.get().cloned())
    }

    fn room(&self, room_id: &str) -> SignalResult<Arc<TokioRwLock<Room>>> {
        self.existing(room_id)
            .ok_or_else(|| SignalError::not_found(ResourceKind::Room, room_id))
    }

    /// Gets or creates a room, creating its router if needed.
    ///
    /// # Errors
    /// Returns `EngineFailure` if the router cannot be created; nothing is
    /// registered in that case.
    pub async fn get_or_create(&self, room_id: &str) -> SignalResult<Arc<TokioRwLock<Room>>> {
        let slot = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms
                .entry(room_id.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let created = slot
            .get_or_try_init(|| async {
                info!("Creating new room: {}", room_id);
                let router = self.engine.create_router().await?;
                self.metrics.resource_opened(ResourceKind::Room);
                debug!("Room {} uses router {}", room_id, router.id());
                Ok::<_, SignalError>(Arc::new(TokioRwLock::new(Room::new(
                    room_id.to_string(),
                    router,
                    self.metrics.clone(),
                ))))
            })
            .await;
        let err = match created {
            Ok(room) => return Ok(room.clone()),
            Err(e) => e,
        };

        warn!("Failed to create room {}: {}", room_id, err);
        let slot_ptr = Arc::as_ptr(&slot);
        drop(slot);
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        // Once the map holds the only reference, no waiter is left to retry
        // the creation; a waiter still holding one cleans up after itself
        let abandoned = rooms.get(room_id).is_some_and(|current| {
            std::ptr::eq(Arc::as_ptr(current), slot_ptr)
                && !current.initialized()
                && Arc::strong_count(current) == 1
        });
        if abandoned {
            rooms.remove(room_id);
        }
        Err(err)
    }

    /// Adds `connection_id` to the room, creating the room on first join.
    ///
    /// Sends `room-joined` to the joiner and `user-joined` to every other
    /// member inside the same critical section.
    pub async fn join(
        &self,
        room_id: &str,
        connection_id: &str,
        member: Member,
    ) -> SignalResult<JoinSnapshot> {
        let role = member.role;
        loop {
            let room_lock = self.get_or_create(room_id).await?;
            let mut room = room_lock.write().await;
            if room.is_closed() {
                // Torn down between lookup and lock; the slot is gone, so retry creates a fresh room
                continue;
            }

            if room
                .members
                .insert(connection_id.to_string(), member.clone())
                .is_none()
            {
                self.participants.fetch_add(1, Ordering::Relaxed);
                self.metrics.member_joined();
            }
            info!("{} joined room {} as {}", connection_id, room_id, role);

            let snapshot = JoinSnapshot {
                users: room
                    .user_list()
                    .into_iter()
                    .filter(|u| u.user_id != connection_id)
                    .collect(),
                producers: room.producer_list(),
            };

            room.send_to(
                connection_id,
                &ServerMessage::RoomJoined {
                    room_id: room_id.to_string(),
                    user_id: connection_id.to_string(),
                    is_viewer: role.is_viewer(),
                    users: snapshot.users.clone(),
                    producers: snapshot.producers.clone(),
                },
            );
            room.broadcast_except(
                connection_id,
                &ServerMessage::UserJoined {
                    user_id: connection_id.to_string(),
                    is_viewer: role.is_viewer(),
                },
            );

            return Ok(snapshot);
        }
    }

    /// Removes `connection_id` from the room, releasing everything it owns and
    /// tearing the room down when it becomes empty.
    ///
    /// Returns whether the connection was a member; a repeated call is a no-op.
    pub async fn leave(&self, room_id: &str, connection_id: &str) -> bool {
        let Some(room_lock) = self.existing(room_id) else {
            return false;
        };
        let mut room = room_lock.write().await;

        if room.members.remove(connection_id).is_none() {
            return false;
        }
        self.participants.fetch_sub(1, Ordering::Relaxed);
        self.metrics.member_left();
        info!("{} left room {}", connection_id, room_id);

        self.broker.release_all_for(&mut room, connection_id);

        room.broadcast_except(
            connection_id,
            &ServerMessage::UserLeft {
                user_id: connection_id.to_string(),
            },
        );

        if room.members.is_empty() {
            self.teardown(&room_lock, &mut room);
        }
        true
    }

    /// Closes the router exactly once and unregisters the room.
    /// Caller holds the room's write lock.
    fn teardown(&self, room_lock: &Arc<TokioRwLock<Room>>, room: &mut Room) {
        let Some(router) = room.router.take() else {
            return;
        };
        // Members are gone, so their resources are already released; this only
        // catches rows left behind by a concurrent failure.
        let leftovers: Vec<String> = room
            .transports
            .values()
            .map(|t| t.owner.clone())
            .chain(room.producers.values().map(|p| p.owner.clone()))
            .chain(room.consumers.values().map(|c| c.owner.clone()))
            .collect();
        for owner in leftovers {
            self.broker.release_all_for(room, &owner);
        }

        router.close();
        self.metrics.resource_closed(ResourceKind::Room, 1);

        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        let registered = rooms
            .get(&room.id)
            .and_then(|slot| slot.get())
            .is_some_and(|current| Arc::ptr_eq(current, room_lock));
        if registered {
            rooms.remove(&room.id);
        }
        info!("Room {} is empty, cleaning up", room.id);
    }

    /// Router RTP capabilities for a room
    pub async fn rtp_capabilities(&self, room_id: &str) -> SignalResult<Value> {
        let room_lock = self.room(room_id)?;
        let room = room_lock.read().await;
        Ok(room.router()?.rtp_capabilities())
    }

    pub async fn create_transport(
        &self,
        room_id: &str,
        connection_id: &str,
        direction: TransportDirection,
    ) -> SignalResult<TransportInfo> {
        let room_lock = self.room(room_id)?;
        let mut room = room_lock.write().await;
        self.broker.create_transport(&mut room, connection_id, direction).await
    }

    pub async fn connect_transport(
        &self,
        room_id: &str,
        connection_id: &str,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> SignalResult<()> {
        let room_lock = self.room(room_id)?;
        let mut room = room_lock.write().await;
        self.broker
            .connect_transport(&mut room, connection_id, transport_id, dtls_parameters)
            .await
    }

    pub async fn produce(
        &self,
        room_id: &str,
        connection_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> SignalResult<String> {
        let room_lock = self.room(room_id)?;
        let mut room = room_lock.write().await;
        self.broker
            .produce(&mut room, connection_id, transport_id, kind, rtp_parameters)
            .await
    }

    pub async fn list_producers(&self, room_id: &str) -> SignalResult<Vec<ProducerInfo>> {
        let room_lock = self.room(room_id)?;
        let room = room_lock.read().await;
        Ok(self.broker.list_producers(&room))
    }

    pub async fn consume(
        &self,
        room_id: &str,
        connection_id: &str,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> SignalResult<ConsumerInfo> {
        let room_lock = self.room(room_id)?;
        let mut room = room_lock.write().await;
        self.broker
            .consume(&mut room, connection_id, transport_id, producer_id, rtp_capabilities)
            .await
    }

    pub async fn resume_consumer(
        &self,
        room_id: &str,
        connection_id: &str,
        consumer_id: &str,
    ) -> SignalResult<()> {
        let room_lock = self.room(room_id)?;
        let mut room = room_lock.write().await;
        self.broker.resume(&mut room, connection_id, consumer_id).await
    }

    /// Gracefully shuts down all rooms: releases every resource and closes every router.
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms...");

        let all_rooms: Vec<Arc<TokioRwLock<Room>>> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms
                .drain()
                .filter_map(|(_, slot)| slot.get().cloned())
                .collect()
        };

        for room_lock in &all_rooms {
            let mut room = room_lock.write().await;
            let member_ids: Vec<String> = room.members.keys().cloned().collect();
            for id in &member_ids {
                self.broker.release_all_for(&mut room, id);
                self.metrics.member_left();
            }
            room.members.clear();
            self.participants.fetch_sub(member_ids.len(), Ordering::Relaxed);
            if let Some(router) = room.router.take() {
                router.close();
                self.metrics.resource_closed(ResourceKind::Room, 1);
            }
            info!("Shut down room {} ({} members)", room.id, member_ids.len());
        }

        info!("All rooms shut down ({} total)", all_rooms.len());
    }

    /// Number of live rooms
    pub fn room_count(&self) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.values().filter(|slot| slot.initialized()).count()
    }

    /// Total members across all rooms. Never waits on a room lock.
    pub fn participant_count(&self) -> usize {
        self.participants.load(Ordering::Relaxed)
    }
}
