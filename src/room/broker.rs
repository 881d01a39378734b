#![forbid(unsafe_code)]

// Resource broker - engine calls for transports, producers and consumers,
// with the bookkeeping that ties each handle to its room and owner.
//
// Every method takes the room by `&mut`, so callers must hold the room's write
// lock. Engine calls complete before anything is registered: a failed call
// leaves the tables untouched.

use super::{ConsumerEntry, ProducerEntry, Room, TransportEntry};
use crate::error::{ProtocolError, ResourceKind, SignalError, SignalResult};
use crate::media::{ConsumerInfo, MediaKind, ProducerInfo, TransportDirection, TransportInfo};
use crate::metrics::ServerMetrics;
use crate::signaling::protocol::ServerMessage;
use serde_json::Value;
use tracing::{debug, info};

/// What `release_all_for` closed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseSummary {
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

impl ReleaseSummary {
    pub fn is_empty(&self) -> bool {
        self.transports == 0 && self.producers == 0 && self.consumers == 0
    }
}

#[derive(Clone)]
pub struct ResourceBroker {
    metrics: ServerMetrics,
}

impl ResourceBroker {
    pub fn new(metrics: ServerMetrics) -> Self {
        Self { metrics }
    }

    /// Creates a WebRTC transport owned by `connection_id`
    ///
    /// # Errors
    /// `NotFound(room)` if the room was torn down, `EngineFailure` if the engine refuses
    pub async fn create_transport(
        &self,
        room: &mut Room,
        connection_id: &str,
        direction: TransportDirection,
    ) -> SignalResult<TransportInfo> {
        room.ensure_member(connection_id)?;

        let handle = room.router()?.create_webrtc_transport().await?;
        let info = handle.info();
        self.metrics.resource_opened(ResourceKind::Transport);

        room.transports.insert(
            info.id.clone(),
            TransportEntry {
                owner: connection_id.to_string(),
                direction,
                handle,
            },
        );

        debug!(
            "Created {} transport {} for {} in room {}",
            direction, info.id, connection_id, room.id
        );
        Ok(info)
    }

    /// Hands the client's DTLS parameters to the engine
    pub async fn connect_transport(
        &self,
        room: &mut Room,
        connection_id: &str,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> SignalResult<()> {
        room.ensure_member(connection_id)?;

        let entry = room.owned_transport(connection_id, transport_id)?;
        entry.handle.connect(dtls_parameters).await?;

        debug!("Connected transport {} for {}", transport_id, connection_id);
        Ok(())
    }

    /// Creates a producer and announces it to every other viewer in the room.
    ///
    /// Registration and the `new-producer` fan-out happen under the same room
    /// lock, so a viewer joining concurrently either receives the notification
    /// or finds the producer in its join snapshot, never both and never neither.
    pub async fn produce(
        &self,
        room: &mut Room,
        connection_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> SignalResult<String> {
        room.ensure_member(connection_id)?;

        let entry = room.owned_transport(connection_id, transport_id)?;
        if entry.direction != TransportDirection::Send {
            return Err(ProtocolError::WrongDirection {
                transport_id: transport_id.to_string(),
                actual: entry.direction.to_string(),
            }
            .into());
        }
        let handle = entry.handle.produce(kind, rtp_parameters).await?;
        let producer_id = handle.id();

        room.producers.insert(
            producer_id.clone(),
            ProducerEntry {
                owner: connection_id.to_string(),
                kind,
                handle,
            },
        );
        self.metrics.resource_opened(ResourceKind::Producer);

        room.broadcast_to_viewers_except(
            connection_id,
            &ServerMessage::NewProducer {
                producer_id: producer_id.clone(),
                user_id: connection_id.to_string(),
                kind,
            },
        );

        info!(
            "Created {} producer {} for {} in room {}",
            kind, producer_id, connection_id, room.id
        );
        Ok(producer_id)
    }

    /// Current producers in the room
    pub fn list_producers(&self, room: &Room) -> Vec<ProducerInfo> {
        room.producer_list()
    }

    /// Creates a paused consumer of `producer_id` on the caller's receive transport
    ///
    /// # Errors
    /// `NotFound(transport|producer)`, `Incompatible` when the capabilities
    /// cannot receive the producer, `EngineFailure` otherwise
    pub async fn consume(
        &self,
        room: &mut Room,
        connection_id: &str,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> SignalResult<ConsumerInfo> {
        room.ensure_member(connection_id)?;

        let entry = room.owned_transport(connection_id, transport_id)?;
        if entry.direction != TransportDirection::Recv {
            return Err(ProtocolError::WrongDirection {
                transport_id: transport_id.to_string(),
                actual: entry.direction.to_string(),
            }
            .into());
        }
        if !room.producers.contains_key(producer_id) {
            return Err(SignalError::not_found(ResourceKind::Producer, producer_id));
        }
        if !room.router()?.can_consume(producer_id, &rtp_capabilities) {
            return Err(SignalError::Incompatible(format!(
                "capabilities cannot consume producer {producer_id}"
            )));
        }

        let handle = entry.handle.consume(producer_id, rtp_capabilities).await?;
        let info = ConsumerInfo {
            id: handle.id(),
            producer_id: producer_id.to_string(),
            kind: handle.kind(),
            rtp_parameters: handle.rtp_parameters(),
            paused: true,
        };

        room.consumers.insert(
            info.id.clone(),
            ConsumerEntry {
                owner: connection_id.to_string(),
                producer_id: producer_id.to_string(),
                handle,
            },
        );
        self.metrics.resource_opened(ResourceKind::Consumer);

        debug!(
            "Created consumer {} of producer {} for {} in room {}",
            info.id, producer_id, connection_id, room.id
        );
        Ok(info)
    }

    /// Resumes a consumer. Resuming an already active consumer succeeds.
    pub async fn resume(
        &self,
        room: &mut Room,
        connection_id: &str,
        consumer_id: &str,
    ) -> SignalResult<()> {
        room.ensure_member(connection_id)?;

        let entry = room
            .consumers
            .get(consumer_id)
            .filter(|entry| entry.owner == connection_id)
            .ok_or_else(|| SignalError::not_found(ResourceKind::Consumer, consumer_id))?;
        entry.handle.resume().await?;

        debug!("Resumed consumer {} for {}", consumer_id, connection_id);
        Ok(())
    }

    /// Closes everything `connection_id` owns in the room: its consumers, its
    /// producers along with every other member's consumers of them, then its
    /// transports. A connection that owns nothing is a no-op.
    pub fn release_all_for(&self, room: &mut Room, connection_id: &str) -> ReleaseSummary {
        let mut summary = ReleaseSummary::default();

        let own_producers: Vec<String> = room
            .producers
            .iter()
            .filter(|(_, p)| p.owner == connection_id)
            .map(|(id, _)| id.clone())
            .collect();

        let doomed_consumers: Vec<String> = room
            .consumers
            .iter()
            .filter(|(_, c)| c.owner == connection_id || own_producers.contains(&c.producer_id))
            .map(|(id, _)| id.clone())
            .collect();

        for id in doomed_consumers {
            if let Some(entry) = room.consumers.remove(&id) {
                if entry.owner != connection_id {
                    debug!(
                        "Closing consumer {} of {} (producer {} left with {})",
                        id, entry.owner, entry.producer_id, connection_id
                    );
                }
                entry.handle.close();
                summary.consumers += 1;
            }
        }

        for id in own_producers {
            if let Some(entry) = room.producers.remove(&id) {
                entry.handle.close();
                summary.producers += 1;
            }
        }

        let own_transports: Vec<String> = room
            .transports
            .iter()
            .filter(|(_, t)| t.owner == connection_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in own_transports {
            if let Some(entry) = room.transports.remove(&id) {
                entry.handle.close();
                summary.transports += 1;
            }
        }

        self.metrics
            .resource_closed(ResourceKind::Consumer, summary.consumers);
        self.metrics
            .resource_closed(ResourceKind::Producer, summary.producers);
        self.metrics
            .resource_closed(ResourceKind::Transport, summary.transports);

        if !summary.is_empty() {
            debug!(
                "Released {} transports, {} producers, {} consumers for {} in room {}",
                summary.transports, summary.producers, summary.consumers, connection_id, room.id
            );
        }
        summary
    }
}
