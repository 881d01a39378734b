#![forbid(unsafe_code)]

// Signaling router - decodes client messages, enforces the per-connection
// state machine and delegates to the room manager.

use super::protocol::{ClientMessage, Outbound, ServerMessage};
use super::registry::{Connection, ConnectionRegistry};
use crate::error::{ProtocolError, SignalError, SignalResult};
use crate::media::TransportDirection;
use crate::metrics::ServerMetrics;
use crate::room::{Role, RoomManager};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Maximum room id length accepted on join
const MAX_ROOM_ID_LEN: usize = 128;

#[derive(Clone)]
pub struct SignalingRouter {
    rooms: Arc<RoomManager>,
    registry: ConnectionRegistry,
    metrics: ServerMetrics,
}

impl SignalingRouter {
    pub fn new(rooms: Arc<RoomManager>, registry: ConnectionRegistry, metrics: ServerMetrics) -> Self {
        Self {
            rooms,
            registry,
            metrics,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Handles one inbound text frame.
    ///
    /// Unknown message types are logged and ignored; every other failure is
    /// reported to this connection only, which stays open.
    pub async fn handle_text(&self, connection_id: &str, text: &str) {
        self.metrics.message_received();
        self.registry.mark_alive(connection_id);

        let Some(conn) = self.registry.lookup(connection_id) else {
            debug!("Dropping message for unregistered connection {}", connection_id);
            return;
        };

        let message = match ClientMessage::decode(text) {
            Ok(message) => message,
            Err(ProtocolError::UnknownType(msg_type)) => {
                warn!("Ignoring unknown message type {:?} from {}", msg_type, connection_id);
                return;
            }
            Err(e) => {
                warn!("Invalid message from {}: {}", connection_id, e);
                self.report(&conn, &e.into());
                return;
            }
        };

        let start = Instant::now();
        let result = self.dispatch(&conn, message).await;
        self.metrics.observe_dispatch(start.elapsed());

        if let Err(e) = result {
            match &e {
                SignalError::EngineFailure(_) => error!("Error handling message from {}: {}", connection_id, e),
                _ => debug!("Rejected message from {}: {}", connection_id, e),
            }
            self.report(&conn, &e);
        }
    }

    /// Binary frames are not part of the protocol
    pub fn handle_binary(&self, connection_id: &str) {
        self.metrics.message_received();
        self.registry.mark_alive(connection_id);
        if let Some(conn) = self.registry.lookup(connection_id) {
            warn!("Binary frame from {}", connection_id);
            self.report(&conn, &ProtocolError::BinaryFrame.into());
        }
    }

    /// Applies one decoded message for `conn`
    pub async fn dispatch(&self, conn: &Connection, message: ClientMessage) -> SignalResult<()> {
        let connection_id = conn.id.as_str();

        match &message {
            ClientMessage::JoinRoom { room_id, is_viewer } => {
                if let Some(joined) = &conn.room {
                    return Err(ProtocolError::AlreadyJoined(joined.clone()).into());
                }
                let len = room_id.chars().count();
                if len == 0 || len > MAX_ROOM_ID_LEN {
                    return Err(ProtocolError::Malformed(format!(
                        "roomId must be 1-{MAX_ROOM_ID_LEN} characters"
                    ))
                    .into());
                }

                let role = Role::from_is_viewer(*is_viewer);
                // room-joined is sent by the room itself, ahead of any later notification
                self.rooms
                    .join(room_id, connection_id, conn.member(role))
                    .await?;
                self.registry
                    .set_room(connection_id, Some((room_id.clone(), role)));
            }

            ClientMessage::LeaveRoom { .. } => {
                if let Some(room_id) = &conn.room {
                    self.rooms.leave(room_id, connection_id).await;
                    self.registry.set_room(connection_id, None);
                }
            }

            ClientMessage::GetRtpCapabilities { .. } => {
                let room_id = joined_room(conn, &message)?;
                let rtp_capabilities = self.rooms.rtp_capabilities(room_id).await?;
                self.reply(conn, &ServerMessage::RtpCapabilities { rtp_capabilities });
            }

            ClientMessage::CreateSendTransport { .. } => {
                let room_id = joined_room(conn, &message)?;
                self.create_transport(conn, room_id, TransportDirection::Send).await?;
            }

            ClientMessage::CreateRecvTransport { .. } => {
                let room_id = joined_room(conn, &message)?;
                self.create_transport(conn, room_id, TransportDirection::Recv).await?;
            }

            ClientMessage::ConnectTransport { transport_id, dtls_parameters } => {
                let room_id = joined_room(conn, &message)?;
                self.rooms
                    .connect_transport(room_id, connection_id, transport_id, dtls_parameters.clone())
                    .await?;
                self.reply(
                    conn,
                    &ServerMessage::TransportConnected { transport_id: transport_id.clone() },
                );
            }

            ClientMessage::Produce { transport_id, kind, rtp_parameters } => {
                let room_id = joined_room(conn, &message)?;
                let producer_id = self
                    .rooms
                    .produce(room_id, connection_id, transport_id, *kind, rtp_parameters.clone())
                    .await?;
                self.reply(conn, &ServerMessage::Produced { producer_id });
            }

            ClientMessage::GetProducers { .. } => {
                let room_id = joined_room(conn, &message)?;
                let producers = self.rooms.list_producers(room_id).await?;
                self.reply(conn, &ServerMessage::Producers { producers });
            }

            ClientMessage::Consume { transport_id, producer_id, rtp_capabilities } => {
                let room_id = joined_room(conn, &message)?;
                let consumer = self
                    .rooms
                    .consume(room_id, connection_id, transport_id, producer_id, rtp_capabilities.clone())
                    .await?;
                self.reply(
                    conn,
                    &ServerMessage::Consumed {
                        consumer_id: consumer.id,
                        producer_id: consumer.producer_id,
                        kind: consumer.kind,
                        rtp_parameters: consumer.rtp_parameters,
                    },
                );
            }

            ClientMessage::ResumeConsumer { consumer_id } => {
                let room_id = joined_room(conn, &message)?;
                self.rooms
                    .resume_consumer(room_id, connection_id, consumer_id)
                    .await?;
                self.reply(
                    conn,
                    &ServerMessage::ConsumerResumed { consumer_id: consumer_id.clone() },
                );
            }
        }
        Ok(())
    }

    async fn create_transport(
        &self,
        conn: &Connection,
        room_id: &str,
        direction: TransportDirection,
    ) -> SignalResult<()> {
        let info = self
            .rooms
            .create_transport(room_id, &conn.id, direction)
            .await?;
        self.reply(
            conn,
            &ServerMessage::TransportCreated {
                transport_id: info.id,
                direction,
                ice_parameters: info.ice_parameters,
                ice_candidates: info.ice_candidates,
                dtls_parameters: info.dtls_parameters,
            },
        );
        Ok(())
    }

    /// Serializes a reply and queues it on the connection's channel. A reply
    /// that cannot be queued terminates the connection so the client resyncs.
    fn reply(&self, conn: &Connection, msg: &ServerMessage) {
        let Some(outbound) = Outbound::encode(msg) else {
            return;
        };
        match conn.sender.try_send(outbound) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Channel full for {}, terminating connection", conn.id);
                conn.terminate.notify_one();
                self.metrics.delivery_overflow();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Reply to {} dropped, connection closing", conn.id);
            }
        }
    }

    /// Runs the disconnect cascade for a closed socket
    pub async fn disconnect(&self, connection_id: &str) {
        self.registry.unregister(connection_id, &self.rooms).await;
    }

    fn report(&self, conn: &Connection, err: &SignalError) {
        self.metrics.signal_error(err.code());
        self.reply(
            conn,
            &ServerMessage::Error {
                error: err.to_string(),
                code: err.code().to_string(),
            },
        );
    }
}

/// The connection's room, checked against any `roomId` the message names
fn joined_room<'a>(conn: &'a Connection, message: &ClientMessage) -> SignalResult<&'a str> {
    let room_id = conn.room.as_deref().ok_or(ProtocolError::NotJoined)?;
    match message.room_id() {
        Some(requested) if requested != room_id => Err(ProtocolError::RoomMismatch {
            requested: requested.to_string(),
            joined: room_id.to_string(),
        }
        .into()),
        _ => Ok(room_id),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::InMemoryEngine;
    use crate::room::tests::drain;
    use serde_json::{json, Value};

    struct Harness {
        router: SignalingRouter,
        engine: InMemoryEngine,
    }

    impl Harness {
        fn new() -> Self {
            let engine = InMemoryEngine::new();
            let metrics = ServerMetrics::new();
            let rooms = Arc::new(RoomManager::new(Arc::new(engine.clone()), metrics.clone()));
            Self {
                router: SignalingRouter::new(rooms, ConnectionRegistry::new(), metrics),
                engine,
            }
        }

        fn connect(&self) -> (String, mpsc::Receiver<Outbound>) {
            let (tx, rx) = mpsc::channel(64);
            (self.router.registry().register(tx), rx)
        }

        async fn send(&self, id: &str, message: Value) {
            self.router.handle_text(id, &message.to_string()).await;
        }

        /// Sends `message` and returns the single reply
        async fn request(&self, id: &str, rx: &mut mpsc::Receiver<Outbound>, message: Value) -> Value {
            self.send(id, message).await;
            let mut replies = drain(rx);
            assert_eq!(replies.len(), 1, "expected one reply, got {replies:?}");
            replies.remove(0)
        }
    }

    fn vp8() -> Value {
        json!({ "codecs": [{ "mimeType": "video/VP8", "clockRate": 90000 }], "encodings": [{ "ssrc": 1 }] })
    }

    fn dtls() -> Value {
        json!({ "role": "client", "fingerprints": [{ "algorithm": "sha-256", "value": "00:11" }] })
    }

    #[tokio::test]
    async fn test_messages_before_join_are_rejected() {
        let h = Harness::new();
        let (id, mut rx) = h.connect();

        let reply = h
            .request(&id, &mut rx, json!({ "type": "get-rtp-capabilities", "roomId": "r1" }))
            .await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["code"], "protocol");
        assert!(!h.router.registry().lookup(&id).unwrap().is_joined());

        // leave-room is accepted while unjoined and produces no reply
        h.send(&id, json!({ "type": "leave-room" })).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type_is_ignored_and_malformed_is_reported() {
        let h = Harness::new();
        let (id, mut rx) = h.connect();

        h.send(&id, json!({ "type": "chat-message", "text": "hi" })).await;
        assert!(drain(&mut rx).is_empty());
        // peer-to-peer negotiation is not relayed
        h.send(&id, json!({ "type": "offer", "targetUserId": "x", "sdp": "v=0" })).await;
        assert!(drain(&mut rx).is_empty());

        h.router.handle_text(&id, "{not json").await;
        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["code"], "protocol");

        let reply = h.request(&id, &mut rx, json!({ "type": "join-room" })).await;
        assert_eq!(reply["code"], "protocol");
        assert!(h.router.registry().lookup(&id).unwrap().room.is_none());
    }

    #[tokio::test]
    async fn test_missing_required_fields_do_not_mutate_state() {
        let h = Harness::new();
        let (id, mut rx) = h.connect();

        let reply = h.request(&id, &mut rx, json!({ "type": "join-room", "roomId": "r1" })).await;
        assert_eq!(reply["code"], "protocol");
        assert_eq!(h.engine.routers_created(), 0);
        assert!(!h.router.registry().lookup(&id).unwrap().is_joined());

        h.request(&id, &mut rx, json!({ "type": "join-room", "roomId": "r1", "isViewer": false })).await;
        for message in [
            json!({ "type": "create-send-transport" }),
            json!({ "type": "create-recv-transport" }),
            json!({ "type": "get-rtp-capabilities" }),
            json!({ "type": "get-producers" }),
        ] {
            let reply = h.request(&id, &mut rx, message).await;
            assert_eq!(reply["type"], "error");
            assert_eq!(reply["code"], "protocol");
        }
        assert_eq!(h.engine.transports_open(), 0);
    }

    #[tokio::test]
    async fn test_unqueueable_reply_terminates_connection() {
        let h = Harness::new();
        let (tx, mut rx) = mpsc::channel(1);
        let id = h.router.registry().register(tx.clone());
        tx.try_send(Outbound::Ping).unwrap();
        let terminate = h.router.registry().lookup(&id).unwrap().terminate;

        h.send(&id, json!({ "type": "get-producers", "roomId": "r1" })).await;

        tokio::time::timeout(std::time::Duration::from_secs(1), terminate.notified())
            .await
            .expect("connection with a full channel was not terminated");
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_join_twice_is_rejected() {
        let h = Harness::new();
        let (id, mut rx) = h.connect();

        let joined = h
            .request(&id, &mut rx, json!({ "type": "join-room", "roomId": "r1", "isViewer": false }))
            .await;
        assert_eq!(joined["type"], "room-joined");
        assert_eq!(joined["userId"], id.as_str());
        assert_eq!(joined["isViewer"], false);

        let again = h
            .request(&id, &mut rx, json!({ "type": "join-room", "roomId": "r2", "isViewer": false }))
            .await;
        assert_eq!(again["code"], "protocol");
        assert_eq!(h.router.rooms().room_count(), 1);
    }

    #[tokio::test]
    async fn test_room_id_must_match_joined_room() {
        let h = Harness::new();
        let (id, mut rx) = h.connect();
        h.request(&id, &mut rx, json!({ "type": "join-room", "roomId": "r1", "isViewer": false })).await;

        let reply = h
            .request(&id, &mut rx, json!({ "type": "create-send-transport", "roomId": "other" }))
            .await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["code"], "protocol");
        assert_eq!(h.engine.transports_open(), 0);
    }

    #[tokio::test]
    async fn test_room_id_length_is_validated() {
        let h = Harness::new();
        let (id, mut rx) = h.connect();
        let long = "x".repeat(MAX_ROOM_ID_LEN + 1);

        let reply = h.request(&id, &mut rx, json!({ "type": "join-room", "roomId": long, "isViewer": false })).await;
        assert_eq!(reply["code"], "protocol");
        let reply = h.request(&id, &mut rx, json!({ "type": "join-room", "roomId": "", "isViewer": false })).await;
        assert_eq!(reply["code"], "protocol");
        assert_eq!(h.engine.routers_created(), 0);
    }

    #[tokio::test]
    async fn test_full_broadcast_and_view_flow() {
        let h = Harness::new();
        let (b, mut rx_b) = h.connect();
        let (v, mut rx_v) = h.connect();

        h.request(&b, &mut rx_b, json!({ "type": "join-room", "roomId": "r1", "isViewer": false })).await;
        let caps = h
            .request(&b, &mut rx_b, json!({ "type": "get-capabilities", "roomId": "r1" }))
            .await;
        assert_eq!(caps["type"], "rtp-capabilities");

        let send = h
            .request(&b, &mut rx_b, json!({ "type": "create-send-transport", "roomId": "r1" }))
            .await;
        assert_eq!(send["type"], "transport-created");
        assert_eq!(send["direction"], "send");
        let send_id = send["transportId"].as_str().unwrap().to_string();

        let connected = h
            .request(&b, &mut rx_b, json!({ "type": "connect-transport", "transportId": send_id, "dtlsParameters": dtls() }))
            .await;
        assert_eq!(connected["type"], "transport-connected");

        let produced = h
            .request(&b, &mut rx_b, json!({ "type": "produce", "transportId": send_id, "kind": "video", "rtpParameters": vp8() }))
            .await;
        assert_eq!(produced["type"], "produced");
        let producer_id = produced["producerId"].as_str().unwrap().to_string();

        // viewer joins after the producer exists
        let joined = h
            .request(&v, &mut rx_v, json!({ "type": "join-room", "roomId": "r1", "isViewer": true }))
            .await;
        assert_eq!(joined["producers"][0]["producerId"], producer_id.as_str());
        assert_eq!(joined["users"][0]["userId"], b.as_str());
        let user_joined = drain(&mut rx_b);
        assert_eq!(user_joined.len(), 1);
        assert_eq!(user_joined[0]["type"], "user-joined");

        let listed = h
            .request(&v, &mut rx_v, json!({ "type": "get-producers", "roomId": "r1" }))
            .await;
        assert_eq!(listed["producers"].as_array().unwrap().len(), 1);

        let recv = h
            .request(&v, &mut rx_v, json!({ "type": "create-recv-transport", "roomId": "r1" }))
            .await;
        let recv_id = recv["transportId"].as_str().unwrap().to_string();

        let viewer_caps = caps["rtpCapabilities"].clone();
        let consumed = h
            .request(&v, &mut rx_v, json!({
                "type": "consume",
                "transportId": recv_id,
                "producerId": producer_id,
                "rtpCapabilities": viewer_caps
            }))
            .await;
        assert_eq!(consumed["type"], "consumed");
        assert_eq!(consumed["kind"], "video");
        let consumer_id = consumed["consumerId"].as_str().unwrap().to_string();

        for _ in 0..2 {
            let resumed = h
                .request(&v, &mut rx_v, json!({ "type": "resume-consumer", "consumerId": consumer_id }))
                .await;
            assert_eq!(resumed["type"], "consumer-resumed");
            assert_eq!(resumed["consumerId"], consumer_id.as_str());
        }
    }

    #[tokio::test]
    async fn test_incompatible_consume_reports_error() {
        let h = Harness::new();
        let (b, mut rx_b) = h.connect();
        let (v, mut rx_v) = h.connect();
        h.request(&b, &mut rx_b, json!({ "type": "join-room", "roomId": "r1", "isViewer": false })).await;
        let send = h
            .request(&b, &mut rx_b, json!({ "type": "create-send-transport", "roomId": "r1" }))
            .await;
        let produced = h
            .request(&b, &mut rx_b, json!({ "type": "produce", "transportId": send["transportId"], "kind": "video", "rtpParameters": vp8() }))
            .await;

        h.request(&v, &mut rx_v, json!({ "type": "join-room", "roomId": "r1", "isViewer": true })).await;
        drain(&mut rx_b);
        let recv = h
            .request(&v, &mut rx_v, json!({ "type": "create-recv-transport", "roomId": "r1" }))
            .await;

        let reply = h
            .request(&v, &mut rx_v, json!({
                "type": "consume",
                "transportId": recv["transportId"],
                "producerId": produced["producerId"],
                "rtpCapabilities": { "codecs": [{ "kind": "audio", "mimeType": "audio/opus" }] }
            }))
            .await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["code"], "incompatible");
        assert_eq!(h.engine.consumers_open(), 0);
    }

    #[tokio::test]
    async fn test_resume_unknown_consumer_is_not_found() {
        let h = Harness::new();
        let (id, mut rx) = h.connect();
        h.request(&id, &mut rx, json!({ "type": "join-room", "roomId": "r1", "isViewer": true })).await;

        let reply = h
            .request(&id, &mut rx, json!({ "type": "resume-consumer", "consumerId": "nope" }))
            .await;
        assert_eq!(reply["code"], "not-found");
    }

    #[tokio::test]
    async fn test_leave_room_returns_to_unjoined() {
        let h = Harness::new();
        let (a, mut rx_a) = h.connect();
        let (b, mut rx_b) = h.connect();
        h.request(&a, &mut rx_a, json!({ "type": "join-room", "roomId": "r1", "isViewer": false })).await;
        h.request(&b, &mut rx_b, json!({ "type": "join-room", "roomId": "r1", "isViewer": false })).await;
        drain(&mut rx_a);

        h.send(&b, json!({ "type": "leave-room" })).await;
        assert!(drain(&mut rx_b).is_empty());
        assert!(!h.router.registry().lookup(&b).unwrap().is_joined());
        let left = drain(&mut rx_a);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0]["type"], "user-left");

        // can join again after leaving
        let joined = h
            .request(&b, &mut rx_b, json!({ "type": "join-room", "roomId": "r1", "isViewer": false }))
            .await;
        assert_eq!(joined["type"], "room-joined");
    }

    #[tokio::test]
    async fn test_disconnect_notifies_once_and_tears_down() {
        let h = Harness::new();
        let (a, mut rx_a) = h.connect();
        let (b, mut rx_b) = h.connect();
        h.request(&a, &mut rx_a, json!({ "type": "join-room", "roomId": "r1", "isViewer": false })).await;
        h.request(&b, &mut rx_b, json!({ "type": "join-room", "roomId": "r1", "isViewer": true })).await;
        drain(&mut rx_a);

        h.router.disconnect(&a).await;
        h.router.disconnect(&a).await;
        let left: Vec<Value> = drain(&mut rx_b)
            .into_iter()
            .filter(|m| m["type"] == "user-left")
            .collect();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0]["userId"], a.as_str());

        h.router.disconnect(&b).await;
        assert_eq!(h.router.rooms().room_count(), 0);
        assert_eq!(h.engine.routers_closed(), 1);
        assert!(h.router.registry().is_empty());
    }

    #[tokio::test]
    async fn test_binary_frame_is_protocol_error() {
        let h = Harness::new();
        let (id, mut rx) = h.connect();
        h.router.handle_binary(&id);
        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["code"], "protocol");
    }
}
