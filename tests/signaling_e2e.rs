// End-to-end signaling over a real WebSocket, backed by the in-memory engine

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sfu_signaling::config::ServerConfig;
use sfu_signaling::media::InMemoryEngine;
use sfu_signaling::metrics::ServerMetrics;
use sfu_signaling::room::RoomManager;
use sfu_signaling::signaling::SignalingServer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> SocketAddr {
    start_server_with(ServerConfig::default()).await
}

async fn start_server_with(config: ServerConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let metrics = ServerMetrics::new();
    let rooms = Arc::new(RoomManager::new(Arc::new(InMemoryEngine::new()), metrics.clone()));
    let server = SignalingServer::new(rooms, metrics, &config);
    tokio::spawn(server.serve_on(listener));
    addr
}

/// Raw HTTP GET, returning the status line and the body
async fn get(addr: SocketAddr, path: &str) -> (String, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    let (head, body) = response.split_once("\r\n\r\n").unwrap();
    let status = head.lines().next().unwrap().to_string();
    (status, body.to_string())
}

async fn get_json(addr: SocketAddr, path: &str) -> (String, Value) {
    let (status, body) = get(addr, path).await;
    (status, serde_json::from_str(&body).unwrap())
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn send(ws: &mut Client, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

async fn recv(ws: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn request(ws: &mut Client, value: Value) -> Value {
    send(ws, value).await;
    recv(ws).await
}

fn dtls() -> Value {
    json!({ "role": "client", "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD" }] })
}

#[tokio::test]
async fn test_broadcast_and_view_over_websocket() {
    let addr = start_server().await;
    let mut broadcaster = connect(addr).await;
    let mut viewer = connect(addr).await;

    let joined = request(&mut broadcaster, json!({ "type": "join-room", "roomId": "live", "isViewer": false })).await;
    assert_eq!(joined["type"], "room-joined");
    let broadcaster_id = joined["userId"].as_str().unwrap().to_string();

    let caps = request(&mut broadcaster, json!({ "type": "get-rtp-capabilities", "roomId": "live" })).await;
    let send_transport = request(&mut broadcaster, json!({ "type": "create-send-transport", "roomId": "live" })).await;
    assert_eq!(send_transport["direction"], "send");
    let send_id = send_transport["transportId"].clone();

    let connected = request(
        &mut broadcaster,
        json!({ "type": "connect-transport", "transportId": send_id, "dtlsParameters": dtls() }),
    )
    .await;
    assert_eq!(connected["type"], "transport-connected");

    let produced = request(
        &mut broadcaster,
        json!({
            "type": "produce",
            "transportId": send_id,
            "kind": "audio",
            "rtpParameters": { "codecs": [{ "mimeType": "audio/opus", "clockRate": 48000 }] }
        }),
    )
    .await;
    assert_eq!(produced["type"], "produced");
    let producer_id = produced["producerId"].as_str().unwrap().to_string();

    let viewer_joined = request(
        &mut viewer,
        json!({ "type": "join-room", "roomId": "live", "isViewer": true }),
    )
    .await;
    assert_eq!(viewer_joined["producers"][0]["producerId"], producer_id.as_str());
    assert_eq!(viewer_joined["producers"][0]["userId"], broadcaster_id.as_str());
    let viewer_id = viewer_joined["userId"].as_str().unwrap().to_string();

    let user_joined = recv(&mut broadcaster).await;
    assert_eq!(user_joined["type"], "user-joined");
    assert_eq!(user_joined["userId"], viewer_id.as_str());
    assert_eq!(user_joined["isViewer"], true);

    let recv_transport = request(&mut viewer, json!({ "type": "create-recv-transport", "roomId": "live" })).await;
    let consumed = request(
        &mut viewer,
        json!({
            "type": "consume",
            "transportId": recv_transport["transportId"],
            "producerId": producer_id,
            "rtpCapabilities": caps["rtpCapabilities"]
        }),
    )
    .await;
    assert_eq!(consumed["type"], "consumed");
    assert_eq!(consumed["kind"], "audio");

    for _ in 0..2 {
        let resumed = request(
            &mut viewer,
            json!({ "type": "resume-consumer", "consumerId": consumed["consumerId"] }),
        )
        .await;
        assert_eq!(resumed["type"], "consumer-resumed");
    }

    viewer.close(None).await.unwrap();
    let left = recv(&mut broadcaster).await;
    assert_eq!(left["type"], "user-left");
    assert_eq!(left["userId"], viewer_id.as_str());
}

#[tokio::test]
async fn test_protocol_errors_keep_the_connection_open() {
    let addr = start_server().await;
    let mut ws = connect(addr).await;

    let reply = request(&mut ws, json!({ "type": "create-send-transport", "roomId": "r" })).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "protocol");

    ws.send(Message::text("{broken")).await.unwrap();
    let reply = recv(&mut ws).await;
    assert_eq!(reply["code"], "protocol");

    let joined = request(&mut ws, json!({ "type": "join-room", "roomId": "r", "isViewer": false })).await;
    assert_eq!(joined["type"], "room-joined");
}

#[tokio::test]
async fn test_health_endpoint_reports_rooms() {
    let addr = start_server().await;
    let mut ws = connect(addr).await;
    request(&mut ws, json!({ "type": "join-room", "roomId": "h", "isViewer": false })).await;

    let (status, health) = get_json(addr, "/health").await;
    assert!(status.starts_with("HTTP/1.1 200"));
    assert_eq!(health["status"], "ok");
    assert_eq!(health["rooms"], 1);
    assert_eq!(health["participants"], 1);
}

#[tokio::test]
async fn test_heartbeat_terminates_silent_client() {
    let addr = start_server_with(ServerConfig {
        heartbeat_interval: Duration::from_millis(200),
        ..ServerConfig::default()
    })
    .await;
    let mut peer = connect(addr).await;
    let mut silent = connect(addr).await;

    request(&mut peer, json!({ "type": "join-room", "roomId": "hb", "isViewer": false })).await;
    let joined = request(&mut silent, json!({ "type": "join-room", "roomId": "hb", "isViewer": true })).await;
    let silent_id = joined["userId"].as_str().unwrap().to_string();

    // the silent client is never polled again, so its pings go unanswered
    let user_joined = recv(&mut peer).await;
    assert_eq!(user_joined["type"], "user-joined");
    let left = recv(&mut peer).await;
    assert_eq!(left["type"], "user-left");
    assert_eq!(left["userId"], silent_id.as_str());

    let (_, health) = get_json(addr, "/health").await;
    assert_eq!(health["rooms"], 1);
    assert_eq!(health["participants"], 1);

    // the peer keeps answering pings while polled and sees no second user-left
    let extra = tokio::time::timeout(Duration::from_millis(600), recv(&mut peer)).await;
    assert!(extra.is_err(), "unexpected message {extra:?}");
    drop(silent);
}

#[tokio::test]
async fn test_metrics_endpoint_counts_errors_by_code() {
    let addr = start_server().await;
    let mut ws = connect(addr).await;
    request(&mut ws, json!({ "type": "join-room", "roomId": "m", "isViewer": false })).await;
    let reply = request(&mut ws, json!({ "type": "resume-consumer", "consumerId": "nope" })).await;
    assert_eq!(reply["code"], "not-found");

    let (status, text) = get(addr, "/metrics").await;
    assert!(status.starts_with("HTTP/1.1 200"));
    assert!(text.contains("sfu_signaling_errors_total{code=\"not-found\"} 1"));
    assert!(text.contains("sfu_signaling_errors_total{code=\"protocol\"} 0"));
    assert!(text.contains("sfu_signaling_resources_live{kind=\"room\"} 1"));
    assert!(text.contains("sfu_signaling_members 1"));
}
