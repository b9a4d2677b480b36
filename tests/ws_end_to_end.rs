//! End-to-end signaling over a real WebSocket

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use rtc_signal::engine::InMemoryEngine;
use rtc_signal::{ServerConfig, SignalingServer};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(engine: InMemoryEngine) -> (SocketAddr, Arc<SignalingServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(SignalingServer::new(ServerConfig::default(), Arc::new(engine)).unwrap());

    let running = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = running.serve(listener, std::future::pending()).await;
    });

    (addr, server)
}

struct Client {
    socket: Socket,
    next_id: u64,
    events: Vec<Value>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/server", addr))
            .await
            .unwrap();
        Self {
            socket,
            next_id: 1,
            events: Vec::new(),
        }
    }

    async fn recv(&mut self) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), self.socket.next())
                .await
                .expect("no frame within 2s")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    /// Send a request and wait for its response, stashing events seen meanwhile
    async fn call(&mut self, method: &str, data: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        let frame = json!({"id": id, "method": method, "data": data});
        self.socket
            .send(Message::Text(frame.to_string()))
            .await
            .unwrap();

        loop {
            let message = self.recv().await;
            if message["type"] == "response" && message["id"] == id {
                return message;
            }
            self.events.push(message);
        }
    }

    async fn next_event(&mut self) -> Value {
        if !self.events.is_empty() {
            return self.events.remove(0);
        }
        loop {
            let message = self.recv().await;
            if message["type"] == "event" {
                return message;
            }
        }
    }
}

#[tokio::test]
async fn test_publish_and_subscribe_over_websocket() {
    let engine = InMemoryEngine::new();
    let (addr, server) = start_server(engine.clone()).await;

    let mut publisher = Client::connect(addr).await;
    let mut subscriber = Client::connect(addr).await;

    let caps = publisher.call("getRouterRtpCapabilities", Value::Null).await;
    let caps = caps["data"].clone();
    assert!(caps["codecs"].is_array());

    let transport = publisher
        .call(
            "createProducerTransport",
            json!({"forceTcp": false, "rtpCapabilities": caps}),
        )
        .await;
    let transport_id = transport["data"]["id"].clone();
    assert!(transport["data"]["iceCandidates"].is_array());

    let connected = publisher
        .call(
            "connectProducerTransport",
            json!({"transportId": transport_id, "dtlsParameters": {"role": "client"}}),
        )
        .await;
    assert_eq!(connected["data"], Value::Null);

    let produced = publisher
        .call(
            "produce",
            json!({"transportId": transport_id, "kind": "video", "rtpParameters": {}}),
        )
        .await;
    let producer_id = produced["data"]["id"].clone();
    assert!(producer_id.is_string());

    let event = subscriber.next_event().await;
    assert_eq!(event["event"], "newProducer");
    assert_eq!(event["data"]["producerId"], producer_id);
    assert_eq!(event["data"]["kind"], "video");

    let recv_transport = subscriber
        .call("createConsumerTransport", json!({"forceTcp": true}))
        .await;
    let candidates = recv_transport["data"]["iceCandidates"].as_array().unwrap();
    assert!(candidates.iter().all(|c| c["protocol"] == "tcp"));

    let consumer = subscriber
        .call("consume", json!({"rtpCapabilities": caps}))
        .await;
    assert_eq!(consumer["data"]["producerId"], producer_id);
    assert_eq!(consumer["data"]["type"], "simple");
    assert_eq!(consumer["data"]["producerPaused"], false);

    subscriber
        .call(
            "connectConsumerTransport",
            json!({"transportId": recv_transport["data"]["id"], "dtlsParameters": {"role": "client"}}),
        )
        .await;
    let resumed = subscriber.call("resume", Value::Null).await;
    assert!(resumed.get("error").is_none());

    // The publisher never hears about its own producer
    assert!(publisher.events.is_empty());

    publisher.socket.close(None).await.unwrap();
    let event = subscriber.next_event().await;
    assert_eq!(event["event"], "producerClosed");
    assert_eq!(event["data"]["producerId"], producer_id);

    subscriber.socket.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(engine.ledger().is_balanced());
    assert_eq!(server.room().stats().snapshot().active_sessions(), 0);
}

#[tokio::test]
async fn test_errors_are_structured() {
    let (addr, _server) = start_server(InMemoryEngine::new()).await;
    let mut client = Client::connect(addr).await;

    let response = client
        .call("produce", json!({"kind": "audio", "rtpParameters": {}}))
        .await;
    assert_eq!(response["error"]["kind"], "invalidState");
    assert!(response["error"]["message"].is_string());

    let response = client.call("teleport", json!({})).await;
    assert_eq!(response["error"]["kind"], "badRequest");

    // Still serving after both errors
    let response = client.call("getRouterRtpCapabilities", Value::Null).await;
    assert!(response["data"]["codecs"].is_array());
}

#[tokio::test]
async fn test_unknown_path_is_refused() {
    let (addr, _server) = start_server(InMemoryEngine::new()).await;

    let result = tokio_tungstenite::connect_async(format!("ws://{}/elsewhere", addr)).await;
    assert!(result.is_err());
}
