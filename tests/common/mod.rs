//! Shared utilities for relay integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use relay_server::protocol::{
    decode, decode_payload, encode, encode_payload, ErrorBody, ErrorCode, Message, MessageType,
    ServiceRequest, RELAY_ID,
};
use relay_server::{RelayConfig, RelayServer};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A running relay on an ephemeral port.
pub struct Relay {
    pub addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
}

impl Relay {
    pub async fn start(mut config: RelayConfig) -> Self {
        config.health_check.enabled = false;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = RelayServer::new(config).unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let signal = async move {
                let _ = stopped.await;
            };
            let _ = server.run(listener, None, signal).await;
        });
        Self {
            addr,
            stop: Some(stop),
        }
    }

    pub fn ws_url(&self, client_id: &str) -> String {
        format!("ws://{}/ws?client_id={}", self.addr, client_id)
    }

    pub async fn connect(&self, client_id: &str) -> Peer {
        let (ws, _) = connect_async(self.ws_url(client_id)).await.unwrap();
        Peer {
            client_id: client_id.to_string(),
            ws,
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Minimal peer speaking the relay protocol.
pub struct Peer {
    pub client_id: String,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Peer {
    pub fn next_id(&self) -> String {
        format!("{}-{}", self.client_id, NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn send(&mut self, message: &Message) {
        let frame = encode(message).unwrap();
        self.ws.send(WsMessage::Binary(frame.into())).await.unwrap();
    }

    pub async fn recv(&mut self) -> Message {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .unwrap();
            match frame {
                WsMessage::Binary(bytes) => return decode(&bytes).unwrap(),
                WsMessage::Text(text) => return decode(text.as_str().as_bytes()).unwrap(),
                _ => continue,
            }
        }
    }

    /// Send a request for `uri` without waiting. Returns its id.
    pub async fn send_request(&mut self, uri: &str, body: &[u8]) -> String {
        let id = self.next_id();
        let payload = encode_payload(&ServiceRequest::new(uri, body.to_vec())).unwrap();
        let message = Message::new(id.clone(), self.client_id.clone(), RELAY_ID, MessageType::Request, payload);
        self.send(&message).await;
        id
    }

    /// Request `uri` and wait for the reply.
    pub async fn call(&mut self, uri: &str, body: &[u8]) -> Message {
        let id = self.send_request(uri, body).await;
        let reply = self.recv().await;
        assert_eq!(reply.id(), id);
        reply
    }

    /// Call the system service with a JSON body.
    pub async fn system<T: Serialize>(&mut self, operation: &str, body: &T) -> Message {
        let body = serde_json::to_vec(body).unwrap();
        self.call(&format!("/relay/services/{operation}"), &body).await
    }

    /// Wait for the relay to forward a request, answer it with `handler`.
    pub async fn serve_one<F>(&mut self, handler: F) -> ServiceRequest
    where
        F: FnOnce(&ServiceRequest) -> Vec<u8>,
    {
        let forwarded = self.recv().await;
        assert_eq!(forwarded.kind(), MessageType::Request);
        assert_eq!(forwarded.from(), RELAY_ID);
        let request: ServiceRequest = decode_payload(forwarded.payload()).unwrap();
        let reply = Message::response_to(&forwarded, self.client_id.clone(), handler(&request));
        self.send(&reply).await;
        request
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Error code of an error reply.
pub fn error_code(reply: &Message) -> ErrorCode {
    assert_eq!(reply.kind(), MessageType::Error, "expected an error reply");
    decode_payload::<ErrorBody>(reply.payload()).unwrap().code
}
