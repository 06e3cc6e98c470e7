//! In-process stand-in for the Home Assistant WebSocket API.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};

use hass_command_mcp::HomeAssistantConfig;

pub const TOKEN: &str = "test-token";

/// How the mock answers one command frame.
#[derive(Debug, Clone)]
pub enum Reply {
    Success(Value),
    Failure(&'static str, &'static str),
    /// Answer only after the next frame has been answered.
    Later(Value),
    Ignore,
    Close,
    /// Send this frame verbatim with the request's id filled in.
    Raw(Value),
}

pub type Responder = Arc<dyn Fn(&Value) -> Reply + Send + Sync>;

pub fn always_succeed() -> Responder {
    Arc::new(|_| Reply::Success(json!([])))
}

pub fn responder(f: impl Fn(&Value) -> Reply + Send + Sync + 'static) -> Responder {
    Arc::new(f)
}

/// First entity id addressed by a `call_service` frame.
pub fn entity_of(frame: &Value) -> &str {
    frame
        .pointer("/target/entity_id/0")
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

pub struct MockHomeAssistant {
    pub url: String,
    pub connections: Arc<AtomicUsize>,
    pub auth_attempts: Arc<AtomicUsize>,
    pub received: Arc<Mutex<Vec<Value>>>,
    /// Set once a client sends a WebSocket close frame.
    pub client_closed: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl MockHomeAssistant {
    pub async fn start(responder: Responder) -> Self {
        Self::start_with(responder, true).await
    }

    /// Accepts the socket but never starts the handshake.
    pub async fn start_silent() -> Self {
        Self::start_with(always_succeed(), false).await
    }

    async fn start_with(responder: Responder, handshake: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let auth_attempts = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let client_closed = Arc::new(AtomicBool::new(false));

        let handle = {
            let connections = Arc::clone(&connections);
            let auth_attempts = Arc::clone(&auth_attempts);
            let received = Arc::clone(&received);
            let client_closed = Arc::clone(&client_closed);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        stream,
                        handshake,
                        Arc::clone(&responder),
                        Arc::clone(&auth_attempts),
                        Arc::clone(&received),
                        Arc::clone(&client_closed),
                    ));
                }
            })
        };

        Self {
            url: format!("http://{}", addr),
            connections,
            auth_attempts,
            received,
            client_closed,
            handle,
        }
    }

    pub fn config(&self) -> HomeAssistantConfig {
        HomeAssistantConfig::new(self.url.clone(), TOKEN.into())
            .with_connect_timeout(Duration::from_secs(2))
    }

    pub fn config_with_token(&self, token: &str) -> HomeAssistantConfig {
        HomeAssistantConfig::new(self.url.clone(), token.into())
            .with_connect_timeout(Duration::from_secs(2))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn client_closed(&self) -> bool {
        self.client_closed.load(Ordering::SeqCst)
    }
}

impl Drop for MockHomeAssistant {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn send_json(ws: &mut WebSocketStream<TcpStream>, value: Value) -> bool {
    ws.send(Message::Text(value.to_string().into())).await.is_ok()
}

async fn serve(
    stream: TcpStream,
    handshake: bool,
    responder: Responder,
    auth_attempts: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Value>>>,
    client_closed: Arc<AtomicBool>,
) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };

    if !handshake {
        // Hold the socket open without speaking.
        while ws.next().await.is_some() {}
        return;
    }

    if !send_json(&mut ws, json!({"type": "auth_required", "ha_version": "2025.6.0"})).await {
        return;
    }

    let Some(Ok(Message::Text(text))) = ws.next().await else {
        return;
    };
    auth_attempts.fetch_add(1, Ordering::SeqCst);
    let auth: Value = serde_json::from_str(&text).unwrap_or_default();
    if auth["type"] == "auth" && auth["access_token"] == TOKEN {
        send_json(&mut ws, json!({"type": "auth_ok", "ha_version": "2025.6.0"})).await;
    } else {
        send_json(&mut ws, json!({"type": "auth_invalid", "message": "Invalid access token"}))
            .await;
        let _ = ws.close(None).await;
        return;
    }

    let mut held: Vec<Value> = Vec::new();
    while let Some(Ok(msg)) = ws.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => {
                client_closed.store(true, Ordering::SeqCst);
                return;
            }
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        received.lock().unwrap().push(frame.clone());
        let id = frame["id"].clone();

        let reply = match responder(&frame) {
            Reply::Success(result) => {
                json!({"id": id, "type": "result", "success": true, "result": result})
            }
            Reply::Failure(code, message) => json!({
                "id": id,
                "type": "result",
                "success": false,
                "error": {"code": code, "message": message}
            }),
            Reply::Later(result) => {
                held.push(json!({"id": id, "type": "result", "success": true, "result": result}));
                continue;
            }
            Reply::Raw(mut raw) => {
                raw["id"] = id;
                raw
            }
            Reply::Ignore => continue,
            Reply::Close => {
                let _ = ws.close(None).await;
                return;
            }
        };

        if !send_json(&mut ws, reply).await {
            return;
        }
        for late in held.drain(..) {
            if !send_json(&mut ws, late).await {
                return;
            }
        }
    }
}

/// Polls until `check` holds, failing the test after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
