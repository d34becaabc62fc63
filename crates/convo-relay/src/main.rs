use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use convo_core::{Frame, EVENT_NEW_MESSAGE};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MAX_EVENT_BYTES: usize = 256 * 1024;
const CLIENT_QUEUE_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    ping_interval: Duration,
    write_timeout: Duration,
}

#[derive(Parser, Debug)]
#[command(name = "convo-relay")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
}

/// One connected dashboard client. Every client is a plain subscriber;
/// the relay never expects application frames from it.
#[derive(Clone)]
struct Client {
    conn_id: String,
    sender: mpsc::Sender<Message>,
}

impl Client {
    async fn send_text(&self, text: &str) -> bool {
        self.sender
            .send(Message::Text(text.to_string()))
            .await
            .is_ok()
    }
}

struct RelayState {
    config: Config,
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<String, Arc<Client>>>,
}

impl RelayState {
    fn new(config: Config) -> Self {
        Self {
            config,
            conn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    async fn register_client(&self, client: Arc<Client>) {
        self.clients
            .write()
            .await
            .insert(client.conn_id.clone(), client.clone());
        info!(event = "client_connected", conn_id = %client.conn_id);
    }

    async fn remove_client(&self, client: &Client, reason: &str) {
        if self
            .clients
            .write()
            .await
            .remove(&client.conn_id)
            .is_some()
        {
            info!(event = "client_disconnected", conn_id = %client.conn_id, reason = reason);
        }
    }

    async fn snapshot_clients(&self) -> Vec<Arc<Client>> {
        self.clients.read().await.values().cloned().collect()
    }

    /// Plain fan-out. No filtering, no ordering, no delivery guarantee;
    /// a client that cannot be written to is dropped.
    async fn broadcast(&self, text: &str) -> usize {
        let clients = self.snapshot_clients().await;
        let mut delivered = 0;
        for client in clients {
            if client.send_text(text).await {
                delivered += 1;
            } else {
                warn!(event = "send_error", conn_id = %client.conn_id);
                self.remove_client(&client, "send_error").await;
            }
        }
        delivered
    }

    fn start_ping(self: Arc<Self>, client: Arc<Client>) {
        if self.config.ping_interval.is_zero() {
            return;
        }
        let interval = self.config.ping_interval;
        let relay = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if client.sender.send(Message::Ping(Vec::new())).await.is_err() {
                    relay.remove_client(&client, "ping_failed").await;
                    return;
                }
            }
        });
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_QUEUE_CAPACITY);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let send = ws_sender.send(msg);
                if tokio::time::timeout(write_timeout, send).await.is_err() {
                    return;
                }
            }
        });

        let client = Arc::new(Client {
            conn_id: self.next_conn_id(),
            sender: tx.clone(),
        });
        self.register_client(client.clone()).await;
        self.clone().start_ping(client.clone());

        // Subscribers publish nothing; the read side only notices closes.
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(Message::Close(_)) => {
                    info!(event = "client_close", conn_id = %client.conn_id);
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(_) => continue,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %client.conn_id, error = %err);
                    break;
                }
            }
        }

        self.remove_client(&client, "disconnect").await;
        drop(tx);
        let _ = write_task.await;
    }
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging();

    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let relay = Arc::new(RelayState::new(config.clone()));

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/events/new-message", post(ingest_new_message))
        .route("/health", get(health))
        .with_state(relay.clone());

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(event = "relay_error", error = %err);
            return;
        }
    };

    info!(event = "relay_start", addr = %config.addr);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!(event = "relay_error", error = %err);
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(relay): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        relay.handle_socket(socket).await;
    })
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Ingestion endpoint for the chat pipeline. The payload is forwarded
/// verbatim to every connected client; the relay only requires a JSON
/// object and a sane size.
async fn ingest_new_message(
    State(relay): State<Arc<RelayState>>,
    body: Result<Json<Value>, axum::extract::rejection::JsonRejection>,
) -> impl IntoResponse {
    let Ok(Json(payload)) = body else {
        return invalid_payload();
    };
    let Some(text) = encode_new_message(&payload) else {
        return invalid_payload();
    };
    if text.len() > MAX_EVENT_BYTES {
        warn!(event = "event_too_large", size = text.len());
        return invalid_payload();
    }

    let delivered = relay.broadcast(&text).await;
    info!(event = "event_broadcast", delivered = delivered);
    (StatusCode::OK, Json(serde_json::json!({ "delivered": true })))
}

fn invalid_payload() -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": "Invalid payload" })),
    )
}

/// None when the payload is not a JSON object.
fn encode_new_message(payload: &Value) -> Option<String> {
    if !payload.is_object() {
        return None;
    }
    let frame = Frame {
        event: EVENT_NEW_MESSAGE.to_string(),
        payload: payload.clone(),
    };
    serde_json::to_string(&frame).ok()
}

fn load_config() -> Config {
    let args = Args::parse();
    let addr = if !args.addr.trim().is_empty() {
        args.addr
    } else {
        match std::env::var("RELAY_ADDR") {
            Ok(value) if !value.trim().is_empty() => value,
            _ => "127.0.0.1:4000".to_string(),
        }
    };
    Config {
        addr,
        ping_interval: Duration::from_secs(args.ping_interval),
        write_timeout: Duration::from_secs(args.write_timeout),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_state() -> Arc<RelayState> {
        Arc::new(RelayState::new(Config {
            addr: "127.0.0.1:0".to_string(),
            ping_interval: Duration::from_secs(0),
            write_timeout: Duration::from_secs(1),
        }))
    }

    #[test]
    fn encode_rejects_non_object_payloads() {
        assert!(encode_new_message(&json!("just a string")).is_none());
        assert!(encode_new_message(&json!([1, 2, 3])).is_none());
        assert!(encode_new_message(&json!(null)).is_none());
        assert!(encode_new_message(&json!({ "session_id": "s-1" })).is_some());
    }

    #[test]
    fn encoded_frame_carries_event_name_and_payload() {
        let text = encode_new_message(&json!({ "id": 7 })).unwrap();
        let frame: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(frame.event, EVENT_NEW_MESSAGE);
        assert_eq!(frame.payload, json!({ "id": 7 }));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_registered_client() {
        let relay = test_state();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        relay
            .register_client(Arc::new(Client {
                conn_id: "conn-a".to_string(),
                sender: tx_a,
            }))
            .await;
        relay
            .register_client(Arc::new(Client {
                conn_id: "conn-b".to_string(),
                sender: tx_b,
            }))
            .await;

        let delivered = relay.broadcast("{\"event\":\"new_message\"}").await;
        assert_eq!(delivered, 2);
        assert!(matches!(rx_a.recv().await, Some(Message::Text(_))));
        assert!(matches!(rx_b.recv().await, Some(Message::Text(_))));
    }

    #[tokio::test]
    async fn broadcast_drops_clients_with_closed_queues() {
        let relay = test_state();
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        relay
            .register_client(Arc::new(Client {
                conn_id: "conn-dead".to_string(),
                sender: tx,
            }))
            .await;

        let delivered = relay.broadcast("{}").await;
        assert_eq!(delivered, 0);
        assert!(relay.clients.read().await.is_empty());
    }
}
