//! Push channel to the relay. One connection task per process, started
//! lazily on first subscribe and reused by every consumer; only an explicit
//! `disconnect` tears it down. Connectivity degrades silently: after the
//! reconnect budget is spent the UI shows a fallback indicator and polling
//! remains the source of truth.

use convo_core::{parse_new_message, Frame, NewMessagePayload, EVENT_NEW_MESSAGE};
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use url::Url;

pub const RECONNECT_ATTEMPTS: u32 = 5;
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum RelayEvent {
    Connected,
    Disconnected,
    /// Reconnect budget spent; the task has stopped for good.
    GaveUp,
    NewMessage(NewMessagePayload),
}

/// An established transport. Closing is signalled by the sender side going
/// away; the manager never writes to the relay.
pub struct Connection {
    pub incoming: mpsc::Receiver<String>,
}

/// Transport factory, dependency-injected so tests can drive deterministic
/// connect/disconnect/event sequences without a network.
pub trait RelayConnector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, Result<Connection, String>>;
}

pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

impl RelayConnector for WebSocketConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Connection, String>> {
        let url = self.url.clone();
        Box::pin(async move {
            let (ws, _) = connect_async(url.as_str())
                .await
                .map_err(|err| err.to_string())?;
            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            tokio::spawn(async move {
                let mut ws = ws;
                while let Some(result) = ws.next().await {
                    match result {
                        Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                            if tx.send(text).await.is_err() {
                                break;
                            }
                        }
                        Ok(tokio_tungstenite::tungstenite::Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            });
            Ok(Connection { incoming: rx })
        })
    }
}

/// Process-wide handle to the relay connection. Consumers attach by
/// subscribing receivers; detaching is dropping them. The underlying task
/// outlives every consumer.
pub struct RelayHandle {
    connector: Arc<dyn RelayConnector>,
    events: broadcast::Sender<RelayEvent>,
    connected_tx: Arc<watch::Sender<bool>>,
    connected_rx: watch::Receiver<bool>,
    shutdown: Arc<Notify>,
    started: AtomicBool,
}

impl RelayHandle {
    pub fn new(connector: Arc<dyn RelayConnector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (connected_tx, connected_rx) = watch::channel(false);
        Self {
            connector,
            events,
            connected_tx: Arc::new(connected_tx),
            connected_rx,
            shutdown: Arc::new(Notify::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Attach a consumer. The connection task starts on the first call and
    /// is shared by all later ones.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.ensure_started();
        self.events.subscribe()
    }

    /// Connectivity for status display only; transitions arrive
    /// asynchronously.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    /// Explicit full teardown. Consumer detach never closes the connection.
    /// `notify_one` stores a permit, so a teardown requested before the task
    /// reaches its next await point is not lost.
    pub fn disconnect(&self) {
        self.shutdown.notify_one();
    }

    fn ensure_started(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let connector = self.connector.clone();
        let events = self.events.clone();
        let connected = self.connected_tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            run_connection(connector, events, connected, shutdown).await;
        });
    }
}

async fn run_connection(
    connector: Arc<dyn RelayConnector>,
    events: broadcast::Sender<RelayEvent>,
    connected: Arc<watch::Sender<bool>>,
    shutdown: Arc<Notify>,
) {
    let mut attempts_left = RECONNECT_ATTEMPTS;
    loop {
        let connect = tokio::select! {
            _ = shutdown.notified() => return,
            result = connector.connect() => result,
        };

        match connect {
            Ok(mut conn) => {
                attempts_left = RECONNECT_ATTEMPTS;
                let _ = connected.send(true);
                let _ = events.send(RelayEvent::Connected);
                info!(event = "relay_connected");

                loop {
                    tokio::select! {
                        _ = shutdown.notified() => {
                            let _ = connected.send(false);
                            let _ = events.send(RelayEvent::Disconnected);
                            info!(event = "relay_shutdown");
                            return;
                        }
                        frame = conn.incoming.recv() => match frame {
                            Some(text) => dispatch_frame(&events, &text),
                            None => break,
                        }
                    }
                }

                let _ = connected.send(false);
                let _ = events.send(RelayEvent::Disconnected);
                warn!(event = "relay_dropped");
            }
            Err(err) => {
                warn!(event = "relay_connect_error", error = %err);
            }
        }

        attempts_left -= 1;
        if attempts_left == 0 {
            info!(event = "relay_gave_up", attempts = RECONNECT_ATTEMPTS);
            let _ = events.send(RelayEvent::GaveUp);
            return;
        }
        tokio::select! {
            _ = shutdown.notified() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

/// Schema check at the subscription boundary: anything malformed is dropped
/// and logged, never propagated as an error.
fn dispatch_frame(events: &broadcast::Sender<RelayEvent>, text: &str) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            warn!(event = "frame_invalid", error = %err);
            return;
        }
    };
    if frame.event != EVENT_NEW_MESSAGE {
        debug!(event = "frame_ignored", name = %frame.event);
        return;
    }
    match parse_new_message(&frame.payload) {
        Ok(payload) => {
            let _ = events.send(RelayEvent::NewMessage(payload));
        }
        Err(err) => {
            warn!(event = "payload_invalid", error = err);
        }
    }
}
