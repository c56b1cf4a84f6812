use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use skein_core::ids::{ChannelId, RunId};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// Unique client identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl Default for ClientId {
    fn default() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }
}

impl ClientId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connected WebSocket client and its run subscriptions.
pub struct Client {
    pub id: ClientId,
    pub tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
    subscriptions: Mutex<Vec<(RunId, ChannelId)>>,
}

impl Client {
    fn new(id: ClientId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all connected WebSocket clients.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Client>>,
    max_send_queue: usize,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new client and return its ID + outbound receiver.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.clients.insert(id.clone(), Arc::new(Client::new(id.clone(), tx)));
        (id, rx)
    }

    /// Remove a client. Returns its run subscriptions so the caller can
    /// detach them from the channel manager.
    pub fn unregister(&self, id: &ClientId) -> Vec<(RunId, ChannelId)> {
        match self.clients.remove(id) {
            Some((_, client)) => {
                client.connected.store(false, Ordering::Relaxed);
                std::mem::take(&mut *client.subscriptions.lock())
            }
            None => Vec::new(),
        }
    }

    /// Outbound sender for a client, used to bridge run subscriptions.
    pub fn sender(&self, id: &ClientId) -> Option<mpsc::Sender<String>> {
        self.clients.get(id).map(|c| c.tx.clone())
    }

    pub fn add_subscription(&self, id: &ClientId, run_id: RunId, channel_id: ChannelId) {
        if let Some(client) = self.clients.get(id) {
            client.subscriptions.lock().push((run_id, channel_id));
        }
    }

    pub fn remove_subscription(&self, id: &ClientId, channel_id: &ChannelId) {
        if let Some(client) = self.clients.get(id) {
            client.subscriptions.lock().retain(|(_, c)| c != channel_id);
        }
    }

    /// Send a message to a specific client. A full queue drops the message;
    /// the client recovers through replay.
    pub fn send_to(&self, client_id: &ClientId, message: String) -> bool {
        let Some(client) = self.clients.get(client_id) else {
            return false;
        };
        match client.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    client_id = %client_id,
                    msg_len = msg.len(),
                    "send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    fn mark_disconnected(&self, id: &ClientId) {
        if let Some(client) = self.clients.get(id) {
            client.connected.store(false, Ordering::Relaxed);
        }
    }

    fn record_pong(&self, id: &ClientId) {
        if let Some(client) = self.clients.get(id) {
            client.record_pong();
        }
    }

    /// IDs of clients that stopped answering pings.
    pub fn dead_clients(&self) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// Drive one WebSocket connection: writer forwards queued messages and
/// pings on an interval, reader feeds inbound text to the RPC processor and
/// tracks pongs. Returns when either side closes.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    on_message: mpsc::Sender<(ClientId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_cid = client_id.clone();
    let writer_registry = Arc::clone(&registry);
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        writer_registry.mark_disconnected(&writer_cid);
    });

    let reader_cid = client_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let _ = on_message.send((reader_cid.clone(), text.to_string())).await;
                }
                WsMessage::Pong(_) => reader_registry.record_pong(&reader_cid),
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) => {} // axum answers pings automatically
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_unique() {
        let a = ClientId::new();
        let b = ClientId::new();
        assert_ne!(a, b);
        assert!(a.0.starts_with("client_"));
    }

    #[test]
    fn register_and_unregister() {
        let registry = ClientRegistry::new(32);
        let (id1, _rx1) = registry.register();
        let (id2, _rx2) = registry.register();
        assert_eq!(registry.count(), 2);

        registry.unregister(&id1);
        registry.unregister(&id2);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn unregister_returns_subscriptions() {
        let registry = ClientRegistry::new(32);
        let (id, _rx) = registry.register();

        let run_id = RunId::new();
        let channel_id = ChannelId::new();
        registry.add_subscription(&id, run_id.clone(), channel_id.clone());

        let subs = registry.unregister(&id);
        assert_eq!(subs, vec![(run_id, channel_id)]);

        // Unknown client yields nothing.
        assert!(registry.unregister(&ClientId::new()).is_empty());
    }

    #[test]
    fn remove_subscription_detaches_single_channel() {
        let registry = ClientRegistry::new(32);
        let (id, _rx) = registry.register();

        let run_id = RunId::new();
        let keep = ChannelId::new();
        let drop = ChannelId::new();
        registry.add_subscription(&id, run_id.clone(), keep.clone());
        registry.add_subscription(&id, run_id.clone(), drop.clone());

        registry.remove_subscription(&id, &drop);
        assert_eq!(registry.unregister(&id), vec![(run_id, keep)]);
    }

    #[tokio::test]
    async fn send_to_delivers() {
        let registry = ClientRegistry::new(32);
        let (id, mut rx) = registry.register();

        assert!(registry.send_to(&id, "hello".into()));
        assert_eq!(rx.recv().await.unwrap(), "hello");

        assert!(!registry.send_to(&ClientId::new(), "nobody".into()));
    }

    #[test]
    fn send_to_full_queue_drops() {
        let registry = ClientRegistry::new(2);
        let (id, _rx) = registry.register();

        assert!(registry.send_to(&id, "one".into()));
        assert!(registry.send_to(&id, "two".into()));
        assert!(!registry.send_to(&id, "three".into()));
    }

    #[test]
    fn dead_client_detection() {
        let registry = ClientRegistry::new(32);
        let (id, _rx) = registry.register();
        assert!(registry.dead_clients().is_empty());

        registry
            .clients
            .get(&id)
            .unwrap()
            .last_pong
            .store(0, Ordering::Relaxed);
        assert_eq!(registry.dead_clients(), vec![id]);
    }
}
