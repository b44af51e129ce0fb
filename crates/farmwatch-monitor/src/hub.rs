use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use farmwatch_core::live_sync::{encode_notification, Notification, Scope};
use farmwatch_store::Store;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub heartbeat_interval: Duration,
    pub max_frame_bytes: usize,
}

struct Client {
    root: Option<String>,
    sender: mpsc::Sender<Message>,
    closer: oneshot::Sender<&'static str>,
}

/// Close code sent to clients the hub drops.
const EVICTED_CLOSE_CODE: u16 = 1008;

/// Fan-out point for live-sync notifications.
///
/// Every client owns a bounded queue drained by its own writer task, so a
/// stalled socket only ever costs that client its registration.
pub struct LiveHub {
    config: HubConfig,
    store: Arc<Store>,
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<String, Client>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    pub root: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(hub): State<Arc<LiveHub>>,
) -> impl IntoResponse {
    let root = params.root.filter(|value| !value.trim().is_empty());
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket, root).await;
    })
}

impl LiveHub {
    pub fn new(config: HubConfig, store: Arc<Store>) -> Self {
        Self {
            config,
            store,
            conn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    async fn register_client(
        &self,
        root: Option<String>,
        sender: mpsc::Sender<Message>,
        closer: oneshot::Sender<&'static str>,
    ) -> String {
        let conn_id = self.next_conn_id();
        info!(
            event = "client_connected",
            conn_id = %conn_id,
            root = root.as_deref().unwrap_or("")
        );
        self.clients
            .write()
            .await
            .insert(
                conn_id.clone(),
                Client {
                    root,
                    sender,
                    closer,
                },
            );
        conn_id
    }

    /// Drops the registration and tells the connection task to close the socket.
    async fn unregister_client(&self, conn_id: &str, reason: &'static str) {
        let removed = self.clients.write().await.remove(conn_id);
        if let Some(client) = removed {
            let _ = client.closer.send(reason);
            info!(event = "client_disconnected", conn_id = %conn_id, reason = reason);
        }
    }

    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, root: Option<String>) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(self.config.queue_capacity.max(1));
        let (close_tx, mut close_rx) = oneshot::channel::<&'static str>();
        let write_timeout = self.config.write_timeout;
        let mut writer_task = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    biased;
                    reason = &mut close_rx => {
                        let frame = Message::Close(Some(CloseFrame {
                            code: EVICTED_CLOSE_CODE,
                            reason: reason.unwrap_or("disconnect").into(),
                        }));
                        let _ = tokio::time::timeout(write_timeout, ws_sender.send(frame)).await;
                        return;
                    }
                    msg = rx.recv() => match msg {
                        Some(msg) => msg,
                        None => return,
                    },
                };
                match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(event = "write_error", error = %err);
                        return;
                    }
                    Err(_) => {
                        warn!(event = "write_timeout");
                        return;
                    }
                }
            }
        });

        let conn_id = self.register_client(root, tx, close_tx).await;

        let mut writer_done = false;
        let reason = loop {
            tokio::select! {
                incoming = ws_receiver.next() => match incoming {
                    Some(Ok(Message::Close(_))) => {
                        info!(event = "client_close", conn_id = %conn_id);
                        break "disconnect";
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "read_error", conn_id = %conn_id, error = %err);
                        break "read_error";
                    }
                    None => break "disconnect",
                },
                _ = &mut writer_task => {
                    writer_done = true;
                    break "writer_closed";
                }
            }
        };

        self.unregister_client(&conn_id, reason).await;
        if !writer_done {
            let _ = writer_task.await;
        }
    }

    /// Encodes once and enqueues for every client whose root admits it.
    pub async fn broadcast(&self, notification: &Notification) {
        let frame = match encode_notification(notification, self.config.max_frame_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "notification_dropped", kind = notification.name(), error = %err);
                return;
            }
        };

        let targets: Vec<(String, Option<String>, mpsc::Sender<Message>)> = self
            .clients
            .read()
            .await
            .iter()
            .map(|(conn_id, client)| (conn_id.clone(), client.root.clone(), client.sender.clone()))
            .collect();
        if targets.is_empty() {
            return;
        }

        let subtrees = self
            .subtrees_for(notification.scope(), targets.iter().filter_map(|t| t.1.clone()))
            .await;

        let mut slow = Vec::new();
        for (conn_id, root, sender) in targets {
            if !admits(notification.scope(), root.as_deref(), &subtrees) {
                continue;
            }
            match sender.try_send(Message::Text(frame.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    slow.push((conn_id, "closed"));
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(event = "slow_consumer", conn_id = %conn_id);
                    slow.push((conn_id, "slow_consumer"));
                }
            }
        }

        for (conn_id, reason) in slow {
            self.unregister_client(&conn_id, reason).await;
        }
    }

    /// Subtree of every distinct client root, read fresh from the store.
    ///
    /// Roots that fail to load are left out, which lets the notification
    /// through for those clients.
    async fn subtrees_for(
        &self,
        scope: Scope<'_>,
        roots: impl Iterator<Item = String>,
    ) -> HashMap<String, HashSet<String>> {
        let needs_lookup = match scope {
            Scope::Global | Scope::Run(None) => false,
            Scope::Item(_) | Scope::Run(Some(_)) => true,
        };
        if !needs_lookup {
            return HashMap::new();
        }
        let roots: HashSet<String> = roots.collect();
        if roots.is_empty() {
            return HashMap::new();
        }

        let store = Arc::clone(&self.store);
        let lookup = tokio::task::spawn_blocking(move || {
            let mut subtrees = HashMap::new();
            for root in roots {
                match store.subtree_ids(&root) {
                    Ok(ids) => {
                        subtrees.insert(root, ids);
                    }
                    Err(err) => {
                        warn!(event = "subtree_lookup_failed", root = %root, error = %err);
                    }
                }
            }
            subtrees
        })
        .await;
        lookup.unwrap_or_default()
    }

    pub fn start_heartbeat(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.broadcast(&Notification::Heartbeat).await;
            }
        })
    }
}

fn admits(
    scope: Scope<'_>,
    root: Option<&str>,
    subtrees: &HashMap<String, HashSet<String>>,
) -> bool {
    let Some(root) = root else {
        return true;
    };
    let id = match scope {
        Scope::Global | Scope::Run(None) => return true,
        Scope::Item(id) | Scope::Run(Some(id)) => id,
    };
    match subtrees.get(root) {
        Some(ids) => ids.contains(id),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use farmwatch_core::live_sync::{
        decode_notification, ItemUpdated, RunComplete, DEFAULT_MAX_FRAME_BYTES,
    };
    use farmwatch_core::{IssueStatus, STORE_MARKER_DIR};
    use futures_util::StreamExt;
    use std::fs;
    use tempfile::TempDir;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn test_config(queue_capacity: usize) -> HubConfig {
        HubConfig {
            write_timeout: Duration::from_secs(1),
            queue_capacity,
            heartbeat_interval: Duration::from_secs(60),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    fn tree_store() -> (TempDir, Arc<Store>) {
        let dir = TempDir::new().expect("temp dir");
        let store_dir = dir.path().join(STORE_MARKER_DIR);
        fs::create_dir_all(&store_dir).expect("store dir");
        let issues = [
            r#"{"id":"root","title":"Root"}"#,
            r#"{"id":"child","title":"Child","deps":[{"type":"parent","target":"root"}]}"#,
            r#"{"id":"other","title":"Other"}"#,
        ]
        .join("\n");
        fs::write(store_dir.join("issues.jsonl"), issues).expect("issues");
        fs::write(store_dir.join("forum.jsonl"), "").expect("forum");
        let store = Arc::new(Store::open(dir.path()));
        (dir, store)
    }

    fn updated(id: &str) -> Notification {
        Notification::ItemUpdated(ItemUpdated {
            id: id.to_string(),
            status: IssueStatus::Closed,
            outcome: None,
        })
    }

    #[test]
    fn root_scoping_rules() {
        let subtrees = HashMap::from([(
            "root".to_string(),
            HashSet::from(["root".to_string(), "child".to_string()]),
        )]);
        assert!(admits(Scope::Global, Some("root"), &subtrees));
        assert!(admits(Scope::Item("child"), Some("root"), &subtrees));
        assert!(!admits(Scope::Item("other"), Some("root"), &subtrees));
        assert!(admits(Scope::Item("other"), None, &subtrees));
        assert!(admits(Scope::Run(None), Some("root"), &subtrees));
        assert!(!admits(Scope::Run(Some("other")), Some("root"), &subtrees));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_client_is_evicted_without_blocking_others() {
        let (_dir, store) = tree_store();
        let hub = Arc::new(LiveHub::new(test_config(1), store));

        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (slow_close, mut slow_closed) = oneshot::channel();
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        let (fast_close, _fast_closed) = oneshot::channel();
        hub.register_client(None, slow_tx, slow_close).await;
        hub.register_client(None, fast_tx, fast_close).await;

        hub.broadcast(&updated("child")).await;
        hub.broadcast(&updated("other")).await;
        assert_eq!(hub.client_count().await, 1);
        assert_eq!(slow_closed.try_recv(), Ok("slow_consumer"));

        hub.broadcast(&Notification::Heartbeat).await;
        let mut received = Vec::new();
        while let Ok(Message::Text(text)) = fast_rx.try_recv() {
            received.push(decode_notification(&text, DEFAULT_MAX_FRAME_BYTES).expect("decode"));
        }
        assert_eq!(
            received,
            vec![updated("child"), updated("other"), Notification::Heartbeat]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_client_is_unregistered() {
        let (_dir, store) = tree_store();
        let hub = Arc::new(LiveHub::new(test_config(4), store));
        let (tx, rx) = mpsc::channel(4);
        let (close_tx, _close_rx) = oneshot::channel();
        hub.register_client(None, tx, close_tx).await;
        drop(rx);

        hub.broadcast(&Notification::Heartbeat).await;
        assert_eq!(hub.client_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn websocket_clients_receive_scoped_frames_in_order() {
        let (_dir, store) = tree_store();
        let hub = Arc::new(LiveHub::new(test_config(16), store));
        let app = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(Arc::clone(&hub));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?root=root"))
            .await
            .expect("connect");

        for _ in 0..100 {
            if hub.client_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(hub.client_count().await, 1);

        let run_done = Notification::RunComplete(RunComplete {
            run_id: "run-1".to_string(),
            status: "complete".to_string(),
            issue_id: Some("child".to_string()),
        });
        hub.broadcast(&updated("other")).await;
        hub.broadcast(&updated("child")).await;
        hub.broadcast(&run_done).await;
        hub.broadcast(&Notification::Heartbeat).await;

        let mut received = Vec::new();
        while received.len() < 3 {
            let next = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("frame in time")
                .expect("stream open")
                .expect("frame");
            if let WsMessage::Text(text) = next {
                received.push(decode_notification(&text, DEFAULT_MAX_FRAME_BYTES).expect("decode"));
            }
        }
        assert_eq!(received, vec![updated("child"), run_done, Notification::Heartbeat]);

        socket.close(None).await.expect("close");
        for _ in 0..100 {
            if hub.client_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(hub.client_count().await, 0);
        server.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn evicted_websocket_receives_close_frame() {
        let (_dir, store) = tree_store();
        let hub = Arc::new(LiveHub::new(test_config(16), store));
        let app = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(Arc::clone(&hub));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("connect");
        for _ in 0..100 {
            if hub.client_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(hub.client_count().await, 1);

        hub.unregister_client("conn-1", "slow_consumer").await;
        assert_eq!(hub.client_count().await, 0);

        let next = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("close in time");
        match next {
            Some(Ok(WsMessage::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), EVICTED_CLOSE_CODE);
                assert_eq!(frame.reason, "slow_consumer");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
        server.abort();
    }
}
