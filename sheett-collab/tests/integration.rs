//! Integration tests for end-to-end WebSocket replication.
//!
//! These tests start a real server and connect real synchronizers,
//! verifying the full sync pipeline.

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use sheett_collab::client::{ConnectionState, SyncConfig, SyncError, SyncEvent, Synchronizer};
use sheett_collab::protocol::{MessageType, PeerInfo, SyncMessage};
use sheett_collab::server::{ServerConfig, SyncServer};
use sheett_collab::storage::{DocumentStore, StoreConfig};
use sheett_core::spreadsheet::{field, CELLS_TABLE};
use sheett_core::{lock_store, CellValue, MergeableStore, SharedStore};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on `port`; the returned handle resolves when it stops.
async fn start_server(server: Arc<SyncServer>) -> tokio::task::JoinHandle<()> {
    let handle = tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle
}

/// Start an in-memory server on a free port, return its URL.
async fn start_test_server() -> String {
    let port = free_port().await;
    let server = Arc::new(SyncServer::new(ServerConfig::for_testing(format!("127.0.0.1:{port}"))).unwrap());
    start_server(server).await;
    format!("ws://127.0.0.1:{port}")
}

fn replica(doc_id: &str, replica_id: &str) -> SharedStore {
    Arc::new(Mutex::new(MergeableStore::with_replica(doc_id, replica_id)))
}

fn synchronizer(url: &str, doc_id: &str, user_id: &str, store: &SharedStore) -> Synchronizer {
    Synchronizer::new(doc_id, user_id, user_id, store.clone(), SyncConfig::for_testing(url))
}

async fn synced(sync: &Synchronizer) {
    sync.wait_for_state(ConnectionState::Synced, Duration::from_secs(3))
        .await
        .expect("synchronizer did not reach Synced");
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

fn value(store: &SharedStore, key: &str) -> Option<CellValue> {
    lock_store(store).get_value(key).cloned()
}

fn cell(store: &SharedStore, row_id: &str) -> Option<CellValue> {
    lock_store(store).get_cell(CELLS_TABLE, row_id, field::VALUE).cloned()
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let url = start_test_server().await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_end_to_end_budget_and_description() {
    let url = start_test_server().await;
    let a = replica("sheet-1", "A");
    let b = replica("sheet-1", "B");
    let _ = lock_store(&a).set_value("name", "Budget");
    let _ = lock_store(&b).set_value("description", "Q1 plan");

    let mut sync_a = synchronizer(&url, "sheet-1", "u1", &a);
    let mut sync_b = synchronizer(&url, "sheet-1", "u2", &b);
    sync_a.start();
    synced(&sync_a).await;
    sync_b.start();
    synced(&sync_b).await;

    assert!(
        eventually(|| value(&a, "description").is_some() && value(&b, "name").is_some()).await,
        "replicas did not converge"
    );
    for store in [&a, &b] {
        assert_eq!(value(store, "name"), Some(CellValue::from("Budget")));
        assert_eq!(value(store, "description"), Some(CellValue::from("Q1 plan")));
    }

    sync_a.close().await;
    sync_b.close().await;
}

#[tokio::test]
async fn test_live_patches_stream_to_other_replica() {
    let url = start_test_server().await;
    let a = replica("sheet-live", "A");
    let b = replica("sheet-live", "B");

    let mut sync_a = synchronizer(&url, "sheet-live", "u1", &a);
    let mut sync_b = synchronizer(&url, "sheet-live", "u2", &b);
    let mut events_b = sync_b.take_event_rx().unwrap();
    sync_a.start();
    sync_b.start();
    synced(&sync_a).await;
    synced(&sync_b).await;

    let patch = lock_store(&a).set_cell(CELLS_TABLE, "0-0", field::VALUE, "hello");
    assert!(sync_a.send_patch(&patch));

    let applied = timeout(Duration::from_secs(2), async {
        while let Some(event) = events_b.recv().await {
            if let SyncEvent::RemotePatch { applied, .. } = event {
                return applied;
            }
        }
        0
    })
    .await
    .unwrap();
    assert_eq!(applied, 1);
    assert_eq!(cell(&b, "0-0"), Some(CellValue::from("hello")));

    sync_a.close().await;
    sync_b.close().await;
}

#[tokio::test]
async fn test_concurrent_writes_tie_break_everywhere() {
    let url = start_test_server().await;
    let a = replica("sheet-tie", "A");
    let b = replica("sheet-tie", "B");
    // Both replicas write counter 1 to the same field while offline.
    let _ = lock_store(&a).set_cell(CELLS_TABLE, "0-0", field::VALUE, "hello");
    let _ = lock_store(&b).set_cell(CELLS_TABLE, "0-0", field::VALUE, "world");

    let mut sync_a = synchronizer(&url, "sheet-tie", "u1", &a);
    let mut sync_b = synchronizer(&url, "sheet-tie", "u2", &b);
    sync_a.start();
    sync_b.start();
    synced(&sync_a).await;
    synced(&sync_b).await;

    let world = Some(CellValue::from("world"));
    assert!(eventually(|| cell(&a, "0-0") == world && cell(&b, "0-0") == world).await);

    sync_a.close().await;
    sync_b.close().await;
}

#[tokio::test]
async fn test_patch_fan_out_skips_origin() {
    let url = start_test_server().await;

    let (mut ws_a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut ws_b, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let alice = PeerInfo::new("u1", "Alice");
    let bob = PeerInfo::new("u2", "Bob");
    for (ws, info) in [(&mut ws_a, &alice), (&mut ws_b, &bob)] {
        let hello = SyncMessage::peer_joined("sheet-fan", info).unwrap().encode().unwrap();
        ws.send(Message::Binary(hello.into())).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut store = MergeableStore::with_replica("sheet-fan", "A");
    let patch = store.set_cell(CELLS_TABLE, "1-1", field::VALUE, 7.0);
    let msg = SyncMessage::patch(alice.peer_id, "sheet-fan", store.counter(), &patch).unwrap();
    ws_a.send(Message::Binary(msg.encode().unwrap().into())).await.unwrap();

    async fn next_patch(
        ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    ) -> SyncMessage {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    let msg = SyncMessage::decode(&bytes).unwrap();
                    if msg.msg_type == MessageType::Patch {
                        return msg;
                    }
                }
                Some(_) => {}
                None => std::future::pending::<()>().await,
            }
        }
    }

    let received = timeout(Duration::from_secs(2), next_patch(&mut ws_b)).await.unwrap();
    assert_eq!(received.peer_id, alice.peer_id);
    assert_eq!(received.patch_payload().unwrap(), patch);

    let echoed = timeout(Duration::from_millis(300), next_patch(&mut ws_a)).await;
    assert!(echoed.is_err(), "origin must not receive its own patch");
}

#[tokio::test]
async fn test_lock_mutual_exclusion_through_room() {
    let url = start_test_server().await;
    let a = replica("sheet-lock", "A");
    let b = replica("sheet-lock", "B");
    let mut sync_a = synchronizer(&url, "sheet-lock", "u1", &a);
    let mut sync_b = synchronizer(&url, "sheet-lock", "u2", &b);
    sync_a.start();
    sync_b.start();
    synced(&sync_a).await;
    synced(&sync_b).await;

    sync_a.try_lock("0-0").await.unwrap();
    assert_eq!(
        sync_b.try_lock("0-0").await,
        Err(SyncError::LockHeldByOther {
            cell_id: "0-0".into(),
            holder: "u1".into()
        })
    );

    assert!(sync_a.unlock("0-0"));
    assert!(eventually(|| sync_b.lock_holder("0-0").is_none()).await);
    sync_b.try_lock("0-0").await.unwrap();
    assert!(eventually(|| sync_a.lock_holder("0-0").as_deref() == Some("u2")).await);

    sync_a.close().await;
    sync_b.close().await;
}

#[tokio::test]
async fn test_lock_released_when_owner_disconnects() {
    let url = start_test_server().await;
    let a = replica("sheet-drop", "A");
    let b = replica("sheet-drop", "B");
    let mut sync_a = synchronizer(&url, "sheet-drop", "u1", &a);
    let mut sync_b = synchronizer(&url, "sheet-drop", "u2", &b);
    sync_a.start();
    sync_b.start();
    synced(&sync_a).await;
    synced(&sync_b).await;

    sync_a.try_lock("4-2").await.unwrap();
    assert!(eventually(|| sync_b.lock_holder("4-2").as_deref() == Some("u1")).await);

    // No explicit unlock: the room releases it when the connection goes.
    sync_a.close().await;
    assert!(eventually(|| sync_b.lock_holder("4-2").is_none()).await);
    sync_b.try_lock("4-2").await.unwrap();

    sync_b.close().await;
}

#[tokio::test]
async fn test_lock_expires_after_inactivity() {
    let url = start_test_server().await;
    let a = replica("sheet-expire", "A");
    let b = replica("sheet-expire", "B");
    let mut sync_a = synchronizer(&url, "sheet-expire", "u1", &a);
    let mut sync_b = synchronizer(&url, "sheet-expire", "u2", &b);
    sync_a.start();
    sync_b.start();
    synced(&sync_a).await;
    synced(&sync_b).await;

    sync_a.try_lock("0-0").await.unwrap();
    // Test servers expire locks after 500ms of inactivity.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(eventually(|| sync_b.lock_holder("0-0").is_none()).await);
    sync_b.try_lock("0-0").await.unwrap();

    sync_a.close().await;
    sync_b.close().await;
}

#[tokio::test]
async fn test_peer_presence_events() {
    let url = start_test_server().await;
    let a = replica("sheet-peers", "A");
    let b = replica("sheet-peers", "B");
    let mut sync_a = synchronizer(&url, "sheet-peers", "u1", &a);
    let mut events_a = sync_a.take_event_rx().unwrap();
    sync_a.start();
    synced(&sync_a).await;

    let mut sync_b = synchronizer(&url, "sheet-peers", "u2", &b);
    sync_b.start();
    synced(&sync_b).await;

    let joined = next_matching(&mut events_a, |e| matches!(e, SyncEvent::PeerJoined(_))).await;
    let SyncEvent::PeerJoined(info) = joined else { unreachable!() };
    assert_eq!(info.user_id, "u2");

    sync_b.close().await;
    let left = next_matching(&mut events_a, |e| matches!(e, SyncEvent::PeerLeft(_))).await;
    assert_eq!(left, SyncEvent::PeerLeft(info.peer_id));

    sync_a.close().await;
}

async fn next_matching(
    events: &mut mpsc::UnboundedReceiver<SyncEvent>,
    pred: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not observed")
}

#[tokio::test]
async fn test_reconnect_resync_after_server_restart() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    let port = free_port().await;
    let url = format!("ws://127.0.0.1:{port}");
    let config = ServerConfig::for_testing(format!("127.0.0.1:{port}"));

    let server = Arc::new(SyncServer::with_store(config.clone(), storage.clone()));
    let running = start_server(server.clone()).await;

    let a = replica("sheet-resync", "A");
    let mut sync_a = synchronizer(&url, "sheet-resync", "u1", &a);
    sync_a.start();
    synced(&sync_a).await;

    // Take the server down; A goes offline and edits.
    server.shutdown();
    timeout(Duration::from_secs(2), running).await.unwrap().unwrap();
    sync_a
        .wait_for_state(ConnectionState::Disconnected, Duration::from_secs(2))
        .await
        .unwrap();
    let offline = lock_store(&a).set_cell(CELLS_TABLE, "0-0", field::VALUE, "offline edit");
    assert!(!sync_a.send_patch(&offline));

    // Server comes back; B writes M independent changes before A returns.
    let server = Arc::new(SyncServer::with_store(config, storage));
    start_server(server.clone()).await;
    let b = replica("sheet-resync", "B");
    let mut sync_b = synchronizer(&url, "sheet-resync", "u2", &b);
    sync_b.start();
    synced(&sync_b).await;
    for row in 1..=5 {
        let patch = lock_store(&b).set_cell(CELLS_TABLE, &format!("{row}-0"), field::VALUE, row as f64);
        sync_b.send_patch(&patch);
    }

    synced(&sync_a).await;
    assert!(
        eventually(|| {
            cell(&b, "0-0") == Some(CellValue::from("offline edit"))
                && (1..=5).all(|row| cell(&a, &format!("{row}-0")) == Some(CellValue::from(row as f64)))
        })
        .await,
        "replicas did not converge after reconnect"
    );
    assert_eq!(lock_store(&a).visible_tables(), lock_store(&b).visible_tables());

    sync_a.close().await;
    sync_b.close().await;
    server.shutdown();
}
