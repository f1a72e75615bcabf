//! Durability tests through the full server stack.
//!
//! Verifies:
//! - Write-through: a backup taken while running already holds every edit
//! - Restart: a new server on the same storage restores state in order
//! - Re-upserting an element keeps its original position in the order
//! - Stats report storage usage

use std::path::Path;
use std::time::Duration;

use atelier_sync::element::{Element, ElementContent};
use atelier_sync::engine::EngineHandle;
use atelier_sync::protocol::{ClientMessage, ServerMessage};
use atelier_sync::server::{ServerConfig, SyncServer};
use atelier_sync::storage::{ElementStore, StoreConfig};
use futures_util::{SinkExt, StreamExt};
use tempfile::tempdir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(3);

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Running {
    url: String,
    engine: EngineHandle,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

async fn start(storage: &Path) -> Running {
    let config = ServerConfig {
        storage_path: Some(storage.to_path_buf()),
        autosave_interval: Duration::from_secs(3600),
        ..ServerConfig::for_testing()
    };
    let server = SyncServer::bind(config).await.unwrap();
    let url = format!("ws://{}", server.local_addr());
    let engine = server.engine();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        server
            .run(async {
                let _ = stopped.await;
            })
            .await
            .unwrap();
    });
    Running {
        url,
        engine,
        stop,
        task,
    }
}

async fn stop(running: Running) {
    let _ = running.stop.send(());
    running.task.await.unwrap();
}

/// Connect, send `messages`, and wait until the engine holds `expected`
/// elements.
async fn edit(running: &Running, messages: Vec<ClientMessage>, expected: usize) {
    let (mut ws, _) = tokio_tungstenite::connect_async(running.url.as_str())
        .await
        .unwrap();
    for message in messages {
        ws.send(Message::text(message.encode().unwrap())).await.unwrap();
    }
    timeout(WAIT, async {
        loop {
            if running.engine.stats().await.unwrap().elements == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("edits never applied");
    ws.close(None).await.unwrap();
}

/// Snapshot as seen by a newly connected client.
async fn snapshot(url: &str) -> Vec<Element> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let elements = timeout(WAIT, async {
        while let Some(frame) = ws.next().await {
            if let Ok(Message::Text(text)) = frame {
                if let Ok(ServerMessage::CanvasStateSync(elements)) =
                    ServerMessage::decode(text.as_str())
                {
                    return elements;
                }
            }
        }
        panic!("connection closed before canvas-state-sync");
    })
    .await
    .unwrap();
    let _ = ws.close(None).await;
    elements
}

fn ids(elements: &[Element]) -> Vec<&str> {
    elements.iter().map(|e| e.id.as_str()).collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempdir().unwrap();
    let storage = dir.path().join("workspace");

    let running = start(&storage).await;
    let first = Element::note("first", "one", "A");
    let mut edited = first.clone();
    edited.content = ElementContent::Text("one, edited".into());
    edit(
        &running,
        vec![
            ClientMessage::CanvasElementAdd(first),
            ClientMessage::CanvasElementAdd(Element::note("second", "two", "A")),
            ClientMessage::CanvasElementAdd(Element::note("third", "three", "A")),
            ClientMessage::CanvasElementRemove("second".into()),
            // Re-upsert of an existing id keeps its slot
            ClientMessage::CanvasUpdate(edited.clone()),
        ],
        2,
    )
    .await;
    stop(running).await;

    let running = start(&storage).await;
    let restored = snapshot(&running.url).await;
    assert_eq!(ids(&restored), vec!["first", "third"]);
    assert_eq!(restored[0], edited);
    stop(running).await;
}

#[tokio::test]
async fn test_backup_while_running_holds_written_through_edits() {
    let dir = tempdir().unwrap();
    let storage = dir.path().join("workspace");
    let running = start(&storage).await;

    edit(
        &running,
        vec![
            ClientMessage::CanvasElementAdd(Element::note("a", "1", "A")),
            ClientMessage::CanvasElementAdd(Element::note("b", "2", "A")),
        ],
        2,
    )
    .await;

    let target = dir.path().join("manual-backup");
    let written = running.engine.backup(Some(target.clone())).await.unwrap();
    assert_eq!(written, target);

    let copy = ElementStore::open(StoreConfig::for_testing(&target).read_only()).unwrap();
    assert_eq!(ids(&copy.load().unwrap()), vec!["a", "b"]);
    drop(copy);

    // Default target lands next to the live database
    let default = running.engine.backup(None).await.unwrap();
    assert!(default.starts_with(dir.path().join("backups")));

    stop(running).await;
}

#[tokio::test]
async fn test_stats_report_storage() {
    let dir = tempdir().unwrap();
    let storage = dir.path().join("workspace");
    let running = start(&storage).await;

    edit(
        &running,
        vec![ClientMessage::CanvasElementAdd(Element::note("a", "1", "A"))],
        1,
    )
    .await;

    let stats = running.engine.stats().await.unwrap();
    let store = stats.storage.expect("persistent server reports storage");
    assert_eq!(store.count, 1);
    assert_eq!(store.path, storage);
    assert!(store.byte_size > 0);

    stop(running).await;
}

#[tokio::test]
async fn test_in_memory_server_has_no_storage_stats() {
    let server = SyncServer::bind(ServerConfig::for_testing()).await.unwrap();
    let engine = server.engine();
    let stats = engine.stats().await.unwrap();
    assert!(stats.storage.is_none());
    assert!(engine.backup(None).await.is_err());
    server.run(async {}).await.unwrap();
}
