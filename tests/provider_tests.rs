use std::sync::Arc;

use duraflow::providers::fs::FsHistoryStore;
use duraflow::providers::in_memory::InMemoryHistoryStore;
use duraflow::providers::{HistoryStore, QueueKind, WorkItem};
use duraflow::{Event, StoreError};

fn started(name: &str) -> Event {
    Event::OrchestratorStarted {
        name: name.to_string(),
        input: "in".to_string(),
    }
}

fn scheduled(id: u64) -> Event {
    Event::ActivityScheduled {
        id,
        name: "A".to_string(),
        input: String::new(),
    }
}

async fn store_contract(store: Arc<dyn HistoryStore>) {
    // Instance creation is exclusive.
    store.create_instance("i1").await.unwrap();
    assert!(matches!(
        store.create_instance("i1").await,
        Err(StoreError::InstanceExists(_))
    ));
    assert!(store.contains_instance("i1").await);
    assert!(!store.contains_instance("nope").await);
    assert!(store.read("nope").await.is_empty());

    // Length-guarded append: a stale expected length loses the race.
    store.append("i1", 0, vec![started("W")]).await.unwrap();
    assert!(matches!(
        store.append("i1", 0, vec![started("W")]).await,
        Err(StoreError::Conflict { expected: 0, actual: 1 })
    ));
    store.append("i1", 1, vec![scheduled(1)]).await.unwrap();
    assert_eq!(store.read("i1").await.len(), 2);
    assert!(matches!(
        store.append("missing", 0, vec![started("W")]).await,
        Err(StoreError::InstanceNotFound(_))
    ));

    // Metadata tracks creation and the latest append.
    let meta = store.metadata("i1").await.expect("metadata");
    assert!(meta.created_at_ms > 0);
    assert!(meta.last_updated_at_ms >= meta.created_at_ms);

    // Executions: a fresh one becomes the readable latest, the old one stays.
    assert_eq!(store.latest_execution_id("i1").await, Some(1));
    let exec = store.begin_execution("i1", vec![started("W2")]).await.unwrap();
    assert_eq!(exec, 2);
    assert_eq!(store.latest_execution_id("i1").await, Some(2));
    assert_eq!(store.read("i1").await, vec![started("W2")]);
    assert_eq!(store.read_execution("i1", 1).await.len(), 2);

    // Peek-lock queues: invisible until ack, abandoned items redeliver first.
    let item_a = WorkItem::StartWorkflow {
        instance: "q1".to_string(),
        orchestration: "W".to_string(),
        input: String::new(),
    };
    let item_b = WorkItem::ResumeInstance {
        instance: "q1".to_string(),
    };
    store.enqueue_work(QueueKind::Orchestrator, item_a.clone()).await.unwrap();
    store.enqueue_work(QueueKind::Orchestrator, item_b.clone()).await.unwrap();

    let (first, token_a) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
    assert_eq!(first, item_a);
    let (second, token_b) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
    assert_eq!(second, item_b);
    assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());

    store.abandon(QueueKind::Orchestrator, &token_a).await.unwrap();
    let (redelivered, token_a2) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
    assert_eq!(redelivered, item_a);
    store.ack(QueueKind::Orchestrator, &token_a2).await.unwrap();
    store.ack(QueueKind::Orchestrator, &token_b).await.unwrap();
    assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());

    // Worker queue is independent of the orchestrator queue.
    store
        .enqueue_work(
            QueueKind::Worker,
            WorkItem::ActivityExecute {
                instance: "q1".to_string(),
                id: 1,
                name: "A".to_string(),
                input: String::new(),
            },
        )
        .await
        .unwrap();
    assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
    let (work, token_w) = store.dequeue_peek_lock(QueueKind::Worker).await.unwrap();
    assert!(matches!(work, WorkItem::ActivityExecute { .. }));
    store.ack(QueueKind::Worker, &token_w).await.unwrap();

    assert_eq!(store.list_instances().await, vec!["i1".to_string()]);
}

#[tokio::test]
async fn in_memory_store_contract() {
    store_contract(Arc::new(InMemoryHistoryStore::new())).await;
}

#[tokio::test]
async fn fs_store_contract() {
    let td = tempfile::tempdir().unwrap();
    store_contract(Arc::new(FsHistoryStore::new(td.path(), true))).await;
}

#[tokio::test]
async fn fs_store_survives_reopen() {
    let td = tempfile::tempdir().unwrap();
    {
        let store = FsHistoryStore::new(td.path(), false);
        store.create_instance("persist-1").await.unwrap();
        store.append("persist-1", 0, vec![started("W")]).await.unwrap();
        store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::ResumeInstance {
                    instance: "persist-1".to_string(),
                },
            )
            .await
            .unwrap();
        // Peek-lock an item and "crash" without acking it.
        let (locked, _token) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
        assert!(matches!(locked, WorkItem::ResumeInstance { .. }));
    }
    // A new store over the same root sees history, and the unacked item is
    // recovered for redelivery.
    let store = FsHistoryStore::new(td.path(), false);
    assert_eq!(store.read("persist-1").await, vec![started("W")]);
    let (item, token) = store.dequeue_peek_lock(QueueKind::Orchestrator).await.unwrap();
    assert!(matches!(item, WorkItem::ResumeInstance { .. }));
    store.ack(QueueKind::Orchestrator, &token).await.unwrap();
    assert!(store.dequeue_peek_lock(QueueKind::Orchestrator).await.is_none());
}
