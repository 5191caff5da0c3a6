use std::sync::Arc;
use std::time::Duration;

use duraflow::client::Client;
use duraflow::providers::in_memory::InMemoryHistoryStore;
use duraflow::providers::HistoryStore;
use duraflow::{ActivityRegistry, OrchestrationContext, OrchestrationRegistry, Runtime, RuntimeStatus};

fn nap_registry(delay: Duration) -> (ActivityRegistry, OrchestrationRegistry) {
    let activities = ActivityRegistry::builder()
        .register("Nap", move |_input| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            "rested".to_string()
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("NapFlow", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("Nap", "").await
        })
        .build();
    (activities, orchestrations)
}

async fn wait_for_status(client: &Client, instance: &str, want: &RuntimeStatus, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if &client.status(instance).await == want {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn resume_on_running_instance_is_a_recoverable_noop() {
    let (activities, orchestrations) = nap_registry(Duration::from_millis(300));
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
    let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;
    let client = Client::new(store);

    client.start_workflow("noop-1", "NapFlow", "").await.unwrap();
    assert!(wait_for_status(&client, "noop-1", &RuntimeStatus::Running, Duration::from_secs(2)).await);

    // Resume and rewind are only legal from Suspended/Failed; both must be
    // ignored without disturbing the run.
    client.resume("noop-1").await.unwrap();
    client.rewind("noop-1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.status("noop-1").await, RuntimeStatus::Running);

    let status = client.wait_for_terminal("noop-1", Duration::from_secs(2)).await.unwrap();
    assert_eq!(status, RuntimeStatus::Completed { output: "rested".to_string() });
    rt.shutdown().await;
}

#[tokio::test]
async fn control_commands_on_completed_instance_are_noops() {
    let (activities, orchestrations) = nap_registry(Duration::ZERO);
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
    let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;
    let client = Client::new(store);

    client.start_workflow("done-1", "NapFlow", "").await.unwrap();
    let completed = client.wait_for_terminal("done-1", Duration::from_secs(2)).await.unwrap();

    client.suspend("done-1", "late").await.unwrap();
    client.resume("done-1").await.unwrap();
    client.rewind("done-1").await.unwrap();
    client.terminate("done-1", "late").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.status("done-1").await, completed);
    rt.shutdown().await;
}

#[tokio::test]
async fn terminate_stops_a_running_instance() {
    let (activities, orchestrations) = nap_registry(Duration::from_secs(30));
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
    let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;
    let client = Client::new(store);

    client.start_workflow("term-1", "NapFlow", "").await.unwrap();
    assert!(wait_for_status(&client, "term-1", &RuntimeStatus::Running, Duration::from_secs(2)).await);

    client.terminate("term-1", "operator request").await.unwrap();
    assert!(wait_for_status(&client, "term-1", &RuntimeStatus::Terminated, Duration::from_secs(2)).await);

    // Terminated is terminal: nothing revives it.
    client.resume("term-1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.status("term-1").await, RuntimeStatus::Terminated);
    rt.shutdown().await;
}

#[tokio::test]
async fn suspend_and_resume_round_trip_through_the_runtime() {
    let (activities, orchestrations) = nap_registry(Duration::from_millis(200));
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
    let rt = Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;
    let client = Client::new(store);

    client.start_workflow("pause-1", "NapFlow", "").await.unwrap();
    assert!(wait_for_status(&client, "pause-1", &RuntimeStatus::Running, Duration::from_secs(2)).await);

    client.suspend("pause-1", "backpressure").await.unwrap();
    assert!(wait_for_status(&client, "pause-1", &RuntimeStatus::Suspended, Duration::from_secs(2)).await);

    // The nap finishes while suspended; the instance must stay suspended.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(client.status("pause-1").await, RuntimeStatus::Suspended);

    client.resume("pause-1").await.unwrap();
    let status = client.wait_for_terminal("pause-1", Duration::from_secs(2)).await.unwrap();
    assert_eq!(status, RuntimeStatus::Completed { output: "rested".to_string() });
    rt.shutdown().await;
}

#[tokio::test]
async fn continue_as_new_rolls_into_a_fresh_execution() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Counter", |ctx: OrchestrationContext, input: String| async move {
            let n: u64 = input.parse().unwrap_or(0);
            if n < 2 {
                ctx.continue_as_new((n + 1).to_string());
                return Ok(String::new());
            }
            Ok(format!("done:{n}"))
        })
        .build();
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
    let rt = Runtime::start_with_store(store.clone(), Arc::new(ActivityRegistry::builder().build()), orchestrations)
        .await;
    let client = Client::new(store.clone());

    client.start_workflow("can-1", "Counter", "0").await.unwrap();
    let status = client.wait_for_terminal("can-1", Duration::from_secs(5)).await.unwrap();
    assert_eq!(status, RuntimeStatus::Completed { output: "done:2".to_string() });
    // Two rollovers: executions 1 and 2 continued, 3 completed.
    assert_eq!(store.latest_execution_id("can-1").await, Some(3));
    rt.shutdown().await;
}

#[tokio::test]
async fn unregistered_orchestration_fails_cleanly() {
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
    let rt = Runtime::start_with_store(
        store.clone(),
        Arc::new(ActivityRegistry::builder().build()),
        OrchestrationRegistry::builder().build(),
    )
    .await;
    let client = Client::new(store);

    client.start_workflow("ghost-1", "NoSuchFlow", "").await.unwrap();
    let status = client.wait_for_terminal("ghost-1", Duration::from_secs(2)).await.unwrap();
    match status {
        RuntimeStatus::Failed { error } => assert!(error.contains("unregistered:NoSuchFlow")),
        other => panic!("expected failure, got {other:?}"),
    }
    rt.shutdown().await;
}
