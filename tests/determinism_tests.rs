use std::sync::Arc;
use std::time::Duration;

use duraflow::client::Client;
use duraflow::providers::in_memory::InMemoryHistoryStore;
use duraflow::providers::{HistoryStore, QueueKind, WorkItem};
use duraflow::runtime::first_unawaited_schedule;
use duraflow::{
    run_turn, ActivityRegistry, Action, Event, OrchestrationContext, OrchestrationRegistry, Runtime, RuntimeStatus,
    NONDETERMINISM_PREFIX,
};

fn started() -> Event {
    Event::OrchestratorStarted {
        name: "ThreeStep".to_string(),
        input: String::new(),
    }
}

async fn three_step(ctx: OrchestrationContext) -> Result<String, String> {
    let a = ctx.schedule_activity("StepA", "1").await?;
    let b = ctx.schedule_activity("StepB", a).await?;
    ctx.schedule_activity("StepC", b).await
}

#[test]
fn forward_execution_assigns_ordinal_activity_ids() {
    let turn = run_turn::<Result<String, String>, _>(vec![started()], 0, three_step);
    assert!(turn.output.is_none());
    assert!(turn.nondeterminism.is_none());
    assert_eq!(
        turn.actions,
        vec![Action::CallActivity {
            id: 1,
            name: "StepA".to_string(),
            input: "1".to_string(),
        }]
    );
    assert!(turn
        .history
        .iter()
        .any(|e| matches!(e, Event::ActivityScheduled { id: 1, .. })));

    // Feed the completion back; the next turn schedules the next ordinal.
    let mut history = turn.history;
    history.push(Event::ActivityCompleted { id: 1, result: "a".to_string() });
    let turn = run_turn::<Result<String, String>, _>(history, 1, three_step);
    assert_eq!(
        turn.actions,
        vec![Action::CallActivity {
            id: 2,
            name: "StepB".to_string(),
            input: "a".to_string(),
        }]
    );
}

#[test]
fn replaying_a_complete_history_is_idempotent() {
    // Drive the orchestrator to completion, materializing completions by hand.
    let mut history = vec![started()];
    let results = ["a", "b", "c"];
    let mut step = 0;
    let output = loop {
        let turn = run_turn::<Result<String, String>, _>(history, step, three_step);
        history = turn.history;
        if let Some(out) = turn.output {
            break out;
        }
        for action in turn.actions {
            let Action::CallActivity { id, .. } = action else { continue };
            history.push(Event::ActivityCompleted {
                id,
                result: results[(id - 1) as usize].to_string(),
            });
        }
        step += 1;
    };
    assert_eq!(output, Ok("c".to_string()));

    // Replaying the finished history any number of times produces no new
    // events, no new actions, and the same claimed ordinals.
    for turn_index in 0..3 {
        let turn = run_turn::<Result<String, String>, _>(history.clone(), turn_index, three_step);
        assert_eq!(turn.output, Some(Ok("c".to_string())));
        assert!(turn.actions.is_empty());
        assert_eq!(turn.history.len(), history.len());
        assert_eq!(turn.claimed_ids, [1, 2, 3].into_iter().collect());
    }
}

#[test]
fn schedule_mismatch_is_a_distinct_nondeterminism_error() {
    let history = vec![
        started(),
        Event::ActivityScheduled {
            id: 1,
            name: "StepX".to_string(),
            input: "1".to_string(),
        },
    ];
    let turn = run_turn::<Result<String, String>, _>(history, 0, three_step);
    assert!(turn.output.is_none());
    let err = turn.nondeterminism.expect("mismatch must be flagged");
    assert!(err.starts_with(NONDETERMINISM_PREFIX), "unexpected error: {err}");
}

#[test]
fn unawaited_recorded_schedule_is_flagged() {
    // History recorded two steps, but the (swapped) code awaits only one.
    let history = vec![
        started(),
        Event::ActivityScheduled {
            id: 1,
            name: "StepA".to_string(),
            input: "1".to_string(),
        },
        Event::ActivityCompleted { id: 1, result: "a".to_string() },
        Event::ActivityScheduled {
            id: 2,
            name: "StepB".to_string(),
            input: "a".to_string(),
        },
        Event::ActivityCompleted { id: 2, result: "b".to_string() },
    ];
    let turn = run_turn::<Result<String, String>, _>(history, 0, |ctx: OrchestrationContext| async move {
        ctx.schedule_activity("StepA", "1").await
    });
    assert_eq!(turn.output, Some(Ok("a".to_string())));
    let err = first_unawaited_schedule(&turn.history, &turn.claimed_ids).expect("orphan schedule must be flagged");
    assert!(err.starts_with(NONDETERMINISM_PREFIX));
}

#[tokio::test]
async fn code_swap_mid_flight_fails_the_instance_with_distinct_error() {
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());

    // First deployment: Flow awaits activity A, which never finishes in time.
    let activities_v1 = ActivityRegistry::builder()
        .register("A", |_input| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            "never".to_string()
        })
        .build();
    let orchestrations_v1 = OrchestrationRegistry::builder()
        .register("Flow", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("A", "").await
        })
        .build();
    let rt1 = Runtime::start_with_store(store.clone(), Arc::new(activities_v1), orchestrations_v1).await;

    let client = Client::new(store.clone());
    client.start_workflow("swap-1", "Flow", "").await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if store
            .read("swap-1")
            .await
            .iter()
            .any(|e| matches!(e, Event::ActivityScheduled { .. }))
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    rt1.shutdown().await;

    // Second deployment swaps the orchestrator body to await B instead.
    let orchestrations_v2 = OrchestrationRegistry::builder()
        .register("Flow", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("B", "").await
        })
        .build();
    let rt2 = Runtime::start_with_store(store.clone(), Arc::new(ActivityRegistry::builder().build()), orchestrations_v2)
        .await;

    // A late completion for the original activity forces a replay under the
    // swapped code; the divergence must fail the instance, not be patched.
    store
        .enqueue_work(
            QueueKind::Orchestrator,
            WorkItem::ActivityCompleted {
                instance: "swap-1".to_string(),
                id: 1,
                result: "r".to_string(),
            },
        )
        .await
        .unwrap();

    let status = client.wait_for_terminal("swap-1", Duration::from_secs(2)).await.unwrap();
    match status {
        RuntimeStatus::Failed { error } => {
            assert!(error.starts_with(NONDETERMINISM_PREFIX), "unexpected error: {error}")
        }
        other => panic!("expected nondeterminism failure, got {other:?}"),
    }
    rt2.shutdown().await;
}
