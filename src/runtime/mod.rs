//! In-process runtime: consumes provider work queues, drives replay turns,
//! executes activities with bounded retry, and persists history through the
//! store's compare-and-append guard.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::StoreError;
use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::{Event, TurnResult};

pub mod registry;
pub mod retry;
mod status;

pub use registry::{ActivityRegistry, OrchestrationHandler, OrchestrationRegistry};
pub use retry::RetryPolicy;
pub use status::{descriptor, effective_history, first_unawaited_schedule, unresolved_activities, RuntimeStatus};

/// Configuration options for the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Polling interval in milliseconds when dispatcher queues are empty.
    pub dispatcher_idle_sleep_ms: u64,
    /// Retry policy applied to transient activity failures.
    pub retry: RetryPolicy,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep_ms: 10,
            retry: RetryPolicy::default(),
        }
    }
}

/// Runtime that owns the orchestration and activity dispatchers for one
/// process. Many instances advance concurrently; any single instance is
/// advanced by one replay-and-commit pass at a time, serialized through the
/// orchestrator queue and the store's length-guarded append.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    store: Arc<dyn HistoryStore>,
    orchestrations: OrchestrationRegistry,
    options: RuntimeOptions,
}

impl Runtime {
    /// Start a runtime over a fresh in-memory store.
    pub async fn start(activities: Arc<ActivityRegistry>, orchestrations: OrchestrationRegistry) -> Arc<Self> {
        let store: Arc<dyn HistoryStore> = Arc::new(crate::providers::in_memory::InMemoryHistoryStore::new());
        Self::start_with_store(store, activities, orchestrations).await
    }

    /// Start a runtime with a custom store.
    pub async fn start_with_store(
        store: Arc<dyn HistoryStore>,
        activities: Arc<ActivityRegistry>,
        orchestrations: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(store, activities, orchestrations, RuntimeOptions::default()).await
    }

    /// Start a runtime with custom options.
    pub async fn start_with_options(
        store: Arc<dyn HistoryStore>,
        activities: Arc<ActivityRegistry>,
        orchestrations: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times).
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            store,
            orchestrations,
            options,
        });

        let handle = runtime.clone().start_orchestration_dispatcher();
        runtime.joins.lock().await.push(handle);

        let work_handle = runtime.clone().start_activity_dispatcher(activities);
        runtime.joins.lock().await.push(work_handle);

        runtime
    }

    /// Abort background dispatcher tasks.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
    }

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.store.dequeue_peek_lock(QueueKind::Orchestrator).await {
                    Some((item, token)) => match self.process_orchestrator_item(&item).await {
                        Ok(()) => {
                            let _ = self.store.ack(QueueKind::Orchestrator, &token).await;
                        }
                        Err(e) => {
                            warn!(kind = item.kind(), instance = item.instance(), error = %e, "orchestrator item failed; abandoning for redelivery");
                            let _ = self.store.abandon(QueueKind::Orchestrator, &token).await;
                        }
                    },
                    None => {
                        tokio::time::sleep(Duration::from_millis(self.options.dispatcher_idle_sleep_ms)).await;
                    }
                }
            }
        })
    }

    fn start_activity_dispatcher(self: Arc<Self>, activities: Arc<ActivityRegistry>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.store.dequeue_peek_lock(QueueKind::Worker).await {
                    Some((WorkItem::ActivityExecute { instance, id, name, input }, token)) => {
                        let outcome = match activities.get(&name) {
                            Some(handler) => self.options.retry.run(&handler, &instance, &name, input).await,
                            None => Err(format!("unregistered:{name}")),
                        };
                        let completion = match outcome {
                            Ok(result) => WorkItem::ActivityCompleted {
                                instance: instance.clone(),
                                id,
                                result,
                            },
                            Err(error) => WorkItem::ActivityFailed {
                                instance: instance.clone(),
                                id,
                                error,
                            },
                        };
                        // Ack only after the completion is durably enqueued;
                        // otherwise the invocation redelivers.
                        match self.store.enqueue_work(QueueKind::Orchestrator, completion).await {
                            Ok(()) => {
                                let _ = self.store.ack(QueueKind::Worker, &token).await;
                            }
                            Err(e) => {
                                warn!(instance = %instance, id, error = %e, "worker: enqueue completion failed; not acking");
                            }
                        }
                    }
                    Some((other, token)) => {
                        error!(kind = other.kind(), "unexpected work item on worker queue; dropping");
                        let _ = self.store.ack(QueueKind::Worker, &token).await;
                    }
                    None => {
                        tokio::time::sleep(Duration::from_millis(self.options.dispatcher_idle_sleep_ms)).await;
                    }
                }
            }
        })
    }

    async fn process_orchestrator_item(self: &Arc<Self>, item: &WorkItem) -> Result<(), StoreError> {
        match item {
            WorkItem::StartWorkflow {
                instance,
                orchestration,
                input,
            } => self.process_start(instance, orchestration, input).await,
            WorkItem::ActivityCompleted { instance, id, result } => {
                self.process_completion(instance, *id, Ok(result.clone())).await
            }
            WorkItem::ActivityFailed { instance, id, error } => {
                self.process_completion(instance, *id, Err(error.clone())).await
            }
            WorkItem::SuspendInstance { instance, reason } => {
                self.process_control(
                    instance,
                    Event::SuspendRequested { reason: reason.clone() },
                    |s| matches!(s, RuntimeStatus::Running | RuntimeStatus::Pending),
                    false,
                )
                .await
            }
            WorkItem::ResumeInstance { instance } => {
                self.process_control(instance, Event::ResumeRequested, |s| matches!(s, RuntimeStatus::Suspended), true)
                    .await
            }
            WorkItem::RewindInstance { instance } => {
                self.process_control(
                    instance,
                    Event::RewindRequested,
                    |s| matches!(s, RuntimeStatus::Failed { .. }),
                    true,
                )
                .await
            }
            WorkItem::TerminateInstance { instance, reason } => {
                self.process_control(
                    instance,
                    Event::TerminateRequested { reason: reason.clone() },
                    |s| !s.is_terminal(),
                    false,
                )
                .await
            }
            WorkItem::ContinueAsNew { instance, input } => self.process_continue_as_new(instance, input).await,
            WorkItem::ActivityExecute { .. } => {
                error!(kind = item.kind(), "unexpected work item on orchestrator queue; dropping");
                Ok(())
            }
        }
    }

    async fn process_start(self: &Arc<Self>, instance: &str, orchestration: &str, input: &str) -> Result<(), StoreError> {
        match self.store.create_instance(instance).await {
            Ok(()) | Err(StoreError::InstanceExists(_)) => {}
            Err(e) => return Err(e),
        }
        loop {
            let raw = self.store.read(instance).await;
            if raw.iter().any(|e| matches!(e, Event::OrchestratorStarted { .. })) {
                let status = RuntimeStatus::fold(&raw);
                if status.is_terminal() {
                    // Clean slate: terminal instances restart as a fresh execution.
                    debug!(instance, orchestration, "restarting terminal instance as new execution");
                    self.store
                        .begin_execution(
                            instance,
                            vec![Event::OrchestratorStarted {
                                name: orchestration.to_string(),
                                input: input.to_string(),
                            }],
                        )
                        .await?;
                    break;
                }
                // Idempotent per instance id: an in-flight instance is left alone.
                debug!(instance, "duplicate start ignored");
                return Ok(());
            }
            let started = Event::OrchestratorStarted {
                name: orchestration.to_string(),
                input: input.to_string(),
            };
            match self.store.append(instance, raw.len(), vec![started]).await {
                Ok(()) => break,
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        self.run_replay_pass(instance).await
    }

    async fn process_completion(
        self: &Arc<Self>,
        instance: &str,
        id: u64,
        outcome: Result<String, String>,
    ) -> Result<(), StoreError> {
        if !self.store.contains_instance(instance).await {
            warn!(instance, id, "completion for unknown instance dropped");
            return Ok(());
        }
        loop {
            let raw = self.store.read(instance).await;
            let status = RuntimeStatus::fold(&raw);
            if status.is_terminal() {
                debug!(instance, id, status = status.name(), "completion after terminal status dropped");
                return Ok(());
            }
            let effective = effective_history(&raw);
            if !effective
                .iter()
                .any(|e| matches!(e, Event::ActivityScheduled { id: sid, .. } if *sid == id))
            {
                warn!(instance, id, "completion without matching schedule dropped");
                return Ok(());
            }
            // Effectively-once recording: one terminal event per activity id,
            // no matter how often delivery or replay repeats.
            let already_terminal = effective.iter().any(|e| {
                matches!(e, Event::ActivityCompleted { id: cid, .. } if *cid == id)
                    || matches!(e, Event::ActivityFailed { id: cid, .. } if *cid == id)
            });
            if already_terminal {
                debug!(instance, id, "duplicate completion dropped");
                return Ok(());
            }
            let ev = match &outcome {
                Ok(result) => Event::ActivityCompleted {
                    id,
                    result: result.clone(),
                },
                Err(error) => Event::ActivityFailed {
                    id,
                    error: error.clone(),
                },
            };
            match self.store.append(instance, raw.len(), vec![ev]).await {
                Ok(()) => break,
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        // A suspended instance buffers completions; replay resumes later.
        let status = RuntimeStatus::fold(&self.store.read(instance).await);
        if matches!(status, RuntimeStatus::Suspended) {
            debug!(instance, id, "instance suspended; completion parked until resume");
            return Ok(());
        }
        self.run_replay_pass(instance).await
    }

    async fn process_control(
        self: &Arc<Self>,
        instance: &str,
        event: Event,
        legal: impl Fn(&RuntimeStatus) -> bool,
        replay_after: bool,
    ) -> Result<(), StoreError> {
        if !self.store.contains_instance(instance).await {
            warn!(instance, "control command for unknown instance ignored");
            return Ok(());
        }
        loop {
            let raw = self.store.read(instance).await;
            let status = RuntimeStatus::fold(&raw);
            if !legal(&status) {
                // Recoverable no-op, never a crash.
                warn!(instance, status = status.name(), "control command not applicable; ignoring");
                return Ok(());
            }
            match self.store.append(instance, raw.len(), vec![event.clone()]).await {
                Ok(()) => break,
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        if replay_after {
            self.run_replay_pass(instance).await?;
        }
        Ok(())
    }

    async fn process_continue_as_new(self: &Arc<Self>, instance: &str, input: &str) -> Result<(), StoreError> {
        let raw = self.store.read(instance).await;
        match RuntimeStatus::fold(&raw) {
            RuntimeStatus::ContinuedAsNew { .. } => {}
            other => {
                warn!(instance, status = other.name(), "continue-as-new rollover on unexpected status; ignoring");
                return Ok(());
            }
        }
        let Some((name, _)) = descriptor(&raw) else {
            warn!(instance, "continue-as-new without started event; ignoring");
            return Ok(());
        };
        let exec = self
            .store
            .begin_execution(
                instance,
                vec![Event::OrchestratorStarted {
                    name,
                    input: input.to_string(),
                }],
            )
            .await?;
        debug!(instance, execution_id = exec, "continued as new execution");
        self.run_replay_pass(instance).await
    }

    /// One replay-and-commit pass: load history, replay the orchestrator to
    /// its next suspension point or completion, append exactly the events
    /// that forward execution produced, and hand new activity work to the
    /// dispatcher. A lost append race re-reads and retries; clients never
    /// observe the contention.
    async fn run_replay_pass(self: &Arc<Self>, instance: &str) -> Result<(), StoreError> {
        loop {
            let raw = self.store.read(instance).await;
            match RuntimeStatus::fold(&raw) {
                RuntimeStatus::Running => {}
                status => {
                    debug!(instance, status = status.name(), "replay pass skipped");
                    return Ok(());
                }
            }
            let Some((orch_name, input)) = descriptor(&raw) else {
                return Ok(());
            };

            let mut rollover_input: Option<String> = None;
            let delta: Vec<Event> = match self.orchestrations.get(&orch_name) {
                None => vec![Event::OrchestratorFailed {
                    error: format!("unregistered:{orch_name}"),
                }],
                Some(handler) => {
                    let effective = effective_history(&raw);
                    let turn: TurnResult<Result<String, String>> =
                        crate::run_turn(effective.clone(), raw.len() as u64, |ctx| {
                            let handler = handler.clone();
                            let input = input.clone();
                            async move { handler.invoke(ctx, input).await }
                        });

                    if let Some(err) = turn.nondeterminism {
                        error!(instance, error = %err, "replay diverged from recorded history");
                        vec![Event::OrchestratorFailed { error: err }]
                    } else if let Some(err) = first_unawaited_schedule(&turn.history, &turn.claimed_ids) {
                        error!(instance, error = %err, "replay diverged from recorded history");
                        vec![Event::OrchestratorFailed { error: err }]
                    } else {
                        let mut d: Vec<Event> = turn.history[effective.len()..].to_vec();
                        rollover_input = turn.actions.iter().find_map(|a| match a {
                            crate::Action::ContinueAsNew { input } => Some(input.clone()),
                            _ => None,
                        });
                        if let Some(input) = &rollover_input {
                            d.push(Event::OrchestratorContinuedAsNew { input: input.clone() });
                        } else {
                            match turn.output {
                                Some(Ok(output)) => d.push(Event::OrchestratorCompleted { output }),
                                Some(Err(error)) => d.push(Event::OrchestratorFailed { error }),
                                None => {}
                            }
                        }
                        d
                    }
                }
            };

            if !delta.is_empty() {
                match self.store.append(instance, raw.len(), delta).await {
                    Ok(()) => {}
                    Err(StoreError::Conflict { expected, actual }) => {
                        debug!(instance, expected, actual, "replay append lost the race; retrying from fresh history");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            if let Some(input) = rollover_input {
                self.store
                    .enqueue_work(
                        QueueKind::Orchestrator,
                        WorkItem::ContinueAsNew {
                            instance: instance.to_string(),
                            input,
                        },
                    )
                    .await?;
                return Ok(());
            }

            self.dispatch_unresolved(instance).await?;
            return Ok(());
        }
    }

    /// Hand every scheduled-but-unresolved activity to the worker queue.
    /// Delivery is at-least-once; the completion guard in
    /// `process_completion` keeps recording effectively-once.
    async fn dispatch_unresolved(self: &Arc<Self>, instance: &str) -> Result<(), StoreError> {
        let raw = self.store.read(instance).await;
        if !matches!(RuntimeStatus::fold(&raw), RuntimeStatus::Running) {
            return Ok(());
        }
        let effective = effective_history(&raw);
        for (id, name, input) in unresolved_activities(&effective) {
            debug!(instance, id, activity = %name, "dispatching activity");
            self.store
                .enqueue_work(
                    QueueKind::Worker,
                    WorkItem::ActivityExecute {
                        instance: instance.to_string(),
                        id,
                        name,
                        input,
                    },
                )
                .await?;
        }
        Ok(())
    }
}
