//! Control-plane client. Communicates with the runtime exclusively through
//! the shared history store: control APIs enqueue work items, status APIs
//! fold the instance's history. Also hosts the submit-or-check protocol that
//! makes external submissions idempotent per request id.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ClientError, WaitError};
use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::runtime::RuntimeStatus;

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Client-facing view of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub instance_id: String,
    pub runtime_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at_ms: u64,
    pub last_updated_at_ms: u64,
}

/// Tuning for [`Client::submit_or_check`].
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// How long the caller blocks waiting for a terminal status.
    pub wait_timeout: Duration,
    /// How long to wait for a recovery command (rewind/resume/restart) to be
    /// reflected in status before entering the main wait.
    pub recovery_grace: Duration,
    /// Suspend the instance when the wait window elapses non-terminal. The
    /// reference behavior suspends even `Pending` instances; hosts that find
    /// that too eager can turn this off.
    pub suspend_on_timeout: bool,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(25),
            recovery_grace: Duration::from_secs(2),
            suspend_on_timeout: true,
        }
    }
}

/// Outcome of a submit-or-check round.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The instance completed inside the wait window; carries its output.
    Completed(String),
    /// Still in flight (or otherwise not completed); carries the snapshot
    /// the caller can poll against.
    Pending(StatusSnapshot),
}

/// Thin client bound to a shared [`HistoryStore`].
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn HistoryStore>,
}

impl Client {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Start a workflow instance with string input. Starting an instance
    /// that already exists is a no-op at the runtime.
    pub async fn start_workflow(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        let item = WorkItem::StartWorkflow {
            instance: instance.to_string(),
            orchestration: orchestration.to_string(),
            input: input.into(),
        };
        self.store.enqueue_work(QueueKind::Orchestrator, item).await?;
        Ok(())
    }

    /// Start a workflow with typed input (serialized to JSON).
    pub async fn start_workflow_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: &In,
    ) -> Result<(), ClientError> {
        let payload = crate::codec::encode(input).map_err(ClientError::Encode)?;
        self.start_workflow(instance, orchestration, payload).await
    }

    /// Request suspension of a running instance.
    pub async fn suspend(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        let item = WorkItem::SuspendInstance {
            instance: instance.to_string(),
            reason: reason.into(),
        };
        self.store.enqueue_work(QueueKind::Orchestrator, item).await?;
        Ok(())
    }

    /// Request resumption of a suspended instance.
    pub async fn resume(&self, instance: &str) -> Result<(), ClientError> {
        let item = WorkItem::ResumeInstance {
            instance: instance.to_string(),
        };
        self.store.enqueue_work(QueueKind::Orchestrator, item).await?;
        Ok(())
    }

    /// Request a rewind: re-drive a failed instance from its last successful
    /// step. Control-plane recovery, distinct from dispatcher retry.
    pub async fn rewind(&self, instance: &str) -> Result<(), ClientError> {
        let item = WorkItem::RewindInstance {
            instance: instance.to_string(),
        };
        self.store.enqueue_work(QueueKind::Orchestrator, item).await?;
        Ok(())
    }

    /// Request unconditional termination of a non-terminal instance.
    pub async fn terminate(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        let item = WorkItem::TerminateInstance {
            instance: instance.to_string(),
            reason: reason.into(),
        };
        self.store.enqueue_work(QueueKind::Orchestrator, item).await?;
        Ok(())
    }

    /// Current status, derived from history.
    pub async fn status(&self, instance: &str) -> RuntimeStatus {
        if !self.store.contains_instance(instance).await {
            return RuntimeStatus::NotFound;
        }
        RuntimeStatus::fold(&self.store.read(instance).await)
    }

    /// Output of a completed instance, if any.
    pub async fn output(&self, instance: &str) -> Option<String> {
        match self.status(instance).await {
            RuntimeStatus::Completed { output } => Some(output),
            _ => None,
        }
    }

    /// Status snapshot including provider-tracked timestamps.
    pub async fn snapshot(&self, instance: &str) -> StatusSnapshot {
        let status = self.status(instance).await;
        let meta = self.store.metadata(instance).await.unwrap_or_default();
        let (output, error) = match &status {
            RuntimeStatus::Completed { output } => (Some(output.clone()), None),
            RuntimeStatus::Failed { error } => (None, Some(error.clone())),
            _ => (None, None),
        };
        StatusSnapshot {
            instance_id: instance.to_string(),
            runtime_status: status.name().to_string(),
            output,
            error,
            created_at_ms: meta.created_at_ms,
            last_updated_at_ms: meta.last_updated_at_ms,
        }
    }

    /// Block until the instance reaches a terminal status, up to `timeout`.
    pub async fn wait_for_terminal(&self, instance: &str, timeout: Duration) -> Result<RuntimeStatus, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status(instance).await;
            if status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
    }

    // Poll until `done` holds or the grace window elapses.
    async fn wait_until(&self, instance: &str, grace: Duration, done: impl Fn(&RuntimeStatus) -> bool) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if done(&self.status(instance).await) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
    }

    /// Submit-or-check: drive the instance identified by `request_id`
    /// through recovery (rewind a failure, resume a suspension, start a
    /// fresh or clean-slate instance), then block up to the configured wait
    /// window for completion. On timeout the instance is explicitly
    /// suspended rather than left running unobserved, and the current status
    /// snapshot is returned instead of output. Repeated submissions against
    /// the same id converge on one instance instead of creating duplicates.
    pub async fn submit_or_check(
        &self,
        request_id: &str,
        orchestration: &str,
        input: impl Into<String>,
        options: &SubmitOptions,
    ) -> Result<SubmitOutcome, ClientError> {
        let status = self.status(request_id).await;
        match &status {
            RuntimeStatus::Failed { .. } => {
                info!(instance = request_id, "submission found failed instance; rewinding");
                self.rewind(request_id).await?;
                self.wait_until(request_id, options.recovery_grace, |s| {
                    !matches!(s, RuntimeStatus::Failed { .. })
                })
                .await;
            }
            RuntimeStatus::Suspended => {
                info!(instance = request_id, "submission found suspended instance; resuming");
                self.resume(request_id).await?;
                self.wait_until(request_id, options.recovery_grace, |s| {
                    !matches!(s, RuntimeStatus::Suspended)
                })
                .await;
            }
            RuntimeStatus::NotFound => {
                info!(instance = request_id, orchestration, "starting new instance");
                self.start_workflow(request_id, orchestration, input).await?;
            }
            RuntimeStatus::Completed { .. } | RuntimeStatus::Terminated => {
                // Clean slate: restart as a fresh execution of the same id.
                info!(instance = request_id, orchestration, "restarting terminal instance");
                let prev_exec = self.store.latest_execution_id(request_id).await.unwrap_or(0);
                self.start_workflow(request_id, orchestration, input).await?;
                let deadline = tokio::time::Instant::now() + options.recovery_grace;
                while self.store.latest_execution_id(request_id).await.unwrap_or(0) <= prev_exec
                    && tokio::time::Instant::now() < deadline
                {
                    tokio::time::sleep(STATUS_POLL_INTERVAL).await;
                }
            }
            RuntimeStatus::Pending | RuntimeStatus::Running | RuntimeStatus::ContinuedAsNew { .. } => {
                // Already in flight: just re-enter the wait.
            }
        }

        let _ = self.wait_for_terminal(request_id, options.wait_timeout).await;
        let status = self.status(request_id).await;
        if let RuntimeStatus::Completed { output } = status {
            return Ok(SubmitOutcome::Completed(output));
        }
        if options.suspend_on_timeout && !status.is_terminal() && !matches!(status, RuntimeStatus::NotFound) {
            info!(instance = request_id, status = status.name(), "wait window elapsed; suspending instance");
            self.suspend(request_id, "Timeout").await?;
            self.wait_until(request_id, options.recovery_grace, |s| {
                matches!(s, RuntimeStatus::Suspended) || s.is_terminal()
            })
            .await;
            // The instance may have completed while the suspend was in flight.
            if let RuntimeStatus::Completed { output } = self.status(request_id).await {
                return Ok(SubmitOutcome::Completed(output));
            }
        }
        Ok(SubmitOutcome::Pending(self.snapshot(request_id).await))
    }
}
