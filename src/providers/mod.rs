//! Storage collaborator boundary. The engine treats persistence as an
//! external durable key/append-log: ordered typed events per instance id
//! with full read, conditional (length-guarded) append, and two peek-lock
//! work queues that carry dispatch traffic between the client, the
//! orchestration dispatcher, and the activity dispatcher.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::Event;

/// Which work queue an item travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Starts, completions, and control commands, consumed by the
    /// orchestration dispatcher.
    Orchestrator,
    /// Activity invocations, consumed by the activity dispatcher.
    Worker,
}

/// Queue payloads. Clients only ever enqueue; dispatchers consume with
/// peek-lock and ack after the item's effects are durably committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkItem {
    StartWorkflow {
        instance: String,
        orchestration: String,
        input: String,
    },
    ActivityExecute {
        instance: String,
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        id: u64,
        error: String,
    },
    SuspendInstance {
        instance: String,
        reason: String,
    },
    ResumeInstance {
        instance: String,
    },
    RewindInstance {
        instance: String,
    },
    TerminateInstance {
        instance: String,
        reason: String,
    },
    ContinueAsNew {
        instance: String,
        input: String,
    },
}

impl WorkItem {
    /// Instance the item targets.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartWorkflow { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::SuspendInstance { instance, .. }
            | WorkItem::ResumeInstance { instance }
            | WorkItem::RewindInstance { instance }
            | WorkItem::TerminateInstance { instance, .. }
            | WorkItem::ContinueAsNew { instance, .. } => instance,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::StartWorkflow { .. } => "StartWorkflow",
            WorkItem::ActivityExecute { .. } => "ActivityExecute",
            WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
            WorkItem::ActivityFailed { .. } => "ActivityFailed",
            WorkItem::SuspendInstance { .. } => "SuspendInstance",
            WorkItem::ResumeInstance { .. } => "ResumeInstance",
            WorkItem::RewindInstance { .. } => "RewindInstance",
            WorkItem::TerminateInstance { .. } => "TerminateInstance",
            WorkItem::ContinueAsNew { .. } => "ContinueAsNew",
        }
    }
}

/// Wall-clock metadata tracked per instance for status snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub created_at_ms: u64,
    pub last_updated_at_ms: u64,
}

/// Storage abstraction for append-only orchestration history per instance.
///
/// `append` is the single optimistic-concurrency primitive: it commits only
/// when the latest execution's log still has `expected_len` events, so two
/// workers racing to advance the same instance have exactly one succeed and
/// the other re-reads and retries.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Read the full history of the latest execution for an instance.
    /// Unknown instances read as empty.
    async fn read(&self, instance: &str) -> Vec<Event>;

    /// Conditionally append events to the latest execution. Fails with
    /// [`StoreError::Conflict`] when the log length no longer matches
    /// `expected_len`; nothing is partially visible.
    async fn append(&self, instance: &str, expected_len: usize, new_events: Vec<Event>) -> Result<(), StoreError>;

    /// Create a new, empty instance. Errors if it already exists.
    async fn create_instance(&self, instance: &str) -> Result<(), StoreError>;

    async fn contains_instance(&self, instance: &str) -> bool;

    /// Enumerate known instances.
    async fn list_instances(&self) -> Vec<String>;

    /// Created/updated wall-clock times for an instance.
    async fn metadata(&self, instance: &str) -> Option<InstanceMetadata>;

    /// Latest execution id (executions start at 1). `None` for unknown
    /// instances.
    async fn latest_execution_id(&self, instance: &str) -> Option<u64>;

    /// Read the history of a specific execution.
    async fn read_execution(&self, instance: &str, execution_id: u64) -> Vec<Event>;

    /// Start a fresh execution seeded with the given events (continue-as-new
    /// or restart over a terminal instance). Returns the new execution id.
    async fn begin_execution(&self, instance: &str, seed: Vec<Event>) -> Result<u64, StoreError>;

    /// Enqueue a work item on the given queue.
    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), StoreError>;

    /// Dequeue with peek-lock: the item becomes invisible until `ack`
    /// removes it or `abandon` makes it deliverable again.
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), StoreError>;

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), StoreError>;

    /// Clear all data (test utility).
    async fn reset(&self);
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// In-memory provider for tests.
pub mod in_memory;
/// Filesystem-backed provider for local development.
pub mod fs;
