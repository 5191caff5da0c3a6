use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use super::{now_ms, HistoryStore, InstanceMetadata, QueueKind, WorkItem};
use crate::error::StoreError;
use crate::Event;

const CAP: usize = 4096;

#[derive(Debug, Default)]
struct InstanceState {
    // Multi-execution: execution ids start at 1.
    executions: Vec<Vec<Event>>,
    meta: InstanceMetadata,
}

/// In-memory history store with peek-lock queues, used by tests and as the
/// default store for `Runtime::start`.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: Mutex<HashMap<String, InstanceState>>,
    orchestrator_q: Mutex<VecDeque<WorkItem>>,
    worker_q: Mutex<VecDeque<WorkItem>>,
    // Peek-lock state: token -> item, invisible until ack/abandon.
    invisible_orchestrator: Mutex<HashMap<String, WorkItem>>,
    invisible_worker: Mutex<HashMap<String, WorkItem>>,
    token_seq: AtomicU64,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, kind: QueueKind) -> &Mutex<VecDeque<WorkItem>> {
        match kind {
            QueueKind::Orchestrator => &self.orchestrator_q,
            QueueKind::Worker => &self.worker_q,
        }
    }

    fn invisible(&self, kind: QueueKind) -> &Mutex<HashMap<String, WorkItem>> {
        match kind {
            QueueKind::Orchestrator => &self.invisible_orchestrator,
            QueueKind::Worker => &self.invisible_worker,
        }
    }

    fn next_token(&self, kind: QueueKind) -> String {
        let prefix = match kind {
            QueueKind::Orchestrator => "o",
            QueueKind::Worker => "w",
        };
        format!("{}:{}", prefix, self.token_seq.fetch_add(1, Ordering::Relaxed))
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        let g = self.inner.lock().await;
        match g.get(instance) {
            Some(state) => state.executions.last().cloned().unwrap_or_default(),
            None => Vec::new(),
        }
    }

    async fn append(&self, instance: &str, expected_len: usize, new_events: Vec<Event>) -> Result<(), StoreError> {
        let mut g = self.inner.lock().await;
        let state = g
            .get_mut(instance)
            .ok_or_else(|| StoreError::InstanceNotFound(instance.to_string()))?;
        let cur = state
            .executions
            .last_mut()
            .ok_or_else(|| StoreError::InstanceNotFound(instance.to_string()))?;
        if cur.len() != expected_len {
            return Err(StoreError::Conflict {
                expected: expected_len,
                actual: cur.len(),
            });
        }
        if cur.len() + new_events.len() > CAP {
            return Err(StoreError::Io(format!(
                "history cap exceeded (cap={}, have={}, append={})",
                CAP,
                cur.len(),
                new_events.len()
            )));
        }
        cur.extend(new_events);
        state.meta.last_updated_at_ms = now_ms();
        Ok(())
    }

    async fn create_instance(&self, instance: &str) -> Result<(), StoreError> {
        let mut g = self.inner.lock().await;
        if g.contains_key(instance) {
            return Err(StoreError::InstanceExists(instance.to_string()));
        }
        let now = now_ms();
        g.insert(
            instance.to_string(),
            InstanceState {
                executions: vec![Vec::new()],
                meta: InstanceMetadata {
                    created_at_ms: now,
                    last_updated_at_ms: now,
                },
            },
        );
        Ok(())
    }

    async fn contains_instance(&self, instance: &str) -> bool {
        self.inner.lock().await.contains_key(instance)
    }

    async fn list_instances(&self) -> Vec<String> {
        self.inner.lock().await.keys().cloned().collect()
    }

    async fn metadata(&self, instance: &str) -> Option<InstanceMetadata> {
        self.inner.lock().await.get(instance).map(|s| s.meta)
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let g = self.inner.lock().await;
        g.get(instance).map(|s| s.executions.len() as u64)
    }

    async fn read_execution(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        let g = self.inner.lock().await;
        match g.get(instance) {
            Some(s) => s
                .executions
                .get(execution_id.saturating_sub(1) as usize)
                .cloned()
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    async fn begin_execution(&self, instance: &str, seed: Vec<Event>) -> Result<u64, StoreError> {
        let mut g = self.inner.lock().await;
        let state = g
            .get_mut(instance)
            .ok_or_else(|| StoreError::InstanceNotFound(instance.to_string()))?;
        state.executions.push(seed);
        state.meta.last_updated_at_ms = now_ms();
        Ok(state.executions.len() as u64)
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), StoreError> {
        let mut q = self.queue(kind).lock().await;
        if !q.contains(&item) {
            q.push_back(item);
        }
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let item = self.queue(kind).lock().await.pop_front()?;
        let token = self.next_token(kind);
        self.invisible(kind).lock().await.insert(token.clone(), item.clone());
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        self.invisible(kind).lock().await.remove(token);
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        if let Some(item) = self.invisible(kind).lock().await.remove(token) {
            self.queue(kind).lock().await.push_front(item);
        }
        Ok(())
    }

    async fn reset(&self) {
        self.inner.lock().await.clear();
        self.orchestrator_q.lock().await.clear();
        self.worker_q.lock().await.clear();
        self.invisible_orchestrator.lock().await.clear();
        self.invisible_worker.lock().await.clear();
    }
}
