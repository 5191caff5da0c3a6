use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::{fs, io::AsyncWriteExt};

use super::{now_ms, HistoryStore, InstanceMetadata, QueueKind, WorkItem};
use crate::error::StoreError;
use crate::Event;

/// Filesystem-backed store for local development: one JSONL file per
/// execution under the instance directory, JSONL queue files, and lock files
/// for in-flight peek-locked items.
pub struct FsHistoryStore {
    root: PathBuf,
    orch_queue_file: PathBuf,
    work_queue_file: PathBuf,
    // Serializes queue-file rewrites and guarded appends.
    io_lock: tokio::sync::Mutex<()>,
    token_seq: AtomicU64,
    cap: usize,
}

impl FsHistoryStore {
    /// Create a store rooted at the given directory. If `reset_on_create` is
    /// true, any existing data under the root is deleted first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        let orch_q = path.join("orch-queue.jsonl");
        let work_q = path.join("work-queue.jsonl");
        let _ = std::fs::create_dir_all(path.join("instances"));
        let _ = std::fs::create_dir_all(path.join(".locks/orch"));
        let _ = std::fs::create_dir_all(path.join(".locks/work"));
        let _ = std::fs::OpenOptions::new().create(true).append(true).open(&orch_q);
        let _ = std::fs::OpenOptions::new().create(true).append(true).open(&work_q);
        // Items peek-locked by a previous host that died before ack would
        // otherwise stay invisible forever; give them back to the queue.
        Self::recover_locked_items(&path.join(".locks/orch"), &orch_q);
        Self::recover_locked_items(&path.join(".locks/work"), &work_q);
        Self {
            root: path,
            orch_queue_file: orch_q,
            work_queue_file: work_q,
            io_lock: tokio::sync::Mutex::new(()),
            token_seq: AtomicU64::new(1),
            cap: 4096,
        }
    }

    fn recover_locked_items(lock_dir: &Path, queue_file: &Path) {
        let Ok(entries) = std::fs::read_dir(lock_dir) else { return };
        for entry in entries.flatten() {
            let Ok(line) = std::fs::read_to_string(entry.path()) else { continue };
            if !line.trim().is_empty() {
                if let Ok(mut f) = std::fs::OpenOptions::new().append(true).open(queue_file) {
                    use std::io::Write;
                    let _ = writeln!(f, "{}", line.trim());
                }
            }
            let _ = std::fs::remove_file(entry.path());
        }
    }

    fn inst_root(&self, instance: &str) -> PathBuf {
        self.root.join("instances").join(instance)
    }

    fn exec_path(&self, instance: &str, execution_id: u64) -> PathBuf {
        self.inst_root(instance).join(format!("{execution_id}.jsonl"))
    }

    fn meta_path(&self, instance: &str) -> PathBuf {
        self.inst_root(instance).join("meta.json")
    }

    fn queue_file(&self, kind: QueueKind) -> &PathBuf {
        match kind {
            QueueKind::Orchestrator => &self.orch_queue_file,
            QueueKind::Worker => &self.work_queue_file,
        }
    }

    fn lock_path(&self, kind: QueueKind, token: &str) -> PathBuf {
        let dir = match kind {
            QueueKind::Orchestrator => ".locks/orch",
            QueueKind::Worker => ".locks/work",
        };
        self.root.join(dir).join(format!("{token}.lock"))
    }

    async fn read_events(&self, path: &Path) -> Vec<Event> {
        let data = fs::read_to_string(path).await.unwrap_or_default();
        let mut out = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(ev) = serde_json::from_str::<Event>(line) {
                out.push(ev);
            }
        }
        out
    }

    async fn read_queue(&self, kind: QueueKind) -> Vec<WorkItem> {
        let data = fs::read_to_string(self.queue_file(kind)).await.unwrap_or_default();
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<WorkItem>(l).ok())
            .collect()
    }

    async fn write_queue(&self, kind: QueueKind, items: &[WorkItem]) -> Result<(), StoreError> {
        let mut buf = String::new();
        for item in items {
            let line = serde_json::to_string(item).map_err(|e| StoreError::Io(e.to_string()))?;
            buf.push_str(&line);
            buf.push('\n');
        }
        fs::write(self.queue_file(kind), buf)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    async fn write_meta(&self, instance: &str, meta: &InstanceMetadata) -> Result<(), StoreError> {
        let data = serde_json::to_string(meta).map_err(|e| StoreError::Io(e.to_string()))?;
        fs::write(self.meta_path(instance), data)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    async fn read_meta(&self, instance: &str) -> Option<InstanceMetadata> {
        let data = fs::read_to_string(self.meta_path(instance)).await.ok()?;
        serde_json::from_str(&data).ok()
    }

    async fn latest_exec(&self, instance: &str) -> Option<u64> {
        let mut latest = None;
        let mut rd = fs::read_dir(self.inst_root(instance)).await.ok()?;
        while let Ok(Some(entry)) = rd.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".jsonl") {
                if let Ok(n) = stem.parse::<u64>() {
                    latest = Some(latest.map_or(n, |m: u64| m.max(n)));
                }
            }
        }
        latest
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        match self.latest_exec(instance).await {
            Some(id) => self.read_events(&self.exec_path(instance, id)).await,
            None => Vec::new(),
        }
    }

    async fn append(&self, instance: &str, expected_len: usize, new_events: Vec<Event>) -> Result<(), StoreError> {
        let _g = self.io_lock.lock().await;
        let exec_id = self
            .latest_exec(instance)
            .await
            .ok_or_else(|| StoreError::InstanceNotFound(instance.to_string()))?;
        let path = self.exec_path(instance, exec_id);
        let existing = self.read_events(&path).await;
        if existing.len() != expected_len {
            return Err(StoreError::Conflict {
                expected: expected_len,
                actual: existing.len(),
            });
        }
        if existing.len() + new_events.len() > self.cap {
            return Err(StoreError::Io(format!(
                "history cap exceeded (cap={}, have={}, append={})",
                self.cap,
                existing.len(),
                new_events.len()
            )));
        }
        // One buffered write per append so the batch lands whole.
        let mut buf = String::new();
        for ev in &new_events {
            let line = serde_json::to_string(ev).map_err(|e| StoreError::Io(e.to_string()))?;
            buf.push_str(&line);
            buf.push('\n');
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        file.flush().await.map_err(|e| StoreError::Io(e.to_string()))?;
        let mut meta = self.read_meta(instance).await.unwrap_or_default();
        meta.last_updated_at_ms = now_ms();
        self.write_meta(instance, &meta).await
    }

    async fn create_instance(&self, instance: &str) -> Result<(), StoreError> {
        let _g = self.io_lock.lock().await;
        let dir = self.inst_root(instance);
        if fs::try_exists(&dir).await.map_err(|e| StoreError::Io(e.to_string()))? {
            return Err(StoreError::InstanceExists(instance.to_string()));
        }
        fs::create_dir_all(&dir).await.map_err(|e| StoreError::Io(e.to_string()))?;
        fs::write(self.exec_path(instance, 1), "")
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let now = now_ms();
        self.write_meta(
            instance,
            &InstanceMetadata {
                created_at_ms: now,
                last_updated_at_ms: now,
            },
        )
        .await
    }

    async fn contains_instance(&self, instance: &str) -> bool {
        fs::try_exists(self.inst_root(instance)).await.unwrap_or(false)
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(mut rd) = fs::read_dir(self.root.join("instances")).await {
            while let Ok(Some(entry)) = rd.next_entry().await {
                out.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        out
    }

    async fn metadata(&self, instance: &str) -> Option<InstanceMetadata> {
        self.read_meta(instance).await
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        self.latest_exec(instance).await
    }

    async fn read_execution(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        self.read_events(&self.exec_path(instance, execution_id)).await
    }

    async fn begin_execution(&self, instance: &str, seed: Vec<Event>) -> Result<u64, StoreError> {
        let _g = self.io_lock.lock().await;
        let next = self
            .latest_exec(instance)
            .await
            .ok_or_else(|| StoreError::InstanceNotFound(instance.to_string()))?
            + 1;
        let mut buf = String::new();
        for ev in &seed {
            let line = serde_json::to_string(ev).map_err(|e| StoreError::Io(e.to_string()))?;
            buf.push_str(&line);
            buf.push('\n');
        }
        fs::write(self.exec_path(instance, next), buf)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let mut meta = self.read_meta(instance).await.unwrap_or_default();
        meta.last_updated_at_ms = now_ms();
        self.write_meta(instance, &meta).await?;
        Ok(next)
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), StoreError> {
        let _g = self.io_lock.lock().await;
        let line = serde_json::to_string(&item).map_err(|e| StoreError::Io(e.to_string()))?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.queue_file(kind))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        file.flush().await.map_err(|e| StoreError::Io(e.to_string()))
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let _g = self.io_lock.lock().await;
        let mut items = self.read_queue(kind).await;
        if items.is_empty() {
            return None;
        }
        let item = items.remove(0);
        self.write_queue(kind, &items).await.ok()?;
        let token = format!("t{}", self.token_seq.fetch_add(1, Ordering::Relaxed));
        let line = serde_json::to_string(&item).ok()?;
        fs::write(self.lock_path(kind, &token), line).await.ok()?;
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        let _ = fs::remove_file(self.lock_path(kind, token)).await;
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), StoreError> {
        let _g = self.io_lock.lock().await;
        let lock = self.lock_path(kind, token);
        let data = match fs::read_to_string(&lock).await {
            Ok(d) => d,
            Err(_) => return Ok(()),
        };
        let item: WorkItem = serde_json::from_str(&data).map_err(|e| StoreError::Io(e.to_string()))?;
        let mut items = self.read_queue(kind).await;
        items.insert(0, item);
        self.write_queue(kind, &items).await?;
        let _ = fs::remove_file(&lock).await;
        Ok(())
    }

    async fn reset(&self) {
        let _g = self.io_lock.lock().await;
        let _ = fs::remove_dir_all(&self.root).await;
        let _ = fs::create_dir_all(self.root.join("instances")).await;
        let _ = fs::create_dir_all(self.root.join(".locks/orch")).await;
        let _ = fs::create_dir_all(self.root.join(".locks/work")).await;
        let _ = fs::write(&self.orch_queue_file, "").await;
        let _ = fs::write(&self.work_queue_file, "").await;
    }
}
