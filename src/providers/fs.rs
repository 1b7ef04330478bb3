//! Filesystem-backed provider for local development: JSONL history per
//! execution, JSONL queue files, one JSON document per entity key.
//!
//! Single-process by design — every operation serializes through one mutex,
//! which is what makes the read-modify-write cycles on queue files atomic.
//! Crash safety comes from write ordering: a fetched batch stays in its queue
//! file until the ack rewrites it, so a crash mid-turn redelivers the batch
//! (at-least-once) and the idempotent history append absorbs the repeat.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

use super::{
    append_idempotent, merge_metadata, EntityItem, EntityRecord, ExecutionMetadata, OrchestrationItem, Provider,
    ProviderError, QueuedItem, WorkItem,
};
use crate::{wall_clock_ms, EntityId, Event, INITIAL_EXECUTION_ID};

/// Entity document: durable record plus the per-key sequence counter used to
/// stamp freshly enqueued operations.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct EntityDoc {
    record: EntityRecord,
    next_seq: u64,
}

#[derive(Default)]
struct FsCore {
    locked_instances: HashSet<String>,
    locked_entities: HashSet<EntityId>,
    /// token -> (instance, queue line ids held by the batch)
    inflight_orch: HashMap<String, (String, Vec<u64>)>,
    inflight_worker: HashMap<String, u64>,
    inflight_timer: HashMap<String, u64>,
    inflight_entity: HashMap<String, (EntityId, Vec<u64>)>,
    next_queue_id: u64,
    next_token: u64,
}

impl FsCore {
    fn token(&mut self, prefix: &str) -> String {
        self.next_token += 1;
        format!("{prefix}-{}", self.next_token)
    }

    fn queue_id(&mut self) -> u64 {
        self.next_queue_id += 1;
        self.next_queue_id
    }
}

pub struct FsProvider {
    root: PathBuf,
    core: Mutex<FsCore>,
}

impl FsProvider {
    /// Open (or create) a store rooted at `root`. With `reset_on_create` any
    /// existing data under the root is removed first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let root = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&root);
        }
        let _ = std::fs::create_dir_all(root.join("instances"));
        let _ = std::fs::create_dir_all(root.join("entities"));
        let _ = std::fs::create_dir_all(root.join("queues"));

        // Resume queue ids past anything already on disk.
        let mut max_id = 0u64;
        for queue in ["orchestrator", "worker", "timer", "entity"] {
            let path = root.join("queues").join(format!("{queue}.jsonl"));
            if let Ok(data) = std::fs::read_to_string(&path) {
                for line in data.lines().filter(|l| !l.trim().is_empty()) {
                    if let Ok(q) = serde_json::from_str::<QueuedItem>(line) {
                        max_id = max_id.max(q.id);
                    }
                }
            }
        }
        Self {
            root,
            core: Mutex::new(FsCore {
                next_queue_id: max_id,
                ..FsCore::default()
            }),
        }
    }

    fn queue_path(&self, queue: &str) -> PathBuf {
        self.root.join("queues").join(format!("{queue}.jsonl"))
    }

    fn instance_dir(&self, instance: &str) -> PathBuf {
        self.root.join("instances").join(instance)
    }

    fn exec_path(&self, instance: &str, execution_id: u64) -> PathBuf {
        self.instance_dir(instance).join(format!("exec-{execution_id}.jsonl"))
    }

    fn metadata_path(&self, instance: &str) -> PathBuf {
        self.instance_dir(instance).join("metadata.json")
    }

    fn entity_path(&self, entity: &EntityId) -> PathBuf {
        self.root.join("entities").join(format!("{entity}.json"))
    }

    async fn read_queue(&self, queue: &str) -> Vec<QueuedItem> {
        let data = fs::read_to_string(self.queue_path(queue)).await.unwrap_or_default();
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<QueuedItem>(line) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!(queue, error = %e, "skipping unreadable queue line");
                    None
                }
            })
            .collect()
    }

    async fn write_queue(&self, queue: &str, items: &[QueuedItem]) -> Result<(), ProviderError> {
        let mut out = String::new();
        for item in items {
            let line = serde_json::to_string(item)
                .map_err(|e| ProviderError::permanent("write_queue", e.to_string()))?;
            out.push_str(&line);
            out.push('\n');
        }
        fs::write(self.queue_path(queue), out)
            .await
            .map_err(|e| ProviderError::retryable("write_queue", e.to_string()))
    }

    async fn push_queue(&self, queue: &str, items: Vec<QueuedItem>) -> Result<(), ProviderError> {
        let mut all = self.read_queue(queue).await;
        all.extend(items);
        self.write_queue(queue, &all).await
    }

    async fn read_exec(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        let data = fs::read_to_string(self.exec_path(instance, execution_id))
            .await
            .unwrap_or_default();
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<Event>(line).ok())
            .collect()
    }

    async fn write_exec(&self, instance: &str, execution_id: u64, events: &[Event]) -> Result<(), ProviderError> {
        fs::create_dir_all(self.instance_dir(instance))
            .await
            .map_err(|e| ProviderError::retryable("write_exec", e.to_string()))?;
        let mut out = String::new();
        for event in events {
            let line =
                serde_json::to_string(event).map_err(|e| ProviderError::permanent("write_exec", e.to_string()))?;
            out.push_str(&line);
            out.push('\n');
        }
        fs::write(self.exec_path(instance, execution_id), out)
            .await
            .map_err(|e| ProviderError::retryable("write_exec", e.to_string()))
    }

    async fn execution_count(&self, instance: &str) -> u64 {
        let mut n = 0u64;
        loop {
            if fs::try_exists(self.exec_path(instance, n + 1)).await.unwrap_or(false) {
                n += 1;
            } else {
                return n;
            }
        }
    }

    async fn read_entity_doc(&self, entity: &EntityId) -> EntityDoc {
        let data = fs::read_to_string(self.entity_path(entity)).await.unwrap_or_default();
        serde_json::from_str(&data).unwrap_or_default()
    }

    async fn write_entity_doc(&self, entity: &EntityId, doc: &EntityDoc) -> Result<(), ProviderError> {
        let data =
            serde_json::to_string_pretty(doc).map_err(|e| ProviderError::permanent("write_entity", e.to_string()))?;
        fs::write(self.entity_path(entity), data)
            .await
            .map_err(|e| ProviderError::retryable("write_entity", e.to_string()))
    }

    /// Stamp fresh entity operations with the key's next sequence numbers,
    /// persisting the counters as they advance.
    async fn assign_entity_seqs(&self, items: Vec<WorkItem>) -> Result<Vec<WorkItem>, ProviderError> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                WorkItem::EntityInvoke {
                    entity,
                    seq: 0,
                    operation,
                    input,
                    caller,
                } => {
                    let mut doc = self.read_entity_doc(&entity).await;
                    doc.next_seq += 1;
                    let seq = doc.next_seq;
                    self.write_entity_doc(&entity, &doc).await?;
                    out.push(WorkItem::EntityInvoke {
                        entity,
                        seq,
                        operation,
                        input,
                        caller,
                    });
                }
                other => out.push(other),
            }
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl Provider for FsProvider {
    async fn read(&self, instance: &str) -> Vec<Event> {
        let latest = self.execution_count(instance).await.max(1);
        self.read_exec(instance, latest).await
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        self.read_exec(instance, execution_id).await
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        if !self.instance_exists(instance).await {
            return None;
        }
        Some(self.execution_count(instance).await.max(1))
    }

    async fn list_executions(&self, instance: &str) -> Vec<u64> {
        (1..=self.execution_count(instance).await).collect()
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut out = Vec::new();
        let Ok(mut dir) = fs::read_dir(self.root.join("instances")).await else {
            return out;
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                out.push(name.to_string());
            }
        }
        out
    }

    async fn create_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let _guard = self.core.lock().await;
        if fs::try_exists(self.instance_dir(instance)).await.unwrap_or(false) {
            return Err(ProviderError::permanent(
                "create_instance",
                format!("instance already exists: {instance}"),
            ));
        }
        self.write_exec(instance, INITIAL_EXECUTION_ID, &[]).await
    }

    async fn instance_exists(&self, instance: &str) -> bool {
        fs::try_exists(self.instance_dir(instance)).await.unwrap_or(false)
    }

    async fn get_execution_metadata(&self, instance: &str) -> Option<ExecutionMetadata> {
        let data = fs::read_to_string(self.metadata_path(instance)).await.ok()?;
        serde_json::from_str(&data).ok()
    }

    async fn enqueue_orchestrator_work(&self, item: WorkItem, visible_in_ms: Option<u64>) -> Result<(), ProviderError> {
        // The guard stays held across the file rewrite: queue files are
        // read-modify-write and concurrent enqueues would lose lines.
        let mut core = self.core.lock().await;
        let queued = QueuedItem {
            id: core.queue_id(),
            visible_at_ms: wall_clock_ms() + visible_in_ms.unwrap_or(0),
            item,
        };
        self.push_queue("orchestrator", vec![queued]).await
    }

    async fn fetch_orchestration_item(&self) -> Option<OrchestrationItem> {
        let mut core = self.core.lock().await;
        let now = wall_clock_ms();
        let all = self.read_queue("orchestrator").await;
        let held: HashSet<u64> = core.inflight_orch.values().flat_map(|(_, ids)| ids.iter().copied()).collect();

        let instance = all.iter().find_map(|q| {
            if q.visible_at_ms > now || held.contains(&q.id) {
                return None;
            }
            match q.item.instance() {
                Some(i) if !core.locked_instances.contains(i) => Some(i.to_string()),
                _ => None,
            }
        })?;

        let batch: Vec<&QueuedItem> = all
            .iter()
            .filter(|q| {
                q.visible_at_ms <= now && !held.contains(&q.id) && q.item.instance() == Some(instance.as_str())
            })
            .collect();
        let ids: Vec<u64> = batch.iter().map(|q| q.id).collect();
        let messages: Vec<WorkItem> = batch.iter().map(|q| q.item.clone()).collect();

        let execution_id = self.execution_count(&instance).await.max(INITIAL_EXECUTION_ID);
        let history = self.read_exec(&instance, execution_id).await;
        let lock_token = core.token("orch");
        core.locked_instances.insert(instance.clone());
        core.inflight_orch.insert(lock_token.clone(), (instance.clone(), ids));
        Some(OrchestrationItem {
            instance,
            execution_id,
            history,
            messages,
            lock_token,
        })
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        execution_id: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        entity_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let (instance, ids) = core
            .inflight_orch
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("ack_orchestration_item", "unknown lock token"))?;

        let mut events = self.read_exec(&instance, execution_id).await;
        append_idempotent(&mut events, history_delta);
        self.write_exec(&instance, execution_id, &events).await?;

        let mut meta = self.get_execution_metadata(&instance).await.unwrap_or_default();
        merge_metadata(&mut meta, metadata);
        let data = serde_json::to_string_pretty(&meta)
            .map_err(|e| ProviderError::permanent("ack_orchestration_item", e.to_string()))?;
        fs::write(self.metadata_path(&instance), data)
            .await
            .map_err(|e| ProviderError::retryable("ack_orchestration_item", e.to_string()))?;

        let worker: Vec<QueuedItem> = worker_items
            .into_iter()
            .map(|item| QueuedItem {
                id: core.queue_id(),
                visible_at_ms: wall_clock_ms(),
                item,
            })
            .collect();
        let timer: Vec<QueuedItem> = timer_items
            .into_iter()
            .map(|item| QueuedItem {
                id: core.queue_id(),
                visible_at_ms: wall_clock_ms(),
                item,
            })
            .collect();
        let orch: Vec<QueuedItem> = orchestrator_items
            .into_iter()
            .map(|item| QueuedItem {
                id: core.queue_id(),
                visible_at_ms: wall_clock_ms(),
                item,
            })
            .collect();
        let entity_items = self.assign_entity_seqs(entity_items).await?;
        let entity: Vec<QueuedItem> = entity_items
            .into_iter()
            .map(|item| QueuedItem {
                id: core.queue_id(),
                visible_at_ms: wall_clock_ms(),
                item,
            })
            .collect();

        self.push_queue("worker", worker).await?;
        self.push_queue("timer", timer).await?;
        self.push_queue("entity", entity).await?;

        // Consume the batch and publish follow-ups in one rewrite.
        let mut all = self.read_queue("orchestrator").await;
        all.retain(|q| !ids.contains(&q.id));
        all.extend(orch);
        self.write_queue("orchestrator", &all).await?;

        core.locked_instances.remove(&instance);
        Ok(())
    }

    async fn abandon_orchestration_item(
        &self,
        lock_token: &str,
        redeliver_in_ms: Option<u64>,
    ) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let (instance, ids) = core
            .inflight_orch
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("abandon_orchestration_item", "unknown lock token"))?;
        if let Some(delay) = redeliver_in_ms {
            let visible_at = wall_clock_ms() + delay;
            let mut all = self.read_queue("orchestrator").await;
            for q in all.iter_mut() {
                if ids.contains(&q.id) {
                    q.visible_at_ms = visible_at;
                }
            }
            self.write_queue("orchestrator", &all).await?;
        }
        core.locked_instances.remove(&instance);
        Ok(())
    }

    async fn enqueue_worker_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let queued = QueuedItem {
            id: core.queue_id(),
            visible_at_ms: wall_clock_ms(),
            item,
        };
        self.push_queue("worker", vec![queued]).await
    }

    async fn dequeue_worker_peek_lock(&self) -> Option<(WorkItem, String)> {
        let mut core = self.core.lock().await;
        let all = self.read_queue("worker").await;
        let held: HashSet<u64> = core.inflight_worker.values().copied().collect();
        let next = all.iter().find(|q| !held.contains(&q.id))?;
        let token = core.token("work");
        core.inflight_worker.insert(token.clone(), next.id);
        Some((next.item.clone(), token))
    }

    async fn ack_worker(&self, token: &str) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let id = core
            .inflight_worker
            .remove(token)
            .ok_or_else(|| ProviderError::permanent("ack_worker", "unknown lock token"))?;
        let mut all = self.read_queue("worker").await;
        all.retain(|q| q.id != id);
        self.write_queue("worker", &all).await
    }

    async fn abandon_worker(&self, token: &str) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        core.inflight_worker
            .remove(token)
            .map(|_| ())
            .ok_or_else(|| ProviderError::permanent("abandon_worker", "unknown lock token"))
    }

    async fn enqueue_timer_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let queued = QueuedItem {
            id: core.queue_id(),
            visible_at_ms: wall_clock_ms(),
            item,
        };
        self.push_queue("timer", vec![queued]).await
    }

    async fn dequeue_timer_peek_lock(&self) -> Option<(WorkItem, String)> {
        let mut core = self.core.lock().await;
        let all = self.read_queue("timer").await;
        let held: HashSet<u64> = core.inflight_timer.values().copied().collect();
        let next = all.iter().find(|q| !held.contains(&q.id))?;
        let token = core.token("timer");
        core.inflight_timer.insert(token.clone(), next.id);
        Some((next.item.clone(), token))
    }

    async fn ack_timer(&self, token: &str) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let id = core
            .inflight_timer
            .remove(token)
            .ok_or_else(|| ProviderError::permanent("ack_timer", "unknown lock token"))?;
        let mut all = self.read_queue("timer").await;
        all.retain(|q| q.id != id);
        self.write_queue("timer", &all).await
    }

    async fn abandon_timer(&self, token: &str) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        core.inflight_timer
            .remove(token)
            .map(|_| ())
            .ok_or_else(|| ProviderError::permanent("abandon_timer", "unknown lock token"))
    }

    async fn enqueue_entity_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        if !matches!(item, WorkItem::EntityInvoke { .. }) {
            return Err(ProviderError::permanent(
                "enqueue_entity_work",
                format!("not an entity item: {}", item.kind()),
            ));
        }
        let mut core = self.core.lock().await;
        let items = self.assign_entity_seqs(vec![item]).await?;
        let queued: Vec<QueuedItem> = items
            .into_iter()
            .map(|item| QueuedItem {
                id: core.queue_id(),
                visible_at_ms: wall_clock_ms(),
                item,
            })
            .collect();
        self.push_queue("entity", queued).await
    }

    async fn fetch_entity_item(&self) -> Option<EntityItem> {
        let mut core = self.core.lock().await;
        let all = self.read_queue("entity").await;
        let held: HashSet<u64> = core
            .inflight_entity
            .values()
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();

        let entity = all.iter().find_map(|q| match &q.item {
            WorkItem::EntityInvoke { entity, .. }
                if !held.contains(&q.id) && !core.locked_entities.contains(entity) =>
            {
                Some(entity.clone())
            }
            _ => None,
        })?;

        let mut batch: Vec<&QueuedItem> = all
            .iter()
            .filter(|q| {
                !held.contains(&q.id)
                    && matches!(&q.item, WorkItem::EntityInvoke { entity: e, .. } if *e == entity)
            })
            .collect();
        batch.sort_by_key(|q| match &q.item {
            WorkItem::EntityInvoke { seq, .. } => *seq,
            _ => u64::MAX,
        });
        let ids: Vec<u64> = batch.iter().map(|q| q.id).collect();
        let operations: Vec<WorkItem> = batch.iter().map(|q| q.item.clone()).collect();

        let record = self.read_entity_doc(&entity).await.record;
        let lock_token = core.token("entity");
        core.locked_entities.insert(entity.clone());
        core.inflight_entity.insert(lock_token.clone(), (entity.clone(), ids));
        Some(EntityItem {
            entity,
            record,
            operations,
            lock_token,
        })
    }

    async fn ack_entity_item(
        &self,
        lock_token: &str,
        record: EntityRecord,
        orchestrator_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let (entity, ids) = core
            .inflight_entity
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("ack_entity_item", "unknown lock token"))?;

        let mut doc = self.read_entity_doc(&entity).await;
        doc.record = record;
        self.write_entity_doc(&entity, &doc).await?;

        let orch: Vec<QueuedItem> = orchestrator_items
            .into_iter()
            .map(|item| QueuedItem {
                id: core.queue_id(),
                visible_at_ms: wall_clock_ms(),
                item,
            })
            .collect();
        self.push_queue("orchestrator", orch).await?;

        let mut all = self.read_queue("entity").await;
        all.retain(|q| !ids.contains(&q.id));
        self.write_queue("entity", &all).await?;

        core.locked_entities.remove(&entity);
        Ok(())
    }

    async fn abandon_entity_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let (entity, _ids) = core
            .inflight_entity
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("abandon_entity_item", "unknown lock token"))?;
        core.locked_entities.remove(&entity);
        Ok(())
    }

    async fn read_entity(&self, entity: &EntityId) -> Option<EntityRecord> {
        if !fs::try_exists(self.entity_path(entity)).await.unwrap_or(false) {
            return None;
        }
        Some(self.read_entity_doc(entity).await.record)
    }
}
