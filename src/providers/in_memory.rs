//! In-memory provider: one mutex around the whole store, which makes every
//! ack trivially atomic. Used by tests and samples; also the reference
//! semantics the filesystem provider mirrors.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::Mutex;

use super::{
    append_idempotent, merge_metadata, EntityItem, EntityRecord, ExecutionMetadata, OrchestrationItem, Provider,
    ProviderError, QueuedItem as Queued, WorkItem,
};
use crate::{wall_clock_ms, EntityId, Event, INITIAL_EXECUTION_ID};

#[derive(Default)]
struct Core {
    /// instance -> executions (execution_id 1 is index 0).
    instances: HashMap<String, Vec<Vec<Event>>>,
    metadata: HashMap<String, ExecutionMetadata>,
    orchestrator_q: VecDeque<Queued>,
    worker_q: VecDeque<Queued>,
    timer_q: VecDeque<Queued>,
    entity_q: VecDeque<Queued>,
    entities: HashMap<EntityId, EntityRecord>,
    entity_seqs: HashMap<EntityId, u64>,
    locked_instances: HashSet<String>,
    locked_entities: HashSet<EntityId>,
    inflight_orch: HashMap<String, (String, Vec<Queued>)>,
    inflight_worker: HashMap<String, Queued>,
    inflight_timer: HashMap<String, Queued>,
    inflight_entity: HashMap<String, (EntityId, Vec<Queued>)>,
    next_queue_id: u64,
    next_token: u64,
}

impl Core {
    fn queued(&mut self, item: WorkItem, visible_in_ms: Option<u64>) -> Queued {
        self.next_queue_id += 1;
        Queued {
            id: self.next_queue_id,
            visible_at_ms: wall_clock_ms() + visible_in_ms.unwrap_or(0),
            item,
        }
    }

    fn token(&mut self, prefix: &str) -> String {
        self.next_token += 1;
        format!("{prefix}-{}", self.next_token)
    }

    fn assign_entity_seq(&mut self, item: WorkItem) -> WorkItem {
        match item {
            WorkItem::EntityInvoke {
                entity,
                seq: 0,
                operation,
                input,
                caller,
            } => {
                let next = self.entity_seqs.entry(entity.clone()).or_insert(0);
                *next += 1;
                WorkItem::EntityInvoke {
                    entity,
                    seq: *next,
                    operation,
                    input,
                    caller,
                }
            }
            other => other,
        }
    }
}

#[derive(Default)]
pub struct InMemoryProvider {
    core: Mutex<Core>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    async fn read(&self, instance: &str) -> Vec<Event> {
        let core = self.core.lock().await;
        core.instances
            .get(instance)
            .and_then(|execs| execs.last().cloned())
            .unwrap_or_default()
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        let core = self.core.lock().await;
        core.instances
            .get(instance)
            .and_then(|execs| execs.get(execution_id.saturating_sub(1) as usize).cloned())
            .unwrap_or_default()
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let core = self.core.lock().await;
        core.instances.get(instance).map(|execs| execs.len() as u64)
    }

    async fn list_executions(&self, instance: &str) -> Vec<u64> {
        let core = self.core.lock().await;
        match core.instances.get(instance) {
            Some(execs) if !execs.is_empty() => (1..=execs.len() as u64).collect(),
            _ => Vec::new(),
        }
    }

    async fn list_instances(&self) -> Vec<String> {
        let core = self.core.lock().await;
        core.instances.keys().cloned().collect()
    }

    async fn create_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        if core.instances.contains_key(instance) {
            return Err(ProviderError::permanent(
                "create_instance",
                format!("instance already exists: {instance}"),
            ));
        }
        core.instances.insert(instance.to_string(), vec![Vec::new()]);
        Ok(())
    }

    async fn instance_exists(&self, instance: &str) -> bool {
        let core = self.core.lock().await;
        core.instances.contains_key(instance)
    }

    async fn get_execution_metadata(&self, instance: &str) -> Option<ExecutionMetadata> {
        let core = self.core.lock().await;
        core.metadata.get(instance).cloned()
    }

    async fn enqueue_orchestrator_work(&self, item: WorkItem, visible_in_ms: Option<u64>) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let queued = core.queued(item, visible_in_ms);
        core.orchestrator_q.push_back(queued);
        Ok(())
    }

    async fn fetch_orchestration_item(&self) -> Option<OrchestrationItem> {
        let mut core = self.core.lock().await;
        let now = wall_clock_ms();
        let instance = core
            .orchestrator_q
            .iter()
            .find(|q| {
                q.visible_at_ms <= now
                    && q.item
                        .instance()
                        .map_or(false, |i| !core.locked_instances.contains(i))
            })
            .and_then(|q| q.item.instance().map(str::to_string))?;

        let mut batch = Vec::new();
        let mut rest = VecDeque::new();
        while let Some(q) = core.orchestrator_q.pop_front() {
            if q.visible_at_ms <= now && q.item.instance() == Some(instance.as_str()) {
                batch.push(q);
            } else {
                rest.push_back(q);
            }
        }
        core.orchestrator_q = rest;

        let history = core
            .instances
            .get(&instance)
            .and_then(|execs| execs.last().cloned())
            .unwrap_or_default();
        let execution_id = core
            .instances
            .get(&instance)
            .map(|execs| execs.len() as u64)
            .filter(|n| *n > 0)
            .unwrap_or(INITIAL_EXECUTION_ID);
        let messages = batch.iter().map(|q| q.item.clone()).collect();
        let lock_token = core.token("orch");
        core.locked_instances.insert(instance.clone());
        core.inflight_orch.insert(lock_token.clone(), (instance.clone(), batch));
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
        let (instance, _batch) = core
            .inflight_orch
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("ack_orchestration_item", "unknown lock token"))?;

        let execs = core.instances.entry(instance.clone()).or_default();
        while (execs.len() as u64) < execution_id {
            execs.push(Vec::new());
        }
        append_idempotent(&mut execs[execution_id.saturating_sub(1) as usize], history_delta);

        let entry = core.metadata.entry(instance.clone()).or_default();
        merge_metadata(entry, metadata);

        for item in worker_items {
            let queued = core.queued(item, None);
            core.worker_q.push_back(queued);
        }
        for item in timer_items {
            let queued = core.queued(item, None);
            core.timer_q.push_back(queued);
        }
        for item in orchestrator_items {
            let queued = core.queued(item, None);
            core.orchestrator_q.push_back(queued);
        }
        for item in entity_items {
            let item = core.assign_entity_seq(item);
            let queued = core.queued(item, None);
            core.entity_q.push_back(queued);
        }

        core.locked_instances.remove(&instance);
        Ok(())
    }

    async fn abandon_orchestration_item(
        &self,
        lock_token: &str,
        redeliver_in_ms: Option<u64>,
    ) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let (instance, batch) = core
            .inflight_orch
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("abandon_orchestration_item", "unknown lock token"))?;
        let visible_at_ms = wall_clock_ms() + redeliver_in_ms.unwrap_or(0);
        for mut q in batch.into_iter().rev() {
            q.visible_at_ms = visible_at_ms;
            core.orchestrator_q.push_front(q);
        }
        core.locked_instances.remove(&instance);
        Ok(())
    }

    async fn enqueue_worker_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let queued = core.queued(item, None);
        core.worker_q.push_back(queued);
        Ok(())
    }

    async fn dequeue_worker_peek_lock(&self) -> Option<(WorkItem, String)> {
        let mut core = self.core.lock().await;
        let queued = core.worker_q.pop_front()?;
        let token = core.token("work");
        let item = queued.item.clone();
        core.inflight_worker.insert(token.clone(), queued);
        Some((item, token))
    }

    async fn ack_worker(&self, token: &str) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        core.inflight_worker
            .remove(token)
            .map(|_| ())
            .ok_or_else(|| ProviderError::permanent("ack_worker", "unknown lock token"))
    }

    async fn abandon_worker(&self, token: &str) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let queued = core
            .inflight_worker
            .remove(token)
            .ok_or_else(|| ProviderError::permanent("abandon_worker", "unknown lock token"))?;
        core.worker_q.push_front(queued);
        Ok(())
    }

    async fn enqueue_timer_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let queued = core.queued(item, None);
        core.timer_q.push_back(queued);
        Ok(())
    }

    async fn dequeue_timer_peek_lock(&self) -> Option<(WorkItem, String)> {
        let mut core = self.core.lock().await;
        let queued = core.timer_q.pop_front()?;
        let token = core.token("timer");
        let item = queued.item.clone();
        core.inflight_timer.insert(token.clone(), queued);
        Some((item, token))
    }

    async fn ack_timer(&self, token: &str) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        core.inflight_timer
            .remove(token)
            .map(|_| ())
            .ok_or_else(|| ProviderError::permanent("ack_timer", "unknown lock token"))
    }

    async fn abandon_timer(&self, token: &str) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let queued = core
            .inflight_timer
            .remove(token)
            .ok_or_else(|| ProviderError::permanent("abandon_timer", "unknown lock token"))?;
        core.timer_q.push_front(queued);
        Ok(())
    }

    fn supports_delayed_visibility(&self) -> bool {
        true
    }

    async fn enqueue_entity_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        if !matches!(item, WorkItem::EntityInvoke { .. }) {
            return Err(ProviderError::permanent(
                "enqueue_entity_work",
                format!("not an entity item: {}", item.kind()),
            ));
        }
        let mut core = self.core.lock().await;
        let item = core.assign_entity_seq(item);
        let queued = core.queued(item, None);
        core.entity_q.push_back(queued);
        Ok(())
    }

    async fn fetch_entity_item(&self) -> Option<EntityItem> {
        let mut core = self.core.lock().await;
        let entity = core
            .entity_q
            .iter()
            .find_map(|q| match &q.item {
                WorkItem::EntityInvoke { entity, .. } if !core.locked_entities.contains(entity) => {
                    Some(entity.clone())
                }
                _ => None,
            })?;

        let mut batch = Vec::new();
        let mut rest = VecDeque::new();
        while let Some(q) = core.entity_q.pop_front() {
            match &q.item {
                WorkItem::EntityInvoke { entity: e, .. } if *e == entity => batch.push(q),
                _ => rest.push_back(q),
            }
        }
        core.entity_q = rest;
        batch.sort_by_key(|q| match &q.item {
            WorkItem::EntityInvoke { seq, .. } => *seq,
            _ => u64::MAX,
        });

        let record = core.entities.get(&entity).cloned().unwrap_or_default();
        let operations = batch.iter().map(|q| q.item.clone()).collect();
        let lock_token = core.token("entity");
        core.locked_entities.insert(entity.clone());
        core.inflight_entity.insert(lock_token.clone(), (entity.clone(), batch));
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
        let (entity, _batch) = core
            .inflight_entity
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("ack_entity_item", "unknown lock token"))?;
        core.entities.insert(entity.clone(), record);
        for item in orchestrator_items {
            let queued = core.queued(item, None);
            core.orchestrator_q.push_back(queued);
        }
        core.locked_entities.remove(&entity);
        Ok(())
    }

    async fn abandon_entity_item(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut core = self.core.lock().await;
        let (entity, batch) = core
            .inflight_entity
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("abandon_entity_item", "unknown lock token"))?;
        for q in batch.into_iter().rev() {
            core.entity_q.push_front(q);
        }
        core.locked_entities.remove(&entity);
        Ok(())
    }

    async fn read_entity(&self, entity: &EntityId) -> Option<EntityRecord> {
        let core = self.core.lock().await;
        core.entities.get(entity).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(id: u64) -> Event {
        Event::ActivityCompleted {
            event_id: 10,
            source_event_id: id,
            result: "r".into(),
        }
    }

    #[tokio::test]
    async fn duplicate_completions_are_dropped_on_append() {
        let p = InMemoryProvider::new();
        p.create_instance("i1").await.unwrap();
        p.enqueue_orchestrator_work(
            WorkItem::ExternalRaised {
                instance: "i1".into(),
                name: "go".into(),
                data: "d".into(),
            },
            None,
        )
        .await
        .unwrap();
        let item = p.fetch_orchestration_item().await.unwrap();
        p.ack_orchestration_item(
            &item.lock_token,
            1,
            vec![completion(5), completion(5)],
            vec![],
            vec![],
            vec![],
            vec![],
            ExecutionMetadata::default(),
        )
        .await
        .unwrap();
        assert_eq!(p.read("i1").await.len(), 1);
    }

    #[tokio::test]
    async fn locked_instance_is_not_fetched_twice() {
        let p = InMemoryProvider::new();
        p.create_instance("i1").await.unwrap();
        for _ in 0..2 {
            p.enqueue_orchestrator_work(
                WorkItem::ExternalRaised {
                    instance: "i1".into(),
                    name: "e".into(),
                    data: String::new(),
                },
                None,
            )
            .await
            .unwrap();
        }
        let first = p.fetch_orchestration_item().await.unwrap();
        assert_eq!(first.messages.len(), 2);
        assert!(p.fetch_orchestration_item().await.is_none());
        p.abandon_orchestration_item(&first.lock_token, None).await.unwrap();
        let again = p.fetch_orchestration_item().await.unwrap();
        assert_eq!(again.messages.len(), 2);
    }

    #[tokio::test]
    async fn entity_seq_is_assigned_monotonically() {
        let p = InMemoryProvider::new();
        let id = EntityId::new("counter", "k");
        for _ in 0..3 {
            p.enqueue_entity_work(WorkItem::EntityInvoke {
                entity: id.clone(),
                seq: 0,
                operation: "add".into(),
                input: "1".into(),
                caller: None,
            })
            .await
            .unwrap();
        }
        let item = p.fetch_entity_item().await.unwrap();
        let seqs: Vec<u64> = item
            .operations
            .iter()
            .map(|op| match op {
                WorkItem::EntityInvoke { seq, .. } => *seq,
                _ => 0,
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }
}
