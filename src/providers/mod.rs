//! Storage abstraction: history, queues, and entity state.
//!
//! A [`Provider`] owns four queues (orchestrator, worker, timer, entity) and
//! the durable records behind them. Orchestrator and entity consumption is
//! batched and lock-scoped — fetching an item locks its instance (or entity
//! key) until the matching ack or abandon, which is what serializes replay
//! passes per instance and makes entities single-writer. All commits happen
//! through the atomic ack calls: history delta, follow-up work items, and
//! metadata land together or not at all.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{EntityId, Event};

mod error;
/// In-memory provider for tests and samples.
pub mod in_memory;
/// Filesystem-backed provider for local development.
pub mod fs;

pub use error::ProviderError;

/// Identity of the orchestration awaiting an entity call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCaller {
    pub instance: String,
    pub execution_id: u64,
    pub id: u64,
}

/// A queued unit of work. Correlation ids (`id`) are scheduling event ids
/// from the originating instance's history, never freshly generated — that is
/// what keeps at-least-once delivery idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
        version: Option<String>,
        parent_instance: Option<String>,
        parent_execution_id: Option<u64>,
        parent_id: Option<u64>,
    },
    /// Restart `instance` as a fresh execution with new input.
    ContinueAsNew {
        instance: String,
        orchestration: String,
        version: Option<String>,
        input: String,
    },
    ActivityExecute {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        error: String,
    },
    TimerSchedule {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
    },
    SubOrchCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    SubOrchFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        error: String,
    },
    TerminateInstance {
        instance: String,
        reason: String,
    },
    EntityCallCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    EntityCallFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        error: String,
    },
    /// One entity operation: a fire-and-forget signal (`caller: None`) or an
    /// awaited call. `seq` is the per-key de-duplication sequence number;
    /// providers assign it at enqueue time when left at 0.
    EntityInvoke {
        entity: EntityId,
        seq: u64,
        operation: String,
        input: String,
        caller: Option<EntityCaller>,
    },
}

impl WorkItem {
    /// Instance an orchestrator-queue item routes to.
    pub fn instance(&self) -> Option<&str> {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ContinueAsNew { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::SubOrchCompleted { instance, .. }
            | WorkItem::SubOrchFailed { instance, .. }
            | WorkItem::TerminateInstance { instance, .. }
            | WorkItem::EntityCallCompleted { instance, .. }
            | WorkItem::EntityCallFailed { instance, .. } => Some(instance),
            WorkItem::EntityInvoke { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::StartOrchestration { .. } => "StartOrchestration",
            WorkItem::ContinueAsNew { .. } => "ContinueAsNew",
            WorkItem::ActivityExecute { .. } => "ActivityExecute",
            WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
            WorkItem::ActivityFailed { .. } => "ActivityFailed",
            WorkItem::TimerSchedule { .. } => "TimerSchedule",
            WorkItem::TimerFired { .. } => "TimerFired",
            WorkItem::ExternalRaised { .. } => "ExternalRaised",
            WorkItem::SubOrchCompleted { .. } => "SubOrchCompleted",
            WorkItem::SubOrchFailed { .. } => "SubOrchFailed",
            WorkItem::TerminateInstance { .. } => "TerminateInstance",
            WorkItem::EntityCallCompleted { .. } => "EntityCallCompleted",
            WorkItem::EntityCallFailed { .. } => "EntityCallFailed",
            WorkItem::EntityInvoke { .. } => "EntityInvoke",
        }
    }
}

/// One instance's pending work: every currently-visible orchestrator message
/// for the instance, plus the history to replay against. The instance stays
/// locked until `ack_orchestration_item` / `abandon_orchestration_item`.
#[derive(Debug, Clone)]
pub struct OrchestrationItem {
    pub instance: String,
    pub execution_id: u64,
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
    pub lock_token: String,
}

/// Durable state of one entity key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub value: Option<String>,
    /// Highest operation sequence number applied so far; operations at or
    /// below it are duplicates and must not be re-applied.
    pub last_applied_seq: u64,
}

/// One entity key's pending operations, fetched under the key's lock.
#[derive(Debug, Clone)]
pub struct EntityItem {
    pub entity: EntityId,
    pub record: EntityRecord,
    /// Pending `EntityInvoke` items in sequence order.
    pub operations: Vec<WorkItem>,
    pub lock_token: String,
}

/// Pre-computed status the runtime hands the provider at ack time, so the
/// provider can index instance state without understanding history events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub status: Option<String>,
    pub output: Option<String>,
    pub custom_status: Option<String>,
}

/// A queue line shared by the in-memory and filesystem providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct QueuedItem {
    pub id: u64,
    pub visible_at_ms: u64,
    pub item: WorkItem,
}

/// Append events to one execution, dropping duplicate completions and
/// anything after a terminal record. This is the idempotence guarantee that
/// makes at-least-once dispatch safe.
pub(crate) fn append_idempotent(current: &mut Vec<Event>, new_events: Vec<Event>) {
    let mut seen: HashSet<(u64, &'static str)> = HashSet::new();
    for e in current.iter() {
        if let Some(key) = completion_key(e) {
            seen.insert(key);
        }
    }
    let mut has_started = current.iter().any(|e| matches!(e, Event::OrchestrationStarted { .. }));
    for e in new_events {
        if current.last().map_or(false, Event::is_terminal) {
            return;
        }
        if matches!(e, Event::OrchestrationStarted { .. }) {
            if has_started {
                continue;
            }
            has_started = true;
        }
        if let Some(key) = completion_key(&e) {
            if !seen.insert(key) {
                continue;
            }
        }
        current.push(e);
    }
}

fn completion_key(e: &Event) -> Option<(u64, &'static str)> {
    match e {
        Event::ActivityCompleted { source_event_id, .. } => Some((*source_event_id, "ac")),
        Event::ActivityFailed { source_event_id, .. } => Some((*source_event_id, "af")),
        Event::TimerFired { source_event_id, .. } => Some((*source_event_id, "tf")),
        Event::SubOrchestrationCompleted { source_event_id, .. } => Some((*source_event_id, "sc")),
        Event::SubOrchestrationFailed { source_event_id, .. } => Some((*source_event_id, "sf")),
        Event::EntityCallCompleted { source_event_id, .. } => Some((*source_event_id, "ec")),
        Event::EntityCallFailed { source_event_id, .. } => Some((*source_event_id, "ef")),
        _ => None,
    }
}

pub(crate) fn merge_metadata(into: &mut ExecutionMetadata, from: ExecutionMetadata) {
    if from.status.is_some() {
        into.status = from.status;
        into.output = from.output;
    }
    if from.custom_status.is_some() {
        into.custom_status = from.custom_status;
    }
}

/// Storage contract the runtime drives. Implementations must keep appends
/// idempotent for completion-like events (duplicate `source_event_id`s are
/// dropped) and must make each ack atomic.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    // ---- history ----

    /// Read the latest execution's history.
    async fn read(&self, instance: &str) -> Vec<Event>;
    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event>;
    async fn latest_execution_id(&self, instance: &str) -> Option<u64>;
    async fn list_executions(&self, instance: &str) -> Vec<u64>;
    async fn list_instances(&self) -> Vec<String>;
    /// Register an instance with empty history (status becomes Pending).
    /// Fails if the instance already exists.
    async fn create_instance(&self, instance: &str) -> Result<(), ProviderError>;
    async fn instance_exists(&self, instance: &str) -> bool;
    async fn get_execution_metadata(&self, instance: &str) -> Option<ExecutionMetadata>;

    // ---- orchestrator queue ----

    async fn enqueue_orchestrator_work(&self, item: WorkItem, visible_in_ms: Option<u64>) -> Result<(), ProviderError>;
    /// Fetch the next instance with visible work, locking it. Returns `None`
    /// when nothing is ready.
    async fn fetch_orchestration_item(&self) -> Option<OrchestrationItem>;
    /// Atomically commit one replay pass: append the history delta (to
    /// `execution_id`, creating it if new), enqueue follow-up items, store
    /// metadata, consume the batch, and release the instance lock.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<(), ProviderError>;
    /// Return the batch to the queue (optionally delayed) and release the lock.
    async fn abandon_orchestration_item(&self, lock_token: &str, redeliver_in_ms: Option<u64>)
        -> Result<(), ProviderError>;

    // ---- worker queue ----

    async fn enqueue_worker_work(&self, item: WorkItem) -> Result<(), ProviderError>;
    async fn dequeue_worker_peek_lock(&self) -> Option<(WorkItem, String)>;
    async fn ack_worker(&self, token: &str) -> Result<(), ProviderError>;
    async fn abandon_worker(&self, token: &str) -> Result<(), ProviderError>;

    // ---- timer queue ----

    async fn enqueue_timer_work(&self, item: WorkItem) -> Result<(), ProviderError>;
    async fn dequeue_timer_peek_lock(&self) -> Option<(WorkItem, String)>;
    async fn ack_timer(&self, token: &str) -> Result<(), ProviderError>;
    async fn abandon_timer(&self, token: &str) -> Result<(), ProviderError>;
    /// Whether `enqueue_orchestrator_work` honors `visible_in_ms`. When true
    /// the runtime schedules timers through delayed visibility instead of the
    /// in-process timer service.
    fn supports_delayed_visibility(&self) -> bool {
        false
    }

    // ---- entity queue + state ----

    /// Enqueue an entity operation. A `seq` of 0 is replaced with the next
    /// per-key sequence number; redelivered items keep theirs.
    async fn enqueue_entity_work(&self, item: WorkItem) -> Result<(), ProviderError>;
    /// Fetch one entity key's pending operations, locking the key. Strict
    /// single-writer: a locked key is never fetched concurrently.
    async fn fetch_entity_item(&self) -> Option<EntityItem>;
    /// Atomically commit an entity batch: new state, caller notifications,
    /// consume the operations, release the key lock.
    async fn ack_entity_item(
        &self,
        lock_token: &str,
        record: EntityRecord,
        orchestrator_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError>;
    async fn abandon_entity_item(&self, lock_token: &str) -> Result<(), ProviderError>;
    async fn read_entity(&self, entity: &EntityId) -> Option<EntityRecord>;
}
