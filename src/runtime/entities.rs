//! Entity execution: keyed, single-writer state machines.
//!
//! The entity dispatcher fetches one key's pending operations under the
//! provider's key lock, applies them in sequence order against the durable
//! record, and commits new state plus caller notifications in one atomic
//! ack. Operations at or below the record's `last_applied_seq` are duplicates
//! from at-least-once delivery and are skipped, which is the exactly-once
//! guarantee.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::providers::{EntityItem, EntityRecord, WorkItem};
use crate::codec::{Codec, Json};
use crate::EntityId;

const LOCK: &str = "entity context lock poisoned";

/// Context for one entity operation. State reads and writes go through here;
/// the runtime commits whatever the handler left behind.
#[derive(Clone)]
pub struct EntityContext {
    inner: Arc<Mutex<EntityCtxInner>>,
}

struct EntityCtxInner {
    entity_id: EntityId,
    operation: String,
    seq: u64,
    caller: Option<String>,
    state: Option<String>,
}

impl EntityContext {
    pub(crate) fn new(
        entity_id: EntityId,
        operation: String,
        seq: u64,
        caller: Option<String>,
        state: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EntityCtxInner {
                entity_id,
                operation,
                seq,
                caller,
                state,
            })),
        }
    }

    pub fn entity_id(&self) -> EntityId {
        self.inner.lock().expect(LOCK).entity_id.clone()
    }

    /// Operation name this invocation was addressed to.
    pub fn operation(&self) -> String {
        self.inner.lock().expect(LOCK).operation.clone()
    }

    /// Sequence number of this operation within the key.
    pub fn sequence(&self) -> u64 {
        self.inner.lock().expect(LOCK).seq
    }

    /// Instance id of the awaiting orchestration, if this is a call.
    pub fn caller(&self) -> Option<String> {
        self.inner.lock().expect(LOCK).caller.clone()
    }

    /// Decode the current state, `Ok(None)` if the entity has none yet.
    pub fn get_state<T: serde::de::DeserializeOwned>(&self) -> Result<Option<T>, String> {
        match &self.inner.lock().expect(LOCK).state {
            Some(raw) => Json::decode(raw).map(Some),
            None => Ok(None),
        }
    }

    pub fn set_state<T: serde::Serialize>(&self, value: &T) -> Result<(), String> {
        let raw = Json::encode(value)?;
        self.inner.lock().expect(LOCK).state = Some(raw);
        Ok(())
    }

    pub fn delete_state(&self) {
        self.inner.lock().expect(LOCK).state = None;
    }

    pub(crate) fn take_state(&self) -> Option<String> {
        self.inner.lock().expect(LOCK).state.clone()
    }
}

/// Handler for one named entity type. Reads current state, computes new
/// state plus an optional return value, and the runtime commits both.
#[async_trait]
pub trait EntityHandler: Send + Sync {
    async fn invoke(&self, ctx: EntityContext, input: String) -> Result<Option<String>, String>;
}

/// Function wrapper implementing [`EntityHandler`].
pub struct FnEntity<F, Fut>(pub F)
where
    F: Fn(EntityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Option<String>, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> EntityHandler for FnEntity<F, Fut>
where
    F: Fn(EntityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Option<String>, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: EntityContext, input: String) -> Result<Option<String>, String> {
        (self.0)(ctx, input).await
    }
}

/// Apply one fetched batch: returns the record to commit plus completion
/// items for any awaiting callers.
pub(crate) async fn apply_entity_batch(
    registry: &super::registry::EntityRegistry,
    item: &EntityItem,
) -> (EntityRecord, Vec<WorkItem>) {
    let mut record = item.record.clone();
    let mut notifications = Vec::new();

    for op in &item.operations {
        let WorkItem::EntityInvoke {
            entity,
            seq,
            operation,
            input,
            caller,
        } = op
        else {
            warn!(kind = op.kind(), "unexpected item in entity batch");
            continue;
        };

        if *seq <= record.last_applied_seq {
            debug!(%entity, seq, last_applied = record.last_applied_seq, "skipping duplicate entity operation");
            continue;
        }

        let result: Result<Option<String>, String> = match registry.resolve_for_start(&entity.name) {
            None => Err(format!("unregistered:{}", entity.name)),
            Some((_, handler)) => {
                let ctx = EntityContext::new(
                    entity.clone(),
                    operation.clone(),
                    *seq,
                    caller.as_ref().map(|c| c.instance.clone()),
                    record.value.clone(),
                );
                let invoke = std::panic::AssertUnwindSafe(handler.invoke(ctx.clone(), input.clone()))
                    .catch_unwind()
                    .await;
                match invoke {
                    Ok(Ok(value)) => {
                        record.value = ctx.take_state();
                        Ok(value)
                    }
                    Ok(Err(error)) => Err(error),
                    Err(_) => Err(format!("entity '{entity}' operation '{operation}' panicked")),
                }
            }
        };
        record.last_applied_seq = *seq;

        if let Some(caller) = caller {
            notifications.push(match result {
                Ok(value) => WorkItem::EntityCallCompleted {
                    instance: caller.instance.clone(),
                    execution_id: caller.execution_id,
                    id: caller.id,
                    result: value.unwrap_or_default(),
                },
                Err(error) => WorkItem::EntityCallFailed {
                    instance: caller.instance.clone(),
                    execution_id: caller.execution_id,
                    id: caller.id,
                    error,
                },
            });
        } else if let Err(error) = result {
            // Failed signal: nobody is awaiting, so record it and move on.
            warn!(%entity, operation, %error, "entity signal failed");
        }
    }

    (record, notifications)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::EntityCaller;
    use crate::runtime::registry::EntityRegistry;

    fn counter_registry() -> EntityRegistry {
        EntityRegistry::builder()
            .register("counter", |ctx: EntityContext, input: String| async move {
                let mut value: i64 = ctx.get_state()?.unwrap_or(0);
                match ctx.operation().as_str() {
                    "add" => {
                        value += input.parse::<i64>().map_err(|e| e.to_string())?;
                        ctx.set_state(&value)?;
                        Ok(None)
                    }
                    "get" => Ok(Some(value.to_string())),
                    other => Err(format!("unknown operation: {other}")),
                }
            })
            .build()
    }

    fn invoke(seq: u64, operation: &str, input: &str, caller: Option<EntityCaller>) -> WorkItem {
        WorkItem::EntityInvoke {
            entity: EntityId::new("counter", "k"),
            seq,
            operation: operation.into(),
            input: input.into(),
            caller,
        }
    }

    #[tokio::test]
    async fn operations_apply_in_sequence_and_dedupe() {
        let registry = counter_registry();
        let item = EntityItem {
            entity: EntityId::new("counter", "k"),
            record: EntityRecord::default(),
            operations: vec![
                invoke(1, "add", "5", None),
                invoke(1, "add", "5", None), // redelivered
                invoke(2, "add", "2", None),
            ],
            lock_token: "t".into(),
        };
        let (record, notifications) = apply_entity_batch(&registry, &item).await;
        assert_eq!(record.last_applied_seq, 2);
        assert_eq!(record.value.as_deref(), Some("7"));
        assert!(notifications.is_empty());
    }

    #[tokio::test]
    async fn calls_notify_their_caller() {
        let registry = counter_registry();
        let caller = EntityCaller {
            instance: "orch-1".into(),
            execution_id: 1,
            id: 4,
        };
        let item = EntityItem {
            entity: EntityId::new("counter", "k"),
            record: EntityRecord {
                value: Some("10".into()),
                last_applied_seq: 3,
            },
            operations: vec![invoke(4, "get", "", Some(caller))],
            lock_token: "t".into(),
        };
        let (record, notifications) = apply_entity_batch(&registry, &item).await;
        assert_eq!(record.last_applied_seq, 4);
        assert_eq!(
            notifications,
            vec![WorkItem::EntityCallCompleted {
                instance: "orch-1".into(),
                execution_id: 1,
                id: 4,
                result: "10".into(),
            }]
        );
    }
}
