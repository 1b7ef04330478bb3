//! Control plane: schedule instances, raise events, signal entities, query
//! status. A client talks to the runtime exclusively through the shared
//! [`Provider`] — it enqueues work and reads state, nothing more, so it can
//! live in any process that can reach the store.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{Codec, Json};
use crate::providers::{Provider, WorkItem};
use crate::runtime::HistoryReader;
use crate::{EntityId, Event};

/// Lifecycle state of an orchestration instance, derived from the latest
/// execution's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    /// Created but no replay pass has run yet.
    Pending,
    Running,
    Completed { output: String },
    Failed { error: String },
    Terminated { reason: String },
    /// The latest execution restarted itself and the next one has not been
    /// seeded yet; transient.
    ContinuedAsNew,
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Terminated { .. }
        )
    }
}

/// Status plus the instance's custom status blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub status: OrchestrationStatus,
    pub custom_status: Option<String>,
}

/// Error from the wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

/// Client bound to a provider.
pub struct Client {
    provider: Arc<dyn Provider>,
}

impl Client {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    /// Schedule an orchestration under a generated instance id.
    pub async fn schedule(&self, orchestration: &str, input: impl Into<String>) -> Result<String, String> {
        let instance = uuid::Uuid::new_v4().to_string();
        self.schedule_named(&instance, orchestration, input).await?;
        Ok(instance)
    }

    /// Schedule an orchestration under a caller-chosen instance id. The
    /// version is resolved by the registry's start policy when the first
    /// replay pass runs.
    pub async fn schedule_named(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), String> {
        self.schedule_internal(instance, orchestration, None, input.into()).await
    }

    /// Schedule an orchestration pinned to an explicit version.
    pub async fn schedule_versioned(
        &self,
        instance: &str,
        orchestration: &str,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<(), String> {
        self.schedule_internal(instance, orchestration, Some(version.into()), input.into())
            .await
    }

    async fn schedule_internal(
        &self,
        instance: &str,
        orchestration: &str,
        version: Option<String>,
        input: String,
    ) -> Result<(), String> {
        self.provider
            .create_instance(instance)
            .await
            .map_err(|e| e.to_string())?;
        self.provider
            .enqueue_orchestrator_work(
                WorkItem::StartOrchestration {
                    instance: instance.to_string(),
                    orchestration: orchestration.to_string(),
                    input,
                    version,
                    parent_instance: None,
                    parent_execution_id: None,
                    parent_id: None,
                },
                None,
            )
            .await
            .map_err(|e| e.to_string())
    }

    /// Schedule with a typed input (serialized to JSON); generated id.
    pub async fn schedule_typed<In: Serialize>(&self, orchestration: &str, input: &In) -> Result<String, String> {
        let payload = Json::encode(input)?;
        self.schedule(orchestration, payload).await
    }

    pub async fn schedule_named_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: &In,
    ) -> Result<(), String> {
        let payload = Json::encode(input)?;
        self.schedule_named(instance, orchestration, payload).await
    }

    /// Raise an external event into a running instance. At-least-once; the
    /// engine buffers it in history until the matching wait point executes.
    pub async fn raise_event(
        &self,
        instance: &str,
        event_name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), String> {
        self.provider
            .enqueue_orchestrator_work(
                WorkItem::ExternalRaised {
                    instance: instance.to_string(),
                    name: event_name.into(),
                    data: data.into(),
                },
                None,
            )
            .await
            .map_err(|e| e.to_string())
    }

    /// Request termination. Further dispatch halts; in-flight activities are
    /// not force-killed, their results are discarded.
    pub async fn terminate(&self, instance: &str, reason: impl Into<String>) -> Result<(), String> {
        self.provider
            .enqueue_orchestrator_work(
                WorkItem::TerminateInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
                None,
            )
            .await
            .map_err(|e| e.to_string())
    }

    /// Fire-and-forget entity signal.
    pub async fn signal_entity(
        &self,
        entity: &EntityId,
        operation: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<(), String> {
        self.provider
            .enqueue_entity_work(WorkItem::EntityInvoke {
                entity: entity.clone(),
                seq: 0,
                operation: operation.into(),
                input: input.into(),
                caller: None,
            })
            .await
            .map_err(|e| e.to_string())
    }

    /// Read-only snapshot of an entity's state.
    pub async fn get_entity_state(&self, entity: &EntityId) -> Option<String> {
        self.provider.read_entity(entity).await.and_then(|record| record.value)
    }

    pub async fn get_entity_state_typed<T: DeserializeOwned>(&self, entity: &EntityId) -> Result<Option<T>, String> {
        match self.get_entity_state(entity).await {
            Some(raw) => Json::decode(&raw).map(Some),
            None => Ok(None),
        }
    }

    /// Derive the instance's status from its latest execution.
    pub async fn get_status(&self, instance: &str) -> InstanceStatus {
        if !self.provider.instance_exists(instance).await {
            return InstanceStatus {
                status: OrchestrationStatus::NotFound,
                custom_status: None,
            };
        }
        let history = self.provider.read(instance).await;
        if history.is_empty() {
            return InstanceStatus {
                status: OrchestrationStatus::Pending,
                custom_status: None,
            };
        }
        let reader = HistoryReader::from_history(&history);
        let status = if reader.is_completed {
            OrchestrationStatus::Completed {
                output: reader.output.clone().unwrap_or_default(),
            }
        } else if reader.is_failed {
            OrchestrationStatus::Failed {
                error: reader.error.clone().unwrap_or_default(),
            }
        } else if reader.is_terminated {
            OrchestrationStatus::Terminated {
                reason: reader.terminate_reason.clone().unwrap_or_default(),
            }
        } else if reader.is_continued_as_new {
            OrchestrationStatus::ContinuedAsNew
        } else {
            OrchestrationStatus::Running
        };
        InstanceStatus {
            status,
            custom_status: reader.custom_status,
        }
    }

    /// Typed view of a completed instance's output.
    pub async fn get_output_typed<Out: DeserializeOwned>(&self, instance: &str) -> Result<Option<Out>, String> {
        match self.get_status(instance).await.status {
            OrchestrationStatus::Completed { output } => Json::decode(&output).map(Some),
            _ => Ok(None),
        }
    }

    /// Poll until the instance reaches Completed, Failed, or Terminated.
    /// Continue-as-new is not terminal — waiting rides across executions.
    pub async fn wait_for_completion(
        &self,
        instance: &str,
        timeout: std::time::Duration,
    ) -> Result<InstanceStatus, WaitError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let snapshot = self.get_status(instance).await;
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
            if std::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }

    /// Execution ids recorded for the instance (continue-as-new grows this).
    pub async fn list_executions(&self, instance: &str) -> Vec<u64> {
        self.provider.list_executions(instance).await
    }

    /// Raw history of one execution; mainly for diagnostics and tests.
    pub async fn read_execution_history(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        self.provider.read_with_execution(instance, execution_id).await
    }
}
