//! In-process runtime: dispatcher loops that turn queued work into replay
//! passes, activity executions, timer fires, and entity operations, all
//! persisted through a [`Provider`].
//!
//! Exactly one replay pass per instance is in flight at a time (the provider
//! locks an instance while its batch is outstanding). Across instances the
//! dispatchers run fully parallel; activity execution is bounded by a
//! semaphore sized by [`RuntimeOptions::max_concurrent_activities`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use semver::Version;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::providers::{
    EntityCaller, ExecutionMetadata, OrchestrationItem, Provider, WorkItem,
};
use crate::{wall_clock_ms, ActivityContext, Action, OrchestrationContext};

pub mod entities;
pub mod orchestration_turn;
pub mod registry;
pub mod state_helpers;
mod timers;

pub use entities::{EntityContext, EntityHandler};
pub use orchestration_turn::{OrchestrationTurn, TurnResult};
pub use registry::{
    ActivityRegistry, ActivityRegistryBuilder, EntityRegistry, EntityRegistryBuilder, OrchestrationRegistry,
    OrchestrationRegistryBuilder, VersionPolicy,
};
pub use state_helpers::HistoryReader;

/// Configuration for the runtime's dispatcher loops.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Polling interval when dispatcher queues are empty. Lower is more
    /// responsive, higher burns less idle CPU.
    pub dispatcher_idle_sleep_ms: u64,
    /// Upper bound on concurrently executing activities; excess work queues.
    pub max_concurrent_activities: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep_ms: 10,
            max_concurrent_activities: 64,
        }
    }
}

/// Orchestration handler invoked by the replay executor.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper implementing [`OrchestrationHandler`].
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Activity handler: ordinary non-deterministic code, executed at-least-once.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

/// Function wrapper implementing [`ActivityHandler`].
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// The runtime. Start it with registries and a provider, drive it through a
/// [`crate::client::Client`] bound to the same provider.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    provider: Arc<dyn Provider>,
    orchestrations: OrchestrationRegistry,
    activities: ActivityRegistry,
    entities: EntityRegistry,
    options: RuntimeOptions,
}

impl Runtime {
    /// Start with the in-memory provider.
    pub async fn start(
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
        entities: EntityRegistry,
    ) -> Arc<Self> {
        let provider: Arc<dyn Provider> = Arc::new(crate::providers::in_memory::InMemoryProvider::new());
        Self::start_with_store(provider, activities, orchestrations, entities).await
    }

    pub async fn start_with_store(
        provider: Arc<dyn Provider>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
        entities: EntityRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(provider, activities, orchestrations, entities, RuntimeOptions::default()).await
    }

    pub async fn start_with_options(
        provider: Arc<dyn Provider>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
        entities: EntityRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none is set; fine to race.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            provider,
            orchestrations,
            activities,
            entities,
            options,
        });

        let handles = vec![
            runtime.clone().start_orchestration_dispatcher(),
            runtime.clone().start_worker_dispatcher(),
            runtime.clone().start_timer_dispatcher(),
            runtime.clone().start_entity_dispatcher(),
        ];
        runtime.joins.lock().await.extend(handles);
        runtime
    }

    /// Abort the background dispatcher tasks.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for handle in joins.drain(..) {
            handle.abort();
        }
    }

    pub fn provider(&self) -> Arc<dyn Provider> {
        self.provider.clone()
    }

    // ---- orchestration dispatch ----

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some(item) = self.provider.fetch_orchestration_item().await {
                    self.process_orchestration_item(item).await;
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(self.options.dispatcher_idle_sleep_ms)).await;
                }
            }
        })
    }

    async fn process_orchestration_item(self: &Arc<Self>, item: OrchestrationItem) {
        let reader = HistoryReader::from_history(&item.history);

        let start_msg = item
            .messages
            .iter()
            .find(|m| matches!(m, WorkItem::StartOrchestration { .. } | WorkItem::ContinueAsNew { .. }))
            .cloned();
        let is_continue = matches!(start_msg, Some(WorkItem::ContinueAsNew { .. }));

        // A terminal execution ignores everything except the continue-as-new
        // restart it announced itself. In-flight results are acked and
        // discarded, which is the terminate contract.
        if reader.is_terminal() && !(reader.is_continued_as_new && is_continue) {
            debug!(instance = %item.instance, "instance is terminal; dropping batch");
            self.ack_with_retry(&item.lock_token, item.execution_id, OrchestrationChanges::default())
                .await;
            return;
        }

        let (execution_id, baseline) = if is_continue {
            (item.execution_id + 1, Vec::new())
        } else {
            (item.execution_id, item.history.clone())
        };

        let mut turn = OrchestrationTurn::new(&item.instance, execution_id, baseline.clone());
        let mut changes = OrchestrationChanges::default();

        if baseline.is_empty() {
            let Some(start) = &start_msg else {
                warn!(instance = %item.instance, "messages for an unstarted instance; dropping batch");
                self.ack_with_retry(&item.lock_token, item.execution_id, OrchestrationChanges::default())
                    .await;
                return;
            };
            let (orchestration, input, version, parent_instance, parent_execution_id, parent_id) = match start {
                WorkItem::StartOrchestration {
                    orchestration,
                    input,
                    version,
                    parent_instance,
                    parent_execution_id,
                    parent_id,
                    ..
                } => (
                    orchestration.clone(),
                    input.clone(),
                    version.clone(),
                    parent_instance.clone(),
                    *parent_execution_id,
                    *parent_id,
                ),
                WorkItem::ContinueAsNew {
                    orchestration,
                    version,
                    input,
                    ..
                } => (
                    orchestration.clone(),
                    input.clone(),
                    version.clone(),
                    reader.parent_instance.clone(),
                    reader.parent_execution_id,
                    reader.parent_id,
                ),
                _ => unreachable!("start_msg is filtered to start/continue items"),
            };

            let pinned: Result<Version, String> = match &version {
                Some(raw) => Version::parse(raw).map_err(|e| format!("invalid version '{raw}': {e}")),
                None => self
                    .orchestrations
                    .resolve_for_start(&orchestration)
                    .map(|(v, _)| v)
                    .ok_or_else(|| format!("unregistered:{orchestration}")),
            };

            match pinned {
                Ok(v) => turn.push_started(
                    &orchestration,
                    &v.to_string(),
                    &input,
                    parent_instance,
                    parent_execution_id,
                    parent_id,
                ),
                Err(err) => {
                    // Still leave proper history behind: a start record with a
                    // placeholder version, then the failure.
                    turn.push_started(
                        &orchestration,
                        "0.0.0",
                        &input,
                        parent_instance.clone(),
                        parent_execution_id,
                        parent_id,
                    );
                    turn.push_failed(&err);
                    changes.metadata.status = Some("Failed".to_string());
                    changes.metadata.output = Some(err.clone());
                    if let (Some(parent), Some(parent_exec), Some(parent_id)) =
                        (parent_instance, parent_execution_id, parent_id)
                    {
                        changes.orchestrator_items.push(WorkItem::SubOrchFailed {
                            instance: parent,
                            execution_id: parent_exec,
                            id: parent_id,
                            error: err,
                        });
                    }
                    changes.history_delta = turn.into_history_delta();
                    self.ack_with_retry(&item.lock_token, execution_id, changes).await;
                    return;
                }
            }
        }

        turn.prep_completions(&item.messages);

        let descriptor = turn.reader();
        let name = descriptor.orchestration_name.clone().unwrap_or_default();
        let version_str = descriptor.orchestration_version.clone().unwrap_or_default();
        let input = descriptor.orchestration_input.clone().unwrap_or_default();
        let pinned_version = Version::parse(&version_str).unwrap_or_else(|_| Version::new(0, 0, 0));

        // Replay must run exactly the version this instance was pinned to;
        // a worker that no longer registers it fails the instance rather
        // than silently substituting newer code.
        let handler = self.orchestrations.resolve_exact(&name, &pinned_version);
        let result = match (turn.terminate_request(), handler) {
            (Some(reason), _) => TurnResult::Terminated(reason),
            (None, Some(handler)) => turn.execute(handler, input),
            (None, None) => TurnResult::Failed(format!("unregistered:{name}@{version_str}")),
        };

        changes.metadata.custom_status = turn.custom_status().map(str::to_string);

        // Dispatch pending actions regardless of outcome: their scheduling
        // events are already in history, and a race winner finishing the
        // instance must not strand the losers it just scheduled.
        self.convert_actions(&item.instance, execution_id, &turn, &mut changes);

        match &result {
            TurnResult::Continue => {}
            TurnResult::Completed(output) => {
                turn.push_completed(output);
                changes.metadata.status = Some("Completed".to_string());
                changes.metadata.output = Some(output.clone());
                self.notify_parent(&descriptor, &mut changes, Ok(output.clone()));
            }
            TurnResult::Failed(error) => {
                turn.push_failed(error);
                changes.metadata.status = Some("Failed".to_string());
                changes.metadata.output = Some(error.clone());
                self.notify_parent(&descriptor, &mut changes, Err(error.clone()));
            }
            TurnResult::ContinueAsNew { input, version } => {
                turn.push_continued_as_new(input);
                changes.metadata.status = Some("ContinuedAsNew".to_string());
                changes.metadata.output = Some(input.clone());
                changes.orchestrator_items.push(WorkItem::ContinueAsNew {
                    instance: item.instance.clone(),
                    orchestration: name.clone(),
                    version: version.clone(),
                    input: input.clone(),
                });
            }
            TurnResult::Terminated(reason) => {
                turn.push_terminated(reason);
                changes.metadata.status = Some("Terminated".to_string());
                changes.metadata.output = Some(reason.clone());
                self.notify_parent(&descriptor, &mut changes, Err(format!("terminated: {reason}")));
            }
        }

        debug!(
            instance = %item.instance,
            execution_id,
            history_delta = turn.history_delta().len(),
            worker = changes.worker_items.len(),
            timer = changes.timer_items.len(),
            orchestrator = changes.orchestrator_items.len(),
            entity = changes.entity_items.len(),
            "committing turn"
        );
        changes.history_delta = turn.into_history_delta();
        self.ack_with_retry(&item.lock_token, execution_id, changes).await;
    }

    fn convert_actions(
        &self,
        instance: &str,
        execution_id: u64,
        turn: &OrchestrationTurn,
        changes: &mut OrchestrationChanges,
    ) {
        for action in turn.pending_actions() {
            match action {
                Action::CallActivity {
                    scheduling_event_id,
                    name,
                    input,
                } => changes.worker_items.push(WorkItem::ActivityExecute {
                    instance: instance.to_string(),
                    execution_id,
                    id: *scheduling_event_id,
                    name: name.clone(),
                    input: input.clone(),
                }),
                Action::CreateTimer {
                    scheduling_event_id,
                    delay_ms,
                } => changes.timer_items.push(WorkItem::TimerSchedule {
                    instance: instance.to_string(),
                    execution_id,
                    id: *scheduling_event_id,
                    fire_at_ms: wall_clock_ms() + delay_ms,
                }),
                // Subscriptions wait in history; nothing to dispatch.
                Action::WaitExternal { .. } => {}
                Action::StartSubOrchestration {
                    scheduling_event_id,
                    name,
                    version,
                    instance: child,
                    input,
                } => changes.orchestrator_items.push(WorkItem::StartOrchestration {
                    instance: child.clone(),
                    orchestration: name.clone(),
                    input: input.clone(),
                    version: version.clone(),
                    parent_instance: Some(instance.to_string()),
                    parent_execution_id: Some(execution_id),
                    parent_id: Some(*scheduling_event_id),
                }),
                Action::StartDetached {
                    name,
                    instance: child,
                    input,
                    ..
                } => changes.orchestrator_items.push(WorkItem::StartOrchestration {
                    instance: child.clone(),
                    orchestration: name.clone(),
                    input: input.clone(),
                    version: None,
                    parent_instance: None,
                    parent_execution_id: None,
                    parent_id: None,
                }),
                Action::CallEntity {
                    scheduling_event_id,
                    entity,
                    operation,
                    input,
                } => changes.entity_items.push(WorkItem::EntityInvoke {
                    entity: entity.clone(),
                    seq: 0,
                    operation: operation.clone(),
                    input: input.clone(),
                    caller: Some(EntityCaller {
                        instance: instance.to_string(),
                        execution_id,
                        id: *scheduling_event_id,
                    }),
                }),
                Action::SignalEntity {
                    entity, operation, input, ..
                } => changes.entity_items.push(WorkItem::EntityInvoke {
                    entity: entity.clone(),
                    seq: 0,
                    operation: operation.clone(),
                    input: input.clone(),
                    caller: None,
                }),
                // Handled through TurnResult::ContinueAsNew.
                Action::ContinueAsNew { .. } => {}
            }
        }
    }

    fn notify_parent(&self, descriptor: &HistoryReader, changes: &mut OrchestrationChanges, result: Result<String, String>) {
        let (Some(parent), Some(parent_exec), Some(parent_id)) = (
            descriptor.parent_instance.clone(),
            descriptor.parent_execution_id,
            descriptor.parent_id,
        ) else {
            return;
        };
        changes.orchestrator_items.push(match result {
            Ok(result) => WorkItem::SubOrchCompleted {
                instance: parent,
                execution_id: parent_exec,
                id: parent_id,
                result,
            },
            Err(error) => WorkItem::SubOrchFailed {
                instance: parent,
                execution_id: parent_exec,
                id: parent_id,
                error,
            },
        });
    }

    /// Commit a turn, retrying transient provider errors with exponential
    /// backoff; abandon the batch (delayed) if the commit keeps failing so
    /// it is redelivered rather than lost.
    async fn ack_with_retry(&self, lock_token: &str, execution_id: u64, changes: OrchestrationChanges) {
        let mut attempts: u32 = 0;
        let max_attempts: u32 = 5;
        loop {
            let ack = self
                .provider
                .ack_orchestration_item(
                    lock_token,
                    execution_id,
                    changes.history_delta.clone(),
                    changes.worker_items.clone(),
                    changes.timer_items.clone(),
                    changes.orchestrator_items.clone(),
                    changes.entity_items.clone(),
                    changes.metadata.clone(),
                )
                .await;
            match ack {
                Ok(()) => return,
                Err(e) if e.is_retryable() && attempts < max_attempts => {
                    let backoff_ms = 10u64.saturating_mul(1 << attempts);
                    warn!(attempts, backoff_ms, error = %e, "ack_orchestration_item failed; retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                    attempts += 1;
                }
                Err(e) => {
                    warn!(error = %e, "ack_orchestration_item failed permanently; abandoning batch");
                    let _ = self.provider.abandon_orchestration_item(lock_token, Some(50)).await;
                    return;
                }
            }
        }
    }

    // ---- activity workers ----

    fn start_worker_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let limit = self.options.max_concurrent_activities;
        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(limit));
            loop {
                if let Some((item, token)) = self.provider.dequeue_worker_peek_lock().await {
                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("activity semaphore closed");
                    let runtime = self.clone();
                    tokio::spawn(async move {
                        runtime.execute_activity(item, token).await;
                        drop(permit);
                    });
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(self.options.dispatcher_idle_sleep_ms)).await;
                }
            }
        })
    }

    async fn execute_activity(self: Arc<Self>, item: WorkItem, token: String) {
        let (instance, execution_id, id, name, input) = match item {
            WorkItem::ActivityExecute {
                instance,
                execution_id,
                id,
                name,
                input,
            } => (instance, execution_id, id, name, input),
            other => {
                error!(kind = other.kind(), "unexpected item on worker queue; dropping");
                let _ = self.provider.ack_worker(&token).await;
                return;
            }
        };

        let completion = match self.activities.resolve_for_start(&name) {
            Some((_, handler)) => {
                let ctx = ActivityContext {
                    instance: instance.clone(),
                    execution_id,
                    activity_name: name.clone(),
                    scheduling_event_id: id,
                };
                let invoke = std::panic::AssertUnwindSafe(handler.invoke(ctx, input))
                    .catch_unwind()
                    .await;
                match invoke {
                    Ok(Ok(result)) => WorkItem::ActivityCompleted {
                        instance: instance.clone(),
                        execution_id,
                        id,
                        result,
                    },
                    Ok(Err(error)) => WorkItem::ActivityFailed {
                        instance: instance.clone(),
                        execution_id,
                        id,
                        error,
                    },
                    Err(_) => WorkItem::ActivityFailed {
                        instance: instance.clone(),
                        execution_id,
                        id,
                        error: format!("activity '{name}' panicked"),
                    },
                }
            }
            None => WorkItem::ActivityFailed {
                instance: instance.clone(),
                execution_id,
                id,
                error: format!("unregistered:{name}"),
            },
        };

        // Ack only after the completion is durably enqueued; a failed
        // enqueue leaves the work item for redelivery (at-least-once).
        if self.provider.enqueue_orchestrator_work(completion, None).await.is_ok() {
            let _ = self.provider.ack_worker(&token).await;
        } else {
            warn!(instance = %instance, id, "failed to enqueue activity completion; leaving work item for retry");
            let _ = self.provider.abandon_worker(&token).await;
        }
    }

    // ---- timers ----

    fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        if self.provider.supports_delayed_visibility() {
            // Providers with delayed visibility: turn each schedule into a
            // delayed TimerFired on the orchestrator queue.
            return tokio::spawn(async move {
                loop {
                    if let Some((item, token)) = self.provider.dequeue_timer_peek_lock().await {
                        match item {
                            WorkItem::TimerSchedule {
                                instance,
                                execution_id,
                                id,
                                fire_at_ms,
                            } => {
                                let delay_ms = fire_at_ms.saturating_sub(wall_clock_ms());
                                let fired = WorkItem::TimerFired {
                                    instance,
                                    execution_id,
                                    id,
                                    fire_at_ms,
                                };
                                if self
                                    .provider
                                    .enqueue_orchestrator_work(fired, Some(delay_ms))
                                    .await
                                    .is_ok()
                                {
                                    let _ = self.provider.ack_timer(&token).await;
                                } else {
                                    let _ = self.provider.abandon_timer(&token).await;
                                }
                            }
                            other => {
                                error!(kind = other.kind(), "unexpected item on timer queue; dropping");
                                let _ = self.provider.ack_timer(&token).await;
                            }
                        }
                    } else {
                        tokio::time::sleep(std::time::Duration::from_millis(self.options.dispatcher_idle_sleep_ms))
                            .await;
                    }
                }
            });
        }

        // Fallback: in-process timer service; schedules are acked by the
        // service after the fire lands.
        tokio::spawn(async move {
            let (service_handle, service_tx) = timers::TimerService::start(self.provider.clone());
            let intake = self.clone();
            let intake_tx = service_tx.clone();
            tokio::spawn(async move {
                loop {
                    if let Some((item, token)) = intake.provider.dequeue_timer_peek_lock().await {
                        match &item {
                            WorkItem::TimerSchedule { .. } => {
                                let _ = intake_tx.send(timers::TimerWithToken {
                                    item,
                                    ack_token: token,
                                });
                            }
                            other => {
                                error!(kind = other.kind(), "unexpected item on timer queue; dropping");
                                let _ = intake.provider.ack_timer(&token).await;
                            }
                        }
                    } else {
                        tokio::time::sleep(std::time::Duration::from_millis(intake.options.dispatcher_idle_sleep_ms))
                            .await;
                    }
                }
            });
            let _ = service_handle.await;
        })
    }

    // ---- entities ----

    fn start_entity_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some(item) = self.provider.fetch_entity_item().await {
                    let (record, notifications) = entities::apply_entity_batch(&self.entities, &item).await;
                    let mut attempts: u32 = 0;
                    loop {
                        match self
                            .provider
                            .ack_entity_item(&item.lock_token, record.clone(), notifications.clone())
                            .await
                        {
                            Ok(()) => break,
                            Err(e) if e.is_retryable() && attempts < 5 => {
                                let backoff_ms = 10u64.saturating_mul(1 << attempts);
                                warn!(entity = %item.entity, error = %e, backoff_ms, "ack_entity_item failed; retrying");
                                tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                                attempts += 1;
                            }
                            Err(e) => {
                                warn!(entity = %item.entity, error = %e, "ack_entity_item failed permanently; abandoning");
                                let _ = self.provider.abandon_entity_item(&item.lock_token).await;
                                break;
                            }
                        }
                    }
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(self.options.dispatcher_idle_sleep_ms)).await;
                }
            }
        })
    }
}

/// Everything a single turn commits in one ack.
#[derive(Default)]
struct OrchestrationChanges {
    history_delta: Vec<crate::Event>,
    worker_items: Vec<WorkItem>,
    timer_items: Vec<WorkItem>,
    orchestrator_items: Vec<WorkItem>,
    entity_items: Vec<WorkItem>,
    metadata: ExecutionMetadata,
}
