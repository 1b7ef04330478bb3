//! taskloom — a durable workflow engine.
//!
//! Orchestrations are ordinary async Rust functions. Every asynchronous
//! request they make (activity call, timer, external event, sub-orchestration,
//! entity call) is recorded as a scheduling event in an append-only history.
//! When the instance is resumed — after a completion arrives, a process
//! restarts, or work moves to another worker — the orchestration function is
//! re-executed from the top against that history. Requests already recorded
//! are fed their stored results instead of being dispatched again, so the
//! function deterministically reaches the point where it left off.
//!
//! Orchestration code must therefore be deterministic: no wall clock, no
//! randomness, no ambient I/O. The [`OrchestrationContext`] provides
//! replay-stable substitutes (`utcnow_ms`, `new_guid`, `trace_info`) that are
//! recorded in history on first execution and replayed afterwards.
//!
//! The crate is organised the way the runtime consumes it:
//! - [`Event`] / [`Action`] — the history log vocabulary and the dispatch
//!   decisions a single replay pass produces.
//! - [`futures`] — the pollable primitives behind `ctx.schedule_*`.
//! - [`providers`] — storage: history, queues, and entity state.
//! - [`runtime`] — dispatcher loops turning queued work into replay passes.
//! - [`client`] — the control plane (schedule, raise event, status, ...).
//! - [`saga`] — compensation bookkeeping built on ordinary activity calls.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use serde::{Deserialize, Serialize};

pub mod client;
pub mod codec;
pub mod futures;
pub mod providers;
pub mod runtime;
pub mod saga;

pub use crate::futures::{DurableFuture, DurableOutput, JoinPolicy};

/// First event id of every execution.
pub const INITIAL_EVENT_ID: u64 = 1;
/// Execution id of an instance's first logical run; continue-as-new increments it.
pub const INITIAL_EXECUTION_ID: u64 = 1;

pub(crate) const SYSCALL_OP_GUID: &str = "guid";
pub(crate) const SYSCALL_OP_UTCNOW_MS: &str = "utcnow_ms";
pub(crate) const SYSCALL_OP_TRACE_PREFIX: &str = "trace:";

const LOCK: &str = "orchestration context lock poisoned";

/// Address of a durable entity: a named state machine plus a user key.
///
/// Rendered as `name@key`, e.g. `counter@user-42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub name: String,
    pub key: String,
}

impl EntityId {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.key)
    }
}

impl std::str::FromStr for EntityId {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((name, key)) if !name.is_empty() && !key.is_empty() => Ok(Self::new(name, key)),
            _ => Err(format!("invalid entity id (expected name@key): {s}")),
        }
    }
}

/// One record in an instance's append-only history.
///
/// `event_id` is the record's ordinal within the execution, assigned in strict
/// history order. Completion events reference the scheduling record they
/// resolve through `source_event_id`; that pairing is the task correlation
/// table, and it is why correlation never uses random ids — a replay
/// re-claims the same ordinals in the same order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrchestrationStarted {
        event_id: u64,
        name: String,
        version: String,
        input: String,
        parent_instance: Option<String>,
        parent_execution_id: Option<u64>,
        parent_id: Option<u64>,
    },
    ActivityScheduled {
        event_id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        event_id: u64,
        source_event_id: u64,
        result: String,
    },
    ActivityFailed {
        event_id: u64,
        source_event_id: u64,
        error: String,
    },
    TimerCreated {
        event_id: u64,
        delay_ms: u64,
    },
    TimerFired {
        event_id: u64,
        source_event_id: u64,
        fire_at_ms: u64,
    },
    ExternalSubscribed {
        event_id: u64,
        name: String,
    },
    /// An external event raised into this instance. Appended whether or not a
    /// subscription exists yet: events are buffered in history until the
    /// matching wait point executes.
    ExternalEvent {
        event_id: u64,
        name: String,
        data: String,
    },
    SubOrchestrationScheduled {
        event_id: u64,
        name: String,
        version: Option<String>,
        instance: String,
        input: String,
    },
    SubOrchestrationCompleted {
        event_id: u64,
        source_event_id: u64,
        result: String,
    },
    SubOrchestrationFailed {
        event_id: u64,
        source_event_id: u64,
        error: String,
    },
    /// Detached child start; no completion is ever routed back.
    OrchestrationChained {
        event_id: u64,
        name: String,
        instance: String,
        input: String,
    },
    EntityCallScheduled {
        event_id: u64,
        entity: EntityId,
        operation: String,
        input: String,
    },
    EntityCallCompleted {
        event_id: u64,
        source_event_id: u64,
        result: String,
    },
    EntityCallFailed {
        event_id: u64,
        source_event_id: u64,
        error: String,
    },
    EntitySignaled {
        event_id: u64,
        entity: EntityId,
        operation: String,
        input: String,
    },
    /// Replay-stable substitute for a non-deterministic primitive: the value
    /// is computed once and replayed from history forever after.
    SystemCall {
        event_id: u64,
        op: String,
        value: String,
    },
    CustomStatusSet {
        event_id: u64,
        status: String,
    },
    OrchestrationContinuedAsNew {
        event_id: u64,
        input: String,
    },
    OrchestrationCompleted {
        event_id: u64,
        output: String,
    },
    OrchestrationFailed {
        event_id: u64,
        error: String,
    },
    OrchestrationTerminated {
        event_id: u64,
        reason: String,
    },
}

impl Event {
    pub fn event_id(&self) -> u64 {
        match self {
            Event::OrchestrationStarted { event_id, .. }
            | Event::ActivityScheduled { event_id, .. }
            | Event::ActivityCompleted { event_id, .. }
            | Event::ActivityFailed { event_id, .. }
            | Event::TimerCreated { event_id, .. }
            | Event::TimerFired { event_id, .. }
            | Event::ExternalSubscribed { event_id, .. }
            | Event::ExternalEvent { event_id, .. }
            | Event::SubOrchestrationScheduled { event_id, .. }
            | Event::SubOrchestrationCompleted { event_id, .. }
            | Event::SubOrchestrationFailed { event_id, .. }
            | Event::OrchestrationChained { event_id, .. }
            | Event::EntityCallScheduled { event_id, .. }
            | Event::EntityCallCompleted { event_id, .. }
            | Event::EntityCallFailed { event_id, .. }
            | Event::EntitySignaled { event_id, .. }
            | Event::SystemCall { event_id, .. }
            | Event::CustomStatusSet { event_id, .. }
            | Event::OrchestrationContinuedAsNew { event_id, .. }
            | Event::OrchestrationCompleted { event_id, .. }
            | Event::OrchestrationFailed { event_id, .. }
            | Event::OrchestrationTerminated { event_id, .. } => *event_id,
        }
    }

    pub(crate) fn set_event_id(&mut self, id: u64) {
        match self {
            Event::OrchestrationStarted { event_id, .. }
            | Event::ActivityScheduled { event_id, .. }
            | Event::ActivityCompleted { event_id, .. }
            | Event::ActivityFailed { event_id, .. }
            | Event::TimerCreated { event_id, .. }
            | Event::TimerFired { event_id, .. }
            | Event::ExternalSubscribed { event_id, .. }
            | Event::ExternalEvent { event_id, .. }
            | Event::SubOrchestrationScheduled { event_id, .. }
            | Event::SubOrchestrationCompleted { event_id, .. }
            | Event::SubOrchestrationFailed { event_id, .. }
            | Event::OrchestrationChained { event_id, .. }
            | Event::EntityCallScheduled { event_id, .. }
            | Event::EntityCallCompleted { event_id, .. }
            | Event::EntityCallFailed { event_id, .. }
            | Event::EntitySignaled { event_id, .. }
            | Event::SystemCall { event_id, .. }
            | Event::CustomStatusSet { event_id, .. }
            | Event::OrchestrationContinuedAsNew { event_id, .. }
            | Event::OrchestrationCompleted { event_id, .. }
            | Event::OrchestrationFailed { event_id, .. }
            | Event::OrchestrationTerminated { event_id, .. } => *event_id = id,
        }
    }

    /// True for records the replay cursor claims in code order.
    pub(crate) fn is_schedule(&self) -> bool {
        matches!(
            self,
            Event::ActivityScheduled { .. }
                | Event::TimerCreated { .. }
                | Event::ExternalSubscribed { .. }
                | Event::SubOrchestrationScheduled { .. }
                | Event::OrchestrationChained { .. }
                | Event::EntityCallScheduled { .. }
                | Event::EntitySignaled { .. }
                | Event::SystemCall { .. }
                | Event::CustomStatusSet { .. }
        )
    }

    pub(crate) fn label(&self) -> String {
        match self {
            Event::ActivityScheduled { name, input, .. } => format!("ActivityScheduled('{name}','{input}')"),
            Event::TimerCreated { .. } => "TimerCreated".to_string(),
            Event::ExternalSubscribed { name, .. } => format!("ExternalSubscribed('{name}')"),
            Event::SubOrchestrationScheduled { name, .. } => format!("SubOrchestrationScheduled('{name}')"),
            Event::OrchestrationChained { name, .. } => format!("OrchestrationChained('{name}')"),
            Event::EntityCallScheduled { entity, operation, .. } => {
                format!("EntityCallScheduled('{entity}','{operation}')")
            }
            Event::EntitySignaled { entity, operation, .. } => format!("EntitySignaled('{entity}','{operation}')"),
            Event::SystemCall { op, .. } => format!("SystemCall('{op}')"),
            Event::CustomStatusSet { .. } => "CustomStatusSet".to_string(),
            other => format!("{other:?}"),
        }
    }

    /// True for terminal records: nothing may be appended after one of these
    /// within the same execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. }
                | Event::OrchestrationFailed { .. }
                | Event::OrchestrationTerminated { .. }
                | Event::OrchestrationContinuedAsNew { .. }
        )
    }
}

/// A dispatch decision produced by one replay pass. Actions are only recorded
/// for scheduling events appended this pass — pure replay produces none.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    CallActivity {
        scheduling_event_id: u64,
        name: String,
        input: String,
    },
    CreateTimer {
        scheduling_event_id: u64,
        delay_ms: u64,
    },
    WaitExternal {
        scheduling_event_id: u64,
        name: String,
    },
    StartSubOrchestration {
        scheduling_event_id: u64,
        name: String,
        version: Option<String>,
        instance: String,
        input: String,
    },
    StartDetached {
        scheduling_event_id: u64,
        name: String,
        instance: String,
        input: String,
    },
    CallEntity {
        scheduling_event_id: u64,
        entity: EntityId,
        operation: String,
        input: String,
    },
    SignalEntity {
        scheduling_event_id: u64,
        entity: EntityId,
        operation: String,
        input: String,
    },
    ContinueAsNew {
        input: String,
        version: Option<String>,
    },
}

/// Context handed to activity handlers. Activities are ordinary
/// non-deterministic code; this exists for correlation in logs.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub instance: String,
    pub execution_id: u64,
    pub activity_name: String,
    pub scheduling_event_id: u64,
}

pub(crate) enum Expect<'a> {
    Activity { name: &'a str, input: &'a str },
    Timer,
    External { name: &'a str },
    SubOrchestration { name: &'a str, input: &'a str },
    Detached { name: &'a str, instance: &'a str },
    EntityCall { entity: &'a EntityId, operation: &'a str },
    EntitySignal { entity: &'a EntityId, operation: &'a str },
    SystemCall { op: &'a str },
    CustomStatus,
}

impl Expect<'_> {
    fn label(&self) -> String {
        match self {
            Expect::Activity { name, input } => format!("ActivityScheduled('{name}','{input}')"),
            Expect::Timer => "TimerCreated".to_string(),
            Expect::External { name } => format!("ExternalSubscribed('{name}')"),
            Expect::SubOrchestration { name, .. } => format!("SubOrchestrationScheduled('{name}')"),
            Expect::Detached { name, .. } => format!("OrchestrationChained('{name}')"),
            Expect::EntityCall { entity, operation } => format!("EntityCallScheduled('{entity}','{operation}')"),
            Expect::EntitySignal { entity, operation } => format!("EntitySignaled('{entity}','{operation}')"),
            Expect::SystemCall { op } => format!("SystemCall('{op}')"),
            Expect::CustomStatus => "CustomStatusSet".to_string(),
        }
    }

    fn matches(&self, event: &Event) -> bool {
        match (self, event) {
            (Expect::Activity { name, input }, Event::ActivityScheduled { name: n, input: i, .. }) => {
                n == name && i == input
            }
            (Expect::Timer, Event::TimerCreated { .. }) => true,
            (Expect::External { name }, Event::ExternalSubscribed { name: n, .. }) => n == name,
            (Expect::SubOrchestration { name, input }, Event::SubOrchestrationScheduled { name: n, input: i, .. }) => {
                n == name && i == input
            }
            (Expect::Detached { name, instance }, Event::OrchestrationChained { name: n, instance: i, .. }) => {
                n == name && i == instance
            }
            (
                Expect::EntityCall { entity, operation },
                Event::EntityCallScheduled {
                    entity: e,
                    operation: o,
                    ..
                },
            ) => e == *entity && o == operation,
            (
                Expect::EntitySignal { entity, operation },
                Event::EntitySignaled {
                    entity: e,
                    operation: o,
                    ..
                },
            ) => e == *entity && o == operation,
            (Expect::SystemCall { op }, Event::SystemCall { op: o, .. }) => o == op,
            (Expect::CustomStatus, Event::CustomStatusSet { .. }) => true,
            _ => false,
        }
    }
}

pub(crate) struct CtxInner {
    pub(crate) instance: String,
    pub(crate) execution_id: u64,
    pub(crate) orchestration_name: String,
    pub(crate) orchestration_version: String,
    pub(crate) history: Vec<Event>,
    pub(crate) next_event_id: u64,
    pub(crate) actions: Vec<Action>,
    pub(crate) claimed_schedules: HashSet<u64>,
    pub(crate) consumed_completions: HashSet<u64>,
    pub(crate) cancelled_source_ids: HashSet<u64>,
    /// Per-name count of external waits created this pass; assigns each wait
    /// its FIFO occurrence slot.
    pub(crate) external_claims: HashMap<String, usize>,
    pub(crate) guid_counter: u64,
    pub(crate) custom_status: Option<String>,
    pub(crate) nondeterminism: Option<String>,
}

impl CtxInner {
    fn new(history: Vec<Event>) -> Self {
        let (name, version) = history
            .iter()
            .find_map(|e| match e {
                Event::OrchestrationStarted { name, version, .. } => Some((name.clone(), version.clone())),
                _ => None,
            })
            .unwrap_or_default();
        let next_event_id = history.iter().map(Event::event_id).max().unwrap_or(0) + 1;
        Self {
            instance: String::new(),
            execution_id: INITIAL_EXECUTION_ID,
            orchestration_name: name,
            orchestration_version: version,
            history,
            next_event_id,
            actions: Vec::new(),
            claimed_schedules: HashSet::new(),
            consumed_completions: HashSet::new(),
            cancelled_source_ids: HashSet::new(),
            external_claims: HashMap::new(),
            guid_counter: 0,
            custom_status: None,
            nondeterminism: None,
        }
    }

    /// Claim the next unclaimed scheduling event. `Ok(None)` means history is
    /// exhausted at this cursor position (first execution of this step);
    /// `Err` means the code requested something else than history recorded —
    /// a determinism violation, reported distinctly and never reconciled.
    pub(crate) fn claim_next_schedule(&mut self, expect: &Expect<'_>) -> Result<Option<Event>, String> {
        let found = self
            .history
            .iter()
            .find(|e| e.is_schedule() && !self.claimed_schedules.contains(&e.event_id()))
            .cloned();
        let Some(event) = found else {
            return Ok(None);
        };
        if !expect.matches(&event) {
            let err = format!(
                "nondeterministic: schedule order mismatch: history has {}, code requested {}",
                event.label(),
                expect.label()
            );
            self.nondeterminism = Some(err.clone());
            return Err(err);
        }
        self.claimed_schedules.insert(event.event_id());
        Ok(Some(event))
    }

    /// Append a freshly scheduled event, claiming its id immediately.
    pub(crate) fn append_schedule(&mut self, mut event: Event) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        event.set_event_id(id);
        self.history.push(event);
        self.claimed_schedules.insert(id);
        id
    }

    pub(crate) fn record_action(&mut self, action: Action) {
        self.actions.push(action);
    }

    /// Find the completion for a scheduling id. Returns the completion's own
    /// event id (used for race arbitration) plus the decoded output.
    pub(crate) fn find_completion(&self, source: u64) -> Option<(u64, DurableOutput)> {
        self.history.iter().find_map(|e| match e {
            Event::ActivityCompleted {
                event_id,
                source_event_id,
                result,
            } if *source_event_id == source => Some((*event_id, DurableOutput::Activity(Ok(result.clone())))),
            Event::ActivityFailed {
                event_id,
                source_event_id,
                error,
            } if *source_event_id == source => Some((*event_id, DurableOutput::Activity(Err(error.clone())))),
            Event::TimerFired {
                event_id,
                source_event_id,
                ..
            } if *source_event_id == source => Some((*event_id, DurableOutput::Timer)),
            Event::SubOrchestrationCompleted {
                event_id,
                source_event_id,
                result,
            } if *source_event_id == source => Some((*event_id, DurableOutput::SubOrchestration(Ok(result.clone())))),
            Event::SubOrchestrationFailed {
                event_id,
                source_event_id,
                error,
            } if *source_event_id == source => Some((*event_id, DurableOutput::SubOrchestration(Err(error.clone())))),
            Event::EntityCallCompleted {
                event_id,
                source_event_id,
                result,
            } if *source_event_id == source => Some((*event_id, DurableOutput::EntityCall(Ok(result.clone())))),
            Event::EntityCallFailed {
                event_id,
                source_event_id,
                error,
            } if *source_event_id == source => Some((*event_id, DurableOutput::EntityCall(Err(error.clone())))),
            _ => None,
        })
    }

    /// Find the `occurrence`-th external event with the given name, in
    /// history order. Buffered events (raised before the wait point) are
    /// matched exactly like any other.
    pub(crate) fn find_external(&self, name: &str, occurrence: usize) -> Option<(u64, String)> {
        self.history
            .iter()
            .filter_map(|e| match e {
                Event::ExternalEvent {
                    event_id,
                    name: n,
                    data,
                } if n == name => Some((*event_id, data.clone())),
                _ => None,
            })
            .nth(occurrence)
    }

    fn append_system_call(&mut self, op: &str, value: String) {
        self.append_schedule(Event::SystemCall {
            event_id: 0,
            op: op.to_string(),
            value,
        });
    }
}

/// Handle through which orchestration code talks to the engine.
///
/// Cheap to clone; all `schedule_*` methods return futures that suspend the
/// orchestration until the corresponding completion exists in history.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub(crate) fn new(history: Vec<Event>, instance: String, execution_id: u64) -> Self {
        let mut inner = CtxInner::new(history);
        inner.instance = instance;
        inner.execution_id = execution_id;
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Schedule an activity invocation. Resolves to the activity's
    /// `Result<String, String>` via [`DurableFuture::into_activity`].
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::activity(self.clone(), name.into(), input.into())
    }

    /// Schedule a durable timer that fires after `delay_ms`.
    pub fn schedule_timer(&self, delay_ms: u64) -> DurableFuture {
        DurableFuture::timer(self.clone(), delay_ms)
    }

    /// Wait for an external event by name. Events raised before this wait
    /// point are buffered in history and observed exactly once; multiple
    /// waits on the same name drain arrivals FIFO.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        DurableFuture::external(self.clone(), name.into())
    }

    /// Schedule a child orchestration and wait for its terminal result.
    pub fn schedule_sub_orchestration(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::sub_orchestration(self.clone(), name.into(), None, input.into())
    }

    /// Schedule a child orchestration pinned to an explicit version.
    pub fn schedule_sub_orchestration_versioned(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        DurableFuture::sub_orchestration(self.clone(), name.into(), Some(version.into()), input.into())
    }

    /// Call an entity operation and wait for its return value.
    pub fn call_entity(
        &self,
        entity: &EntityId,
        operation: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        DurableFuture::entity_call(self.clone(), entity.clone(), operation.into(), input.into())
    }

    /// Fire-and-forget signal to an entity. Delivered at-least-once and
    /// de-duplicated by the entity's per-key sequence number.
    pub fn signal_entity(&self, entity: &EntityId, operation: impl Into<String>, input: impl Into<String>) {
        let operation = operation.into();
        let input = input.into();
        let mut inner = self.inner.lock().expect(LOCK);
        match inner.claim_next_schedule(&Expect::EntitySignal {
            entity,
            operation: &operation,
        }) {
            Ok(Some(_)) | Err(_) => {}
            Ok(None) => {
                let id = inner.append_schedule(Event::EntitySignaled {
                    event_id: 0,
                    entity: entity.clone(),
                    operation: operation.clone(),
                    input: input.clone(),
                });
                inner.record_action(Action::SignalEntity {
                    scheduling_event_id: id,
                    entity: entity.clone(),
                    operation,
                    input,
                });
            }
        }
    }

    /// Start a detached orchestration: fire-and-forget, no completion routed
    /// back. The caller picks the child instance id.
    pub fn start_orchestration(&self, name: impl Into<String>, instance: impl Into<String>, input: impl Into<String>) {
        let name = name.into();
        let instance = instance.into();
        let input = input.into();
        let mut inner = self.inner.lock().expect(LOCK);
        match inner.claim_next_schedule(&Expect::Detached {
            name: &name,
            instance: &instance,
        }) {
            Ok(Some(_)) | Err(_) => {}
            Ok(None) => {
                let id = inner.append_schedule(Event::OrchestrationChained {
                    event_id: 0,
                    name: name.clone(),
                    instance: instance.clone(),
                    input: input.clone(),
                });
                inner.record_action(Action::StartDetached {
                    scheduling_event_id: id,
                    name,
                    instance,
                    input,
                });
            }
        }
    }

    /// Race several durable futures; resolves to `(winner_index, output)`.
    /// The winner is the ready child whose completion sits earliest in
    /// history, which makes the race replay-stable.
    pub fn select(&self, children: Vec<DurableFuture>) -> crate::futures::SelectFuture {
        crate::futures::SelectFuture::new(self.clone(), children)
    }

    /// Two-way [`Self::select`], the common timeout shape.
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> crate::futures::SelectFuture {
        self.select(vec![a, b])
    }

    /// Fan-in: wait for every child and return outputs in submission order,
    /// regardless of completion order.
    pub fn join(&self, children: Vec<DurableFuture>) -> crate::futures::JoinFuture {
        crate::futures::JoinFuture::new(self.clone(), children)
    }

    /// Fan-in over result-shaped children with a configurable failure policy.
    pub fn join_results(&self, children: Vec<DurableFuture>, policy: JoinPolicy) -> crate::futures::JoinResultsFuture {
        crate::futures::JoinResultsFuture::new(self.clone(), children, policy)
    }

    /// Ask the engine to restart this instance as a fresh logical run with
    /// `input`, truncating history. Takes precedence over any value the
    /// orchestration returns in the same pass.
    pub fn continue_as_new(&self, input: impl Into<String>) {
        let mut inner = self.inner.lock().expect(LOCK);
        let input = input.into();
        inner.record_action(Action::ContinueAsNew { input, version: None });
    }

    /// Continue-as-new pinned to an explicit version of this orchestration.
    pub fn continue_as_new_versioned(&self, version: impl Into<String>, input: impl Into<String>) {
        let mut inner = self.inner.lock().expect(LOCK);
        inner.record_action(Action::ContinueAsNew {
            input: input.into(),
            version: Some(version.into()),
        });
    }

    /// Replace the instance's custom status blob, surfaced by
    /// `Client::get_status`.
    pub fn set_custom_status(&self, status: impl Into<String>) {
        let status = status.into();
        let mut inner = self.inner.lock().expect(LOCK);
        match inner.claim_next_schedule(&Expect::CustomStatus) {
            Ok(Some(Event::CustomStatusSet { status: recorded, .. })) => {
                inner.custom_status = Some(recorded);
            }
            Ok(None) => {
                inner.append_schedule(Event::CustomStatusSet {
                    event_id: 0,
                    status: status.clone(),
                });
                inner.custom_status = Some(status);
            }
            _ => {}
        }
    }

    /// Replay-stable unique id: counter-backed, recorded in history on first
    /// execution.
    pub fn new_guid(&self) -> String {
        let mut inner = self.inner.lock().expect(LOCK);
        match inner.claim_next_schedule(&Expect::SystemCall { op: SYSCALL_OP_GUID }) {
            Ok(Some(Event::SystemCall { value, .. })) => value,
            Ok(None) => {
                inner.guid_counter += 1;
                let value = format!("{}-{}-{:08x}", inner.instance, inner.execution_id, inner.guid_counter);
                inner.append_system_call(SYSCALL_OP_GUID, value.clone());
                value
            }
            _ => String::new(),
        }
    }

    /// Replay-stable current time in unix milliseconds: frozen on first
    /// execution, replayed from history thereafter.
    pub fn utcnow_ms(&self) -> u64 {
        let mut inner = self.inner.lock().expect(LOCK);
        match inner.claim_next_schedule(&Expect::SystemCall {
            op: SYSCALL_OP_UTCNOW_MS,
        }) {
            Ok(Some(Event::SystemCall { value, .. })) => value.parse().unwrap_or(0),
            Ok(None) => {
                let now = wall_clock_ms();
                inner.append_system_call(SYSCALL_OP_UTCNOW_MS, now.to_string());
                now
            }
            _ => 0,
        }
    }

    pub fn trace_debug(&self, message: impl Into<String>) {
        self.trace("DEBUG", message.into());
    }
    pub fn trace_info(&self, message: impl Into<String>) {
        self.trace("INFO", message.into());
    }
    pub fn trace_warn(&self, message: impl Into<String>) {
        self.trace("WARN", message.into());
    }
    pub fn trace_error(&self, message: impl Into<String>) {
        self.trace("ERROR", message.into());
    }

    /// Log from orchestration code without breaking determinism: the message
    /// is emitted only on first execution and silently claimed during replay.
    fn trace(&self, level: &str, message: String) {
        let op = format!("{SYSCALL_OP_TRACE_PREFIX}{level}");
        let mut inner = self.inner.lock().expect(LOCK);
        match inner.claim_next_schedule(&Expect::SystemCall { op: &op }) {
            Ok(Some(_)) | Err(_) => {}
            Ok(None) => {
                let instance = inner.instance.clone();
                let execution_id = inner.execution_id;
                let orchestration = inner.orchestration_name.clone();
                match level {
                    "ERROR" => {
                        tracing::error!(target: "taskloom::orchestration", %instance, execution_id, %orchestration, "{message}")
                    }
                    "WARN" => {
                        tracing::warn!(target: "taskloom::orchestration", %instance, execution_id, %orchestration, "{message}")
                    }
                    "DEBUG" => {
                        tracing::debug!(target: "taskloom::orchestration", %instance, execution_id, %orchestration, "{message}")
                    }
                    _ => {
                        tracing::info!(target: "taskloom::orchestration", %instance, execution_id, %orchestration, "{message}")
                    }
                }
                inner.append_system_call(&op, message);
            }
        }
    }

    /// Version tag this instance was pinned to at creation. Immutable for the
    /// instance's life; branch on it to keep old in-flight instances on the
    /// code path they started with.
    pub fn version(&self) -> semver::Version {
        let inner = self.inner.lock().expect(LOCK);
        semver::Version::parse(&inner.orchestration_version).unwrap_or_else(|_| semver::Version::new(0, 0, 0))
    }

    pub fn instance(&self) -> String {
        self.inner.lock().expect(LOCK).instance.clone()
    }

    pub fn execution_id(&self) -> u64 {
        self.inner.lock().expect(LOCK).execution_id
    }

    /// True while scheduling events remain in history that this pass has not
    /// yet re-claimed, i.e. the code is still catching up to where it was.
    pub fn is_replaying(&self) -> bool {
        let inner = self.inner.lock().expect(LOCK);
        inner
            .history
            .iter()
            .any(|e| e.is_schedule() && !inner.claimed_schedules.contains(&e.event_id()))
    }

    pub(crate) fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.inner.lock().expect(LOCK).actions)
    }
}

pub(crate) fn wall_clock_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

/// Everything one replay pass produced.
#[derive(Debug)]
pub struct TurnOutcome {
    /// Working history: baseline plus events appended by this pass.
    pub history: Vec<Event>,
    /// Dispatch decisions for newly appended scheduling events; empty on
    /// pure replay (the determinism invariant made observable).
    pub actions: Vec<Action>,
    /// `Some` once the orchestration function returned.
    pub output: Option<Result<String, String>>,
    /// Set when replay diverged from history; reported, never reconciled.
    pub nondeterminism: Option<String>,
    pub custom_status: Option<String>,
}

/// Execute one replay pass: re-run the orchestration from the top against
/// `history`, feeding recorded completions back and collecting the actions
/// that are not yet recorded. Single-threaded and cooperative — the future is
/// polled with a no-op waker and suspends the moment it needs something
/// history does not contain.
///
/// The runtime drives this through its dispatcher; it is public so replay
/// behavior can be exercised directly against a recorded history.
pub fn run_turn<F>(
    history: Vec<Event>,
    instance: &str,
    execution_id: u64,
    orchestrator: impl FnOnce(OrchestrationContext) -> F,
) -> TurnOutcome
where
    F: Future<Output = Result<String, String>>,
{
    let ctx = OrchestrationContext::new(history, instance.to_string(), execution_id);
    let mut fut = Box::pin(orchestrator(ctx.clone()));
    let waker = noop_waker();
    let mut poll_cx = Context::from_waker(&waker);

    let output = match fut.as_mut().poll(&mut poll_cx) {
        Poll::Ready(out) => Some(out),
        Poll::Pending => None,
    };
    // Drop the future before inspecting the context so clones of `ctx` held
    // inside it are released.
    drop(fut);

    let actions = ctx.take_actions();
    let inner = ctx.inner.lock().expect(LOCK);

    // Completions nothing consumed this pass: race losers (tracked in
    // `cancelled_source_ids`) are expected, anything else usually means a
    // durable future was dropped without being awaited.
    for event in &inner.history {
        let (event_id, source) = match event {
            Event::ActivityCompleted {
                event_id,
                source_event_id,
                ..
            }
            | Event::ActivityFailed {
                event_id,
                source_event_id,
                ..
            }
            | Event::TimerFired {
                event_id,
                source_event_id,
                ..
            }
            | Event::SubOrchestrationCompleted {
                event_id,
                source_event_id,
                ..
            }
            | Event::SubOrchestrationFailed {
                event_id,
                source_event_id,
                ..
            }
            | Event::EntityCallCompleted {
                event_id,
                source_event_id,
                ..
            }
            | Event::EntityCallFailed {
                event_id,
                source_event_id,
                ..
            } => (*event_id, *source_event_id),
            _ => continue,
        };
        if !inner.consumed_completions.contains(&event_id) && !inner.cancelled_source_ids.contains(&source) {
            tracing::debug!(
                target: "taskloom::replay",
                instance = %inner.instance,
                event_id,
                source_event_id = source,
                "completion not consumed this pass"
            );
        }
    }

    TurnOutcome {
        history: inner.history.clone(),
        actions,
        output,
        nondeterminism: inner.nondeterminism.clone(),
        custom_status: inner.custom_status.clone(),
    }
}
