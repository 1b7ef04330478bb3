//! Pollable primitives behind `ctx.schedule_*`.
//!
//! A [`DurableFuture`] claims its scheduling event on first poll: during
//! replay it adopts the next unclaimed scheduling record (order-checked), on
//! first execution it appends a new record and emits a dispatch [`Action`].
//! It resolves once a completion event referencing that record exists in
//! history. Polling happens under the turn's no-op waker, so `Pending` means
//! "suspend the orchestration", not "try again later".

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{Action, EntityId, Event, Expect, OrchestrationContext};

const LOCK: &str = "orchestration context lock poisoned";

/// Output of a resolved [`DurableFuture`].
#[derive(Debug, Clone, PartialEq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
    SubOrchestration(Result<String, String>),
    EntityCall(Result<String, String>),
}

/// Failure policy for [`OrchestrationContext::join_results`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPolicy {
    /// Wait for every child, then surface the temporally-first failure (the
    /// reference fan-out shape: order-preserving arrays, fail after drain).
    WaitAll,
    /// Resolve with the first consumable failure; remaining children stay
    /// tracked in history but their results are discarded.
    FailFast,
}

enum Kind {
    Activity {
        name: String,
        input: String,
    },
    Timer {
        delay_ms: u64,
    },
    External {
        name: String,
    },
    SubOrchestration {
        name: String,
        version: Option<String>,
        input: String,
    },
    EntityCall {
        entity: EntityId,
        operation: String,
        input: String,
    },
}

/// A single durable suspension point. See the module docs for the claim /
/// probe / consume lifecycle.
#[must_use = "durable futures do nothing unless awaited"]
pub struct DurableFuture {
    ctx: OrchestrationContext,
    kind: Kind,
    /// Scheduling event id, set on first poll.
    claimed: Cell<Option<u64>>,
    /// FIFO occurrence slot for external waits (nth wait on this name).
    occurrence: Cell<Option<usize>>,
    done: Cell<bool>,
}

impl DurableFuture {
    pub(crate) fn activity(ctx: OrchestrationContext, name: String, input: String) -> Self {
        Self::new(ctx, Kind::Activity { name, input })
    }

    pub(crate) fn timer(ctx: OrchestrationContext, delay_ms: u64) -> Self {
        Self::new(ctx, Kind::Timer { delay_ms })
    }

    pub(crate) fn external(ctx: OrchestrationContext, name: String) -> Self {
        Self::new(ctx, Kind::External { name })
    }

    pub(crate) fn sub_orchestration(
        ctx: OrchestrationContext,
        name: String,
        version: Option<String>,
        input: String,
    ) -> Self {
        Self::new(ctx, Kind::SubOrchestration { name, version, input })
    }

    pub(crate) fn entity_call(ctx: OrchestrationContext, entity: EntityId, operation: String, input: String) -> Self {
        Self::new(ctx, Kind::EntityCall { entity, operation, input })
    }

    fn new(ctx: OrchestrationContext, kind: Kind) -> Self {
        Self {
            ctx,
            kind,
            claimed: Cell::new(None),
            occurrence: Cell::new(None),
            done: Cell::new(false),
        }
    }

    pub(crate) fn claimed_id(&self) -> Option<u64> {
        self.claimed.get()
    }

    /// Claim this future's scheduling event: adopt it from history, or append
    /// it and record the dispatch action. No-op once claimed or after a
    /// determinism violation has been flagged.
    pub(crate) fn ensure_claimed(&self) {
        if self.claimed.get().is_some() {
            return;
        }
        let mut inner = self.ctx.inner.lock().expect(LOCK);
        if inner.nondeterminism.is_some() {
            return;
        }
        match &self.kind {
            Kind::Activity { name, input } => match inner.claim_next_schedule(&Expect::Activity { name, input }) {
                Ok(Some(ev)) => self.claimed.set(Some(ev.event_id())),
                Ok(None) => {
                    let id = inner.append_schedule(Event::ActivityScheduled {
                        event_id: 0,
                        name: name.clone(),
                        input: input.clone(),
                    });
                    inner.record_action(Action::CallActivity {
                        scheduling_event_id: id,
                        name: name.clone(),
                        input: input.clone(),
                    });
                    self.claimed.set(Some(id));
                }
                Err(_) => {}
            },
            Kind::Timer { delay_ms } => match inner.claim_next_schedule(&Expect::Timer) {
                Ok(Some(ev)) => self.claimed.set(Some(ev.event_id())),
                Ok(None) => {
                    let id = inner.append_schedule(Event::TimerCreated {
                        event_id: 0,
                        delay_ms: *delay_ms,
                    });
                    inner.record_action(Action::CreateTimer {
                        scheduling_event_id: id,
                        delay_ms: *delay_ms,
                    });
                    self.claimed.set(Some(id));
                }
                Err(_) => {}
            },
            Kind::External { name } => {
                match inner.claim_next_schedule(&Expect::External { name }) {
                    Ok(Some(ev)) => self.claimed.set(Some(ev.event_id())),
                    Ok(None) => {
                        let id = inner.append_schedule(Event::ExternalSubscribed {
                            event_id: 0,
                            name: name.clone(),
                        });
                        inner.record_action(Action::WaitExternal {
                            scheduling_event_id: id,
                            name: name.clone(),
                        });
                        self.claimed.set(Some(id));
                    }
                    Err(_) => return,
                }
                // Same-named waits drain arrivals FIFO: each wait takes the
                // next occurrence slot in code order.
                let slot = inner.external_claims.entry(name.clone()).or_insert(0);
                self.occurrence.set(Some(*slot));
                *slot += 1;
            }
            Kind::SubOrchestration { name, version, input } => {
                match inner.claim_next_schedule(&Expect::SubOrchestration { name, input }) {
                    Ok(Some(ev)) => self.claimed.set(Some(ev.event_id())),
                    Ok(None) => {
                        // Child instance id derives from the scheduling ordinal,
                        // so it is identical on every replay.
                        let id = inner.next_event_id;
                        let child_instance = format!("{}::sub-{}", inner.instance, id);
                        inner.append_schedule(Event::SubOrchestrationScheduled {
                            event_id: 0,
                            name: name.clone(),
                            version: version.clone(),
                            instance: child_instance.clone(),
                            input: input.clone(),
                        });
                        inner.record_action(Action::StartSubOrchestration {
                            scheduling_event_id: id,
                            name: name.clone(),
                            version: version.clone(),
                            instance: child_instance,
                            input: input.clone(),
                        });
                        self.claimed.set(Some(id));
                    }
                    Err(_) => {}
                }
            }
            Kind::EntityCall { entity, operation, input } => {
                match inner.claim_next_schedule(&Expect::EntityCall { entity, operation }) {
                    Ok(Some(ev)) => self.claimed.set(Some(ev.event_id())),
                    Ok(None) => {
                        let id = inner.append_schedule(Event::EntityCallScheduled {
                            event_id: 0,
                            entity: entity.clone(),
                            operation: operation.clone(),
                            input: input.clone(),
                        });
                        inner.record_action(Action::CallEntity {
                            scheduling_event_id: id,
                            entity: entity.clone(),
                            operation: operation.clone(),
                            input: input.clone(),
                        });
                        self.claimed.set(Some(id));
                    }
                    Err(_) => {}
                }
            }
        }
    }

    /// Peek at this future's completion without consuming it. Returns the
    /// completion's own event id — the arbitration key for races.
    pub(crate) fn probe(&self) -> Option<(u64, DurableOutput)> {
        if self.done.get() {
            return None;
        }
        let claimed = self.claimed.get()?;
        let inner = self.ctx.inner.lock().expect(LOCK);
        match &self.kind {
            Kind::External { name } => {
                let occurrence = self.occurrence.get().unwrap_or(0);
                inner
                    .find_external(name, occurrence)
                    .map(|(event_id, data)| (event_id, DurableOutput::External(data)))
            }
            _ => inner.find_completion(claimed),
        }
    }

    pub(crate) fn consume(&self, completion_event_id: u64) {
        let mut inner = self.ctx.inner.lock().expect(LOCK);
        inner.consumed_completions.insert(completion_event_id);
        self.done.set(true);
    }

    fn mark_cancelled(&self) {
        if let Some(id) = self.claimed.get() {
            let mut inner = self.ctx.inner.lock().expect(LOCK);
            inner.cancelled_source_ids.insert(id);
        }
    }

    /// Await as an activity result.
    pub fn into_activity(self) -> ActivityResultFuture {
        ActivityResultFuture(self)
    }

    /// Await as a timer; resolves to `()` when it fires.
    pub fn into_timer(self) -> TimerFiredFuture {
        TimerFiredFuture(self)
    }

    /// Await as an external event payload.
    pub fn into_event(self) -> ExternalDataFuture {
        ExternalDataFuture(self)
    }

    /// Await as a sub-orchestration result.
    pub fn into_sub_orchestration(self) -> SubOrchestrationResultFuture {
        SubOrchestrationResultFuture(self)
    }

    /// Await as an entity call result.
    pub fn into_entity_call(self) -> EntityCallResultFuture {
        EntityCallResultFuture(self)
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done.get() {
            return Poll::Pending;
        }
        this.ensure_claimed();
        if let Some((completion_event_id, output)) = this.probe() {
            this.consume(completion_event_id);
            return Poll::Ready(output);
        }
        Poll::Pending
    }
}

// poll() projects freely into the inner cells; keep that sound.
const fn assert_unpin<T: Unpin>() {}
const _: () = assert_unpin::<DurableFuture>();

macro_rules! typed_future {
    ($name:ident, $output:ty, $variant:ident => $map:expr, $expected:literal) => {
        #[must_use = "durable futures do nothing unless awaited"]
        pub struct $name(DurableFuture);

        impl Future for $name {
            type Output = $output;
            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                match Pin::new(&mut self.0).poll(cx) {
                    Poll::Ready(DurableOutput::$variant(out)) => Poll::Ready($map(out)),
                    Poll::Ready(other) => {
                        panic!("awaited {} on a {:?} completion", $expected, other)
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    };
}

typed_future!(ActivityResultFuture, Result<String, String>, Activity => |r| r, "an activity");
typed_future!(ExternalDataFuture, String, External => |d| d, "an external event");
typed_future!(SubOrchestrationResultFuture, Result<String, String>, SubOrchestration => |r| r, "a sub-orchestration");
typed_future!(EntityCallResultFuture, Result<String, String>, EntityCall => |r| r, "an entity call");

#[must_use = "durable futures do nothing unless awaited"]
pub struct TimerFiredFuture(DurableFuture);

impl Future for TimerFiredFuture {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(DurableOutput::Timer) => Poll::Ready(()),
            Poll::Ready(other) => panic!("awaited a timer on a {other:?} completion"),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Race over durable futures. The winner is the ready child whose completion
/// event sits earliest in history — an arbitration that is identical on every
/// replay because event ids are history ordinals. Losers are left unconsumed;
/// their completions keep landing in history but are discarded.
#[must_use = "durable futures do nothing unless awaited"]
pub struct SelectFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
}

impl SelectFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self { ctx, children }
    }
}

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        // All children claim first, even the eventual losers: their
        // scheduling records must exist so later replays line up.
        for child in &this.children {
            child.ensure_claimed();
        }
        if this.ctx.inner.lock().expect(LOCK).nondeterminism.is_some() {
            return Poll::Pending;
        }

        let mut winner: Option<(u64, usize, DurableOutput)> = None;
        for (index, child) in this.children.iter().enumerate() {
            if let Some((event_id, output)) = child.probe() {
                let better = winner.as_ref().map_or(true, |(best, _, _)| event_id < *best);
                if better {
                    winner = Some((event_id, index, output));
                }
            }
        }

        if let Some((event_id, index, output)) = winner {
            this.children[index].consume(event_id);
            for (i, child) in this.children.iter().enumerate() {
                if i != index {
                    child.mark_cancelled();
                }
            }
            return Poll::Ready((index, output));
        }
        Poll::Pending
    }
}

/// Fan-in over durable futures: resolves once every child has a completion,
/// returning outputs in original submission order regardless of completion
/// order.
#[must_use = "durable futures do nothing unless awaited"]
pub struct JoinFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
}

impl JoinFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self { ctx, children }
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for child in &this.children {
            child.ensure_claimed();
        }
        if this.ctx.inner.lock().expect(LOCK).nondeterminism.is_some() {
            return Poll::Pending;
        }

        let mut ready = Vec::with_capacity(this.children.len());
        for child in &this.children {
            match child.probe() {
                Some(hit) => ready.push(hit),
                None => return Poll::Pending,
            }
        }
        let outputs = this
            .children
            .iter()
            .zip(ready)
            .map(|(child, (event_id, output))| {
                child.consume(event_id);
                output
            })
            .collect();
        Poll::Ready(outputs)
    }
}

/// Fan-in specialised for result-shaped children, with a configurable
/// failure policy.
#[must_use = "durable futures do nothing unless awaited"]
pub struct JoinResultsFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
    policy: JoinPolicy,
}

impl JoinResultsFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>, policy: JoinPolicy) -> Self {
        Self { ctx, children, policy }
    }
}

fn result_of(output: DurableOutput) -> Result<String, String> {
    match output {
        DurableOutput::Activity(r) | DurableOutput::SubOrchestration(r) | DurableOutput::EntityCall(r) => r,
        DurableOutput::External(data) => Ok(data),
        DurableOutput::Timer => Ok(String::new()),
    }
}

impl Future for JoinResultsFuture {
    type Output = Result<Vec<String>, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for child in &this.children {
            child.ensure_claimed();
        }
        if this.ctx.inner.lock().expect(LOCK).nondeterminism.is_some() {
            return Poll::Pending;
        }

        let probes: Vec<Option<(u64, DurableOutput)>> = this.children.iter().map(DurableFuture::probe).collect();

        if this.policy == JoinPolicy::FailFast {
            // First consumable failure (by history position) resolves the
            // aggregate; the rest stay tracked but unobserved.
            let first_failure = probes
                .iter()
                .enumerate()
                .filter_map(|(i, p)| match p {
                    Some((event_id, output)) => result_of(output.clone()).err().map(|e| (*event_id, i, e)),
                    None => None,
                })
                .min_by_key(|(event_id, _, _)| *event_id);
            if let Some((event_id, index, error)) = first_failure {
                this.children[index].consume(event_id);
                for (i, child) in this.children.iter().enumerate() {
                    if i != index {
                        child.mark_cancelled();
                    }
                }
                return Poll::Ready(Err(error));
            }
        }

        if probes.iter().any(Option::is_none) {
            return Poll::Pending;
        }

        let mut values = Vec::with_capacity(this.children.len());
        let mut first_failure: Option<(u64, String)> = None;
        for (child, probe) in this.children.iter().zip(probes) {
            let (event_id, output) = probe.expect("all probes checked ready");
            child.consume(event_id);
            match result_of(output) {
                Ok(v) => values.push(v),
                Err(e) => {
                    let earlier = first_failure.as_ref().map_or(true, |(best, _)| event_id < *best);
                    if earlier {
                        first_failure = Some((event_id, e));
                    }
                }
            }
        }
        match first_failure {
            Some((_, error)) => Poll::Ready(Err(error)),
            None => Poll::Ready(Ok(values)),
        }
    }
}
