//! One replay pass of one instance, in three stages: convert queued
//! completions into history events, execute the orchestration against the
//! combined history, and hand the resulting delta plus actions back for the
//! atomic ack.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

use super::state_helpers::HistoryReader;
use super::OrchestrationHandler;
use crate::providers::WorkItem;
use crate::{run_turn, Action, Event};

/// What the pass decided about the instance.
#[derive(Debug)]
pub enum TurnResult {
    /// Still running; dispatch the pending actions.
    Continue,
    Completed(String),
    Failed(String),
    ContinueAsNew { input: String, version: Option<String> },
    Terminated(String),
}

pub struct OrchestrationTurn {
    instance: String,
    execution_id: u64,
    baseline_history: Vec<Event>,
    history_delta: Vec<Event>,
    pending_actions: Vec<Action>,
    next_event_id: u64,
    nondet_error: Option<String>,
    terminate_reason: Option<String>,
    custom_status: Option<String>,
}

impl OrchestrationTurn {
    pub fn new(instance: impl Into<String>, execution_id: u64, baseline_history: Vec<Event>) -> Self {
        let next_event_id = baseline_history.iter().map(Event::event_id).max().unwrap_or(0) + 1;
        Self {
            instance: instance.into(),
            execution_id,
            baseline_history,
            history_delta: Vec::new(),
            pending_actions: Vec::new(),
            next_event_id,
            nondet_error: None,
            terminate_reason: None,
            custom_status: None,
        }
    }

    fn push_event(&mut self, mut event: Event) {
        event.set_event_id(self.next_event_id);
        self.next_event_id += 1;
        self.history_delta.push(event);
    }

    /// Seed a fresh execution with its start record.
    #[allow(clippy::too_many_arguments)]
    pub fn push_started(
        &mut self,
        name: &str,
        version: &str,
        input: &str,
        parent_instance: Option<String>,
        parent_execution_id: Option<u64>,
        parent_id: Option<u64>,
    ) {
        self.push_event(Event::OrchestrationStarted {
            event_id: 0,
            name: name.to_string(),
            version: version.to_string(),
            input: input.to_string(),
            parent_instance,
            parent_execution_id,
            parent_id,
        });
    }

    fn schedule_kind(&self, id: u64) -> Option<&'static str> {
        self.baseline_history
            .iter()
            .chain(self.history_delta.iter())
            .find_map(|e| match e {
                Event::ActivityScheduled { event_id, .. } if *event_id == id => Some("activity"),
                Event::TimerCreated { event_id, .. } if *event_id == id => Some("timer"),
                Event::SubOrchestrationScheduled { event_id, .. } if *event_id == id => Some("sub-orchestration"),
                Event::EntityCallScheduled { event_id, .. } if *event_id == id => Some("entity-call"),
                _ => None,
            })
    }

    fn completion_exists(&self, id: u64) -> bool {
        self.baseline_history
            .iter()
            .chain(self.history_delta.iter())
            .any(|e| match e {
                Event::ActivityCompleted { source_event_id, .. }
                | Event::ActivityFailed { source_event_id, .. }
                | Event::TimerFired { source_event_id, .. }
                | Event::SubOrchestrationCompleted { source_event_id, .. }
                | Event::SubOrchestrationFailed { source_event_id, .. }
                | Event::EntityCallCompleted { source_event_id, .. }
                | Event::EntityCallFailed { source_event_id, .. } => *source_event_id == id,
                _ => false,
            })
    }

    /// Record a completion if its schedule exists with the right kind;
    /// flag a determinism violation otherwise.
    fn push_completion(&mut self, id: u64, expected_kind: &'static str, event: Event) {
        if self.completion_exists(id) {
            warn!(instance = %self.instance, id, "dropping duplicate completion");
            return;
        }
        match self.schedule_kind(id) {
            Some(kind) if kind == expected_kind => self.push_event(event),
            Some(kind) => {
                self.nondet_error = Some(format!(
                    "nondeterministic: completion kind mismatch for id={id}: scheduled '{kind}', completed '{expected_kind}'"
                ));
            }
            None => {
                self.nondet_error = Some(format!(
                    "nondeterministic: no matching schedule for {expected_kind} completion id={id}"
                ));
            }
        }
    }

    /// Stage 1: convert this batch's messages into completion events.
    /// Start/continue messages are handled by the caller and skipped here.
    pub fn prep_completions(&mut self, messages: &[WorkItem]) {
        for message in messages {
            match message {
                WorkItem::StartOrchestration { .. } | WorkItem::ContinueAsNew { .. } => {}
                WorkItem::TerminateInstance { reason, .. } => {
                    if self.terminate_reason.is_none() {
                        self.terminate_reason = Some(reason.clone());
                    }
                }
                WorkItem::ActivityCompleted {
                    execution_id,
                    id,
                    result,
                    ..
                } => {
                    if *execution_id != self.execution_id {
                        warn!(instance = %self.instance, id, "dropping completion from stale execution");
                        continue;
                    }
                    self.push_completion(
                        *id,
                        "activity",
                        Event::ActivityCompleted {
                            event_id: 0,
                            source_event_id: *id,
                            result: result.clone(),
                        },
                    );
                }
                WorkItem::ActivityFailed {
                    execution_id, id, error, ..
                } => {
                    if *execution_id != self.execution_id {
                        warn!(instance = %self.instance, id, "dropping completion from stale execution");
                        continue;
                    }
                    self.push_completion(
                        *id,
                        "activity",
                        Event::ActivityFailed {
                            event_id: 0,
                            source_event_id: *id,
                            error: error.clone(),
                        },
                    );
                }
                WorkItem::TimerFired {
                    execution_id,
                    id,
                    fire_at_ms,
                    ..
                } => {
                    if *execution_id != self.execution_id {
                        warn!(instance = %self.instance, id, "dropping timer from stale execution");
                        continue;
                    }
                    self.push_completion(
                        *id,
                        "timer",
                        Event::TimerFired {
                            event_id: 0,
                            source_event_id: *id,
                            fire_at_ms: *fire_at_ms,
                        },
                    );
                }
                WorkItem::SubOrchCompleted {
                    execution_id,
                    id,
                    result,
                    ..
                } => {
                    if *execution_id != self.execution_id {
                        warn!(instance = %self.instance, id, "dropping sub-orchestration result from stale execution");
                        continue;
                    }
                    self.push_completion(
                        *id,
                        "sub-orchestration",
                        Event::SubOrchestrationCompleted {
                            event_id: 0,
                            source_event_id: *id,
                            result: result.clone(),
                        },
                    );
                }
                WorkItem::SubOrchFailed {
                    execution_id, id, error, ..
                } => {
                    if *execution_id != self.execution_id {
                        warn!(instance = %self.instance, id, "dropping sub-orchestration result from stale execution");
                        continue;
                    }
                    self.push_completion(
                        *id,
                        "sub-orchestration",
                        Event::SubOrchestrationFailed {
                            event_id: 0,
                            source_event_id: *id,
                            error: error.clone(),
                        },
                    );
                }
                WorkItem::EntityCallCompleted {
                    execution_id,
                    id,
                    result,
                    ..
                } => {
                    if *execution_id != self.execution_id {
                        warn!(instance = %self.instance, id, "dropping entity result from stale execution");
                        continue;
                    }
                    self.push_completion(
                        *id,
                        "entity-call",
                        Event::EntityCallCompleted {
                            event_id: 0,
                            source_event_id: *id,
                            result: result.clone(),
                        },
                    );
                }
                WorkItem::EntityCallFailed {
                    execution_id, id, error, ..
                } => {
                    if *execution_id != self.execution_id {
                        warn!(instance = %self.instance, id, "dropping entity result from stale execution");
                        continue;
                    }
                    self.push_completion(
                        *id,
                        "entity-call",
                        Event::EntityCallFailed {
                            event_id: 0,
                            source_event_id: *id,
                            error: error.clone(),
                        },
                    );
                }
                // Buffered unconditionally: the wait point drains by name,
                // whenever the code reaches it.
                WorkItem::ExternalRaised { name, data, .. } => {
                    self.push_event(Event::ExternalEvent {
                        event_id: 0,
                        name: name.clone(),
                        data: data.clone(),
                    });
                }
                other => {
                    warn!(instance = %self.instance, kind = other.kind(), "unexpected item on orchestrator queue");
                }
            }
        }
        debug!(
            instance = %self.instance,
            completions = self.history_delta.len(),
            "completion events staged"
        );
    }

    /// Stage 2: run the orchestration function against baseline + staged
    /// completions. Panics inside orchestration code fail the instance.
    pub fn execute(&mut self, handler: Arc<dyn OrchestrationHandler>, input: String) -> TurnResult {
        if let Some(reason) = self.terminate_reason.clone() {
            return TurnResult::Terminated(reason);
        }
        if let Some(err) = self.nondet_error.clone() {
            return TurnResult::Failed(err);
        }

        let mut working = self.baseline_history.clone();
        working.extend(self.history_delta.clone());
        let working_len = working.len();

        let instance = self.instance.clone();
        let execution_id = self.execution_id;
        let run = catch_unwind(AssertUnwindSafe(|| {
            run_turn(working, &instance, execution_id, move |ctx| {
                let handler = handler.clone();
                let input = input.clone();
                async move { handler.invoke(ctx, input).await }
            })
        }));

        let outcome = match run {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "orchestration panicked".to_string()
                };
                return TurnResult::Failed(message);
            }
        };

        if let Some(err) = outcome.nondeterminism {
            self.nondet_error = Some(err.clone());
            return TurnResult::Failed(err);
        }

        if outcome.history.len() > working_len {
            self.history_delta.extend(outcome.history[working_len..].to_vec());
        }
        self.next_event_id = outcome.history.iter().map(Event::event_id).max().unwrap_or(0) + 1;
        if outcome.custom_status.is_some() {
            self.custom_status = outcome.custom_status;
        }
        self.pending_actions = outcome.actions;

        // Continue-as-new beats whatever the function returned this pass.
        for action in &self.pending_actions {
            if let Action::ContinueAsNew { input, version } = action {
                return TurnResult::ContinueAsNew {
                    input: input.clone(),
                    version: version.clone(),
                };
            }
        }

        match outcome.output {
            Some(Ok(output)) => TurnResult::Completed(output),
            Some(Err(error)) => TurnResult::Failed(error),
            None => TurnResult::Continue,
        }
    }

    /// Terminal record helpers; exactly one is appended per finished pass.
    pub fn push_completed(&mut self, output: &str) {
        self.push_event(Event::OrchestrationCompleted {
            event_id: 0,
            output: output.to_string(),
        });
    }

    pub fn push_failed(&mut self, error: &str) {
        self.push_event(Event::OrchestrationFailed {
            event_id: 0,
            error: error.to_string(),
        });
    }

    pub fn push_terminated(&mut self, reason: &str) {
        self.push_event(Event::OrchestrationTerminated {
            event_id: 0,
            reason: reason.to_string(),
        });
    }

    pub fn push_continued_as_new(&mut self, input: &str) {
        self.push_event(Event::OrchestrationContinuedAsNew {
            event_id: 0,
            input: input.to_string(),
        });
    }

    pub fn history_delta(&self) -> &[Event] {
        &self.history_delta
    }

    pub fn into_history_delta(self) -> Vec<Event> {
        self.history_delta
    }

    pub fn pending_actions(&self) -> &[Action] {
        &self.pending_actions
    }

    pub fn custom_status(&self) -> Option<&str> {
        self.custom_status.as_deref()
    }

    /// Terminate request found in this batch, if any.
    pub fn terminate_request(&self) -> Option<String> {
        self.terminate_reason.clone()
    }

    /// Descriptor of the execution as seeded so far (baseline + delta).
    pub fn reader(&self) -> HistoryReader {
        let mut all = self.baseline_history.clone();
        all.extend(self.history_delta.clone());
        HistoryReader::from_history(&all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline() -> Vec<Event> {
        vec![
            Event::OrchestrationStarted {
                event_id: 1,
                name: "O".into(),
                version: "1.0.0".into(),
                input: String::new(),
                parent_instance: None,
                parent_execution_id: None,
                parent_id: None,
            },
            Event::ActivityScheduled {
                event_id: 2,
                name: "A".into(),
                input: "x".into(),
            },
        ]
    }

    #[test]
    fn completion_becomes_history_event() {
        let mut turn = OrchestrationTurn::new("i", 1, baseline());
        turn.prep_completions(&[WorkItem::ActivityCompleted {
            instance: "i".into(),
            execution_id: 1,
            id: 2,
            result: "ok".into(),
        }]);
        assert_eq!(turn.history_delta().len(), 1);
        assert!(matches!(
            turn.history_delta()[0],
            Event::ActivityCompleted { source_event_id: 2, .. }
        ));
    }

    #[test]
    fn stale_execution_completions_are_dropped() {
        let mut turn = OrchestrationTurn::new("i", 2, baseline());
        turn.prep_completions(&[WorkItem::ActivityCompleted {
            instance: "i".into(),
            execution_id: 1,
            id: 2,
            result: "ok".into(),
        }]);
        assert!(turn.history_delta().is_empty());
    }

    #[test]
    fn completion_without_schedule_is_nondeterministic() {
        let mut turn = OrchestrationTurn::new("i", 1, baseline());
        turn.prep_completions(&[WorkItem::ActivityCompleted {
            instance: "i".into(),
            execution_id: 1,
            id: 99,
            result: "ok".into(),
        }]);
        assert!(turn.nondet_error.as_deref().unwrap_or("").contains("nondeterministic"));
    }

    #[test]
    fn completion_kind_mismatch_is_nondeterministic() {
        let mut turn = OrchestrationTurn::new("i", 1, baseline());
        turn.prep_completions(&[WorkItem::TimerFired {
            instance: "i".into(),
            execution_id: 1,
            id: 2,
            fire_at_ms: 0,
        }]);
        let err = turn.nondet_error.clone().unwrap();
        assert!(err.contains("kind mismatch"));
    }
}
