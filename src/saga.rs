//! Compensation bookkeeping for saga-shaped orchestrations.
//!
//! Not an engine primitive: the orchestration itself pushes a compensating
//! activity after each successful forward step and unwinds the stack — in
//! last-in-first-out order — when a forward step fails. Compensations are
//! ordinary activity calls, so the unwind is as durable and replayable as
//! the forward path.

use serde::{Deserialize, Serialize};

use crate::OrchestrationContext;

/// Aggregate outcome of a saga run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum SagaOutcome {
    /// Every forward step succeeded.
    Success,
    /// A forward step failed and every compensation ran to completion.
    CompensatedFailure { error: String },
    /// A forward step failed and at least one compensation also failed.
    CompensationPartialFailure { error: String, failed: Vec<String> },
}

struct Compensation {
    activity: String,
    input: String,
}

/// LIFO stack of compensating activity calls.
#[derive(Default)]
pub struct CompensationStack {
    entries: Vec<Compensation>,
}

impl CompensationStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a compensation for a forward step that just succeeded.
    pub fn push(&mut self, activity: impl Into<String>, input: impl Into<String>) {
        self.entries.push(Compensation {
            activity: activity.into(),
            input: input.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every armed compensation, newest first. A failing compensation is
    /// recorded and the unwind continues — it is not retried here.
    pub async fn unwind(&mut self, ctx: &OrchestrationContext, error: impl Into<String>) -> SagaOutcome {
        let error = error.into();
        let mut failed = Vec::new();
        while let Some(step) = self.entries.pop() {
            match ctx
                .schedule_activity(&step.activity, &step.input)
                .into_activity()
                .await
            {
                Ok(_) => {}
                Err(e) => {
                    ctx.trace_warn(format!("compensation {} failed: {e}", step.activity));
                    failed.push(step.activity);
                }
            }
        }
        if failed.is_empty() {
            SagaOutcome::CompensatedFailure { error }
        } else {
            SagaOutcome::CompensationPartialFailure { error, failed }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serializes_with_kebab_case_status() {
        let s = serde_json::to_string(&SagaOutcome::CompensatedFailure {
            error: "no cars".into(),
        })
        .unwrap();
        assert!(s.contains("\"status\":\"compensated-failure\""));
        assert!(s.contains("no cars"));
    }

    #[test]
    fn stack_pops_in_lifo_order() {
        let mut stack = CompensationStack::new();
        stack.push("CancelFlight", "{}");
        stack.push("CancelHotel", "{}");
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.entries.pop().unwrap().activity, "CancelHotel");
        assert_eq!(stack.entries.pop().unwrap().activity, "CancelFlight");
    }
}
