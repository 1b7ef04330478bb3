//! Metadata derived from history, so the rest of the runtime never rescans
//! event lists by hand.

use crate::Event;

/// Snapshot of what one execution's history says about the instance.
#[derive(Debug, Clone, Default)]
pub struct HistoryReader {
    pub orchestration_name: Option<String>,
    pub orchestration_version: Option<String>,
    pub orchestration_input: Option<String>,
    pub parent_instance: Option<String>,
    pub parent_execution_id: Option<u64>,
    pub parent_id: Option<u64>,
    pub is_completed: bool,
    pub is_failed: bool,
    pub is_terminated: bool,
    pub is_continued_as_new: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub terminate_reason: Option<String>,
    pub continue_input: Option<String>,
    pub custom_status: Option<String>,
}

impl HistoryReader {
    pub fn from_history(history: &[Event]) -> Self {
        let mut reader = Self::default();
        for event in history {
            match event {
                Event::OrchestrationStarted {
                    name,
                    version,
                    input,
                    parent_instance,
                    parent_execution_id,
                    parent_id,
                    ..
                } => {
                    reader.orchestration_name = Some(name.clone());
                    reader.orchestration_version = Some(version.clone());
                    reader.orchestration_input = Some(input.clone());
                    reader.parent_instance = parent_instance.clone();
                    reader.parent_execution_id = *parent_execution_id;
                    reader.parent_id = *parent_id;
                }
                Event::CustomStatusSet { status, .. } => reader.custom_status = Some(status.clone()),
                Event::OrchestrationCompleted { output, .. } => {
                    reader.is_completed = true;
                    reader.output = Some(output.clone());
                }
                Event::OrchestrationFailed { error, .. } => {
                    reader.is_failed = true;
                    reader.error = Some(error.clone());
                }
                Event::OrchestrationTerminated { reason, .. } => {
                    reader.is_terminated = true;
                    reader.terminate_reason = Some(reason.clone());
                }
                Event::OrchestrationContinuedAsNew { input, .. } => {
                    reader.is_continued_as_new = true;
                    reader.continue_input = Some(input.clone());
                }
                _ => {}
            }
        }
        reader
    }

    /// The execution reached a terminal event; no further work may run in it.
    pub fn is_terminal(&self) -> bool {
        self.is_completed || self.is_failed || self.is_terminated || self.is_continued_as_new
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> Event {
        Event::OrchestrationStarted {
            event_id: 1,
            name: "Billing".into(),
            version: "1.2.0".into(),
            input: "{}".into(),
            parent_instance: None,
            parent_execution_id: None,
            parent_id: None,
        }
    }

    #[test]
    fn reads_descriptor_and_terminal_state() {
        let reader = HistoryReader::from_history(&[
            started(),
            Event::CustomStatusSet {
                event_id: 2,
                status: "charging".into(),
            },
            Event::OrchestrationCompleted {
                event_id: 3,
                output: "done".into(),
            },
        ]);
        assert_eq!(reader.orchestration_name.as_deref(), Some("Billing"));
        assert_eq!(reader.orchestration_version.as_deref(), Some("1.2.0"));
        assert_eq!(reader.custom_status.as_deref(), Some("charging"));
        assert!(reader.is_terminal());
        assert_eq!(reader.output.as_deref(), Some("done"));
    }

    #[test]
    fn running_history_is_not_terminal() {
        let reader = HistoryReader::from_history(&[
            started(),
            Event::ActivityScheduled {
                event_id: 2,
                name: "Charge".into(),
                input: String::new(),
            },
        ]);
        assert!(!reader.is_terminal());
    }
}
