use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::state::{StepStatus, WorkflowStatus};

/// Stable, external-consumer-facing event kind names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    #[serde(rename = "workflow.start")]
    WorkflowStart,
    #[serde(rename = "workflow.complete")]
    WorkflowComplete,
    #[serde(rename = "workflow.fail")]
    WorkflowFail,
    #[serde(rename = "workflow.pause")]
    WorkflowPause,
    #[serde(rename = "workflow.resume")]
    WorkflowResume,
    #[serde(rename = "workflow.cancel")]
    WorkflowCancel,
    #[serde(rename = "step.start")]
    StepStart,
    #[serde(rename = "step.complete")]
    StepComplete,
    #[serde(rename = "step.fail")]
    StepFail,
    #[serde(rename = "step.retry")]
    StepRetry,
    #[serde(rename = "step.skip")]
    StepSkip,
    #[serde(rename = "step.cancel")]
    StepCancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub execution_id: String,
    pub workflow_id: String,
    pub step_id: Option<String>,
    pub previous_status: Option<String>,
    pub new_status: Option<String>,
    pub attempt: Option<u32>,
    pub message: Option<String>,
}

impl WorkflowEvent {
    pub fn workflow(
        kind: EventKind,
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
        previous: Option<WorkflowStatus>,
        new: WorkflowStatus,
    ) -> Self {
        WorkflowEvent {
            kind,
            timestamp: Utc::now(),
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            step_id: None,
            previous_status: previous.map(|s| format!("{s:?}")),
            new_status: Some(format!("{new:?}")),
            attempt: None,
            message: None,
        }
    }

    pub fn step(
        kind: EventKind,
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
        step_id: impl Into<String>,
        previous: Option<StepStatus>,
        new: StepStatus,
        attempt: u32,
    ) -> Self {
        WorkflowEvent {
            kind,
            timestamp: Utc::now(),
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            step_id: Some(step_id.into()),
            previous_status: previous.map(|s| format!("{s:?}")),
            new_status: Some(format!("{new:?}")),
            attempt: Some(attempt),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Fan-out point for workflow/step lifecycle events. Backed by a bounded broadcast channel
/// so a slow or dead subscriber can never block publishers or other subscribers — it only
/// loses its own oldest unread events (standard `tokio::sync::broadcast` lag semantics).
pub struct EventHub {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventHub { sender }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // No receivers is a normal, frequent case (nobody subscribed yet); ignore the error.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Runs a subscriber's handler in its own task so a panic or error there can never affect
/// the engine or other subscribers.
pub fn spawn_isolated_subscriber<F>(mut receiver: broadcast::Receiver<WorkflowEvent>, mut handler: F)
where
    F: FnMut(WorkflowEvent) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        handler(event)
                    }));
                    if result.is_err() {
                        warn!("event subscriber handler panicked; continuing");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, some events were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events_in_order() {
        let hub = EventHub::new(16);
        let mut rx = hub.subscribe();

        hub.publish(WorkflowEvent::workflow(
            EventKind::WorkflowStart,
            "exec-1",
            "wf-1",
            None,
            WorkflowStatus::Running,
        ));
        hub.publish(WorkflowEvent::workflow(
            EventKind::WorkflowComplete,
            "exec-1",
            "wf-1",
            Some(WorkflowStatus::Running),
            WorkflowStatus::Completed,
        ));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::WorkflowStart);
        assert_eq!(second.kind, EventKind::WorkflowComplete);
    }

    #[tokio::test]
    async fn publishing_with_no_subscribers_does_not_error() {
        let hub = EventHub::new(4);
        hub.publish(WorkflowEvent::workflow(
            EventKind::WorkflowStart,
            "exec-1",
            "wf-1",
            None,
            WorkflowStatus::Running,
        ));
    }
}
