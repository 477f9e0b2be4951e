use serde::{Deserialize, Serialize};

use crate::run::RunStatus;

/// Synthetic lifecycle kinds enqueued before any delta so every subscriber
/// observes a consistent opening sequence.
pub const OPENING_SEQUENCE: [&str; 4] = [
    "run.created",
    "run.queued",
    "run.in_progress",
    "step.created",
];

pub const STEP_IN_PROGRESS: &str = "step.in_progress";

/// Wire envelope for one server-push event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamEnvelope {
    pub event: String,
    pub data: serde_json::Value,
}

impl StreamEnvelope {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Terminal event for a run that reached `status`.
    pub fn terminal(status: RunStatus, data: serde_json::Value) -> Self {
        Self::new(terminal_kind(status), data)
    }

    pub fn is_terminal(&self) -> bool {
        is_terminal_kind(&self.event)
    }

    /// The whole envelope as one JSON object: `{"event": .., "data": ..}`.
    /// The event kind stays inside the body; nothing rides in SSE fields.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            // Envelope payloads are serde_json::Value, so this only fires on
            // pathological map keys. Degrade to an error frame.
            r#"{"event":"error","data":{}}"#.to_string()
        })
    }

    /// Newline-delimited SSE frame: `data: <json>\n\n`.
    pub fn to_sse_frame(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }
}

/// Map a terminal run status to its stream event kind.
pub fn terminal_kind(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Completed => "run.completed",
        RunStatus::Failed => "run.failed",
        RunStatus::Cancelled => "run.cancelled",
        RunStatus::Expired => "run.expired",
        RunStatus::RequiresAction => "run.requires_action",
        // Non-terminal statuses never close a stream; keep the mapping total
        // so callers cannot panic on a race.
        RunStatus::Queued => "run.queued",
        RunStatus::InProgress => "run.in_progress",
    }
}

pub fn is_terminal_kind(kind: &str) -> bool {
    matches!(
        kind,
        "run.completed" | "run.failed" | "run.cancelled" | "run.expired" | "run.requires_action"
    )
}
