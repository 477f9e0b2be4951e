use serde::{Deserialize, Serialize};

use crate::ids::RunId;

/// Run lifecycle state machine.
///
/// queued → in_progress → {requires_action, completed, failed, cancelled, expired}
///
/// All five right-hand statuses are terminal for streaming: they close the
/// event stream. `completed`, `failed`, `cancelled` and `expired` are frozen
/// for good; `requires_action` alone may re-enter `in_progress` when a chained
/// child re-invokes its parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl RunStatus {
    /// Terminal for streaming: closes the event stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::InProgress)
    }

    /// Frozen for good; not even a chained re-invocation reopens these.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::Expired)
    }

    /// Whether the state machine permits moving from `self` to `to`.
    pub fn can_transition(&self, to: RunStatus) -> bool {
        match self {
            Self::Queued => matches!(to, Self::InProgress | Self::Cancelled | Self::Expired),
            Self::InProgress => to.is_terminal(),
            Self::RequiresAction => matches!(to, Self::InProgress),
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "requires_action" => Ok(Self::RequiresAction),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// How a run relates to its parent once it finishes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Simple,
    WithCallback,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple => f.write_str("simple"),
            Self::WithCallback => f.write_str("with_callback"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(Self::Simple),
            "with_callback" => Ok(Self::WithCallback),
            other => Err(format!("unknown run mode: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Assistant => f.write_str("assistant"),
            Self::System => f.write_str("system"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

/// Caller-supplied execution parameters for a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunParams {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_true")]
    pub record_run: bool,
    #[serde(default)]
    pub tool_resources: Option<serde_json::Value>,
    #[serde(default)]
    pub user_env_vars: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub stream: bool,
    /// Future timestamp (RFC 3339) that defers the run to the scheduler.
    #[serde(default)]
    pub schedule_at: Option<String>,
    #[serde(default)]
    pub parent_run_id: Option<RunId>,
    #[serde(default)]
    pub run_mode: RunMode,
}

fn default_max_iterations() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            model: None,
            instructions: None,
            max_iterations: default_max_iterations(),
            record_run: true,
            tool_resources: None,
            user_env_vars: std::collections::HashMap::new(),
            stream: false,
            schedule_at: None,
            parent_run_id: None,
            run_mode: RunMode::Simple,
        }
    }
}

impl RunParams {
    /// Clamp a possibly-malformed iteration count to a positive integer.
    /// Ledger payloads default to 1 when the field is missing or bad.
    pub fn clamp_iterations(raw: Option<i64>) -> u32 {
        match raw {
            Some(n) if n >= 1 => n.min(u32::MAX as i64) as u32,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_advances_to_in_progress() {
        assert!(RunStatus::Queued.can_transition(RunStatus::InProgress));
        assert!(!RunStatus::Queued.can_transition(RunStatus::Completed));
    }

    #[test]
    fn in_progress_reaches_all_terminals() {
        for terminal in [
            RunStatus::RequiresAction,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::Expired,
        ] {
            assert!(RunStatus::InProgress.can_transition(terminal), "{terminal}");
        }
    }

    #[test]
    fn final_statuses_are_frozen() {
        for status in [
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::Expired,
        ] {
            assert!(status.is_terminal());
            assert!(status.is_final());
            assert!(!status.can_transition(RunStatus::InProgress));
            assert!(!status.can_transition(RunStatus::Completed));
            assert!(!status.can_transition(RunStatus::Queued));
        }
    }

    #[test]
    fn requires_action_closes_stream_but_can_reenter() {
        assert!(RunStatus::RequiresAction.is_terminal());
        assert!(!RunStatus::RequiresAction.is_final());
        assert!(RunStatus::RequiresAction.can_transition(RunStatus::InProgress));
        assert!(!RunStatus::RequiresAction.can_transition(RunStatus::Completed));
        assert!(!RunStatus::RequiresAction.can_transition(RunStatus::Queued));
    }

    #[test]
    fn no_backward_transition_to_queued() {
        assert!(!RunStatus::InProgress.can_transition(RunStatus::Queued));
    }

    #[test]
    fn status_display_from_str_roundtrip() {
        for status in [
            RunStatus::Queued,
            RunStatus::InProgress,
            RunStatus::RequiresAction,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::Expired,
        ] {
            let parsed: RunStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<RunStatus>().is_err());
    }

    #[test]
    fn run_mode_roundtrip() {
        assert_eq!("simple".parse::<RunMode>().unwrap(), RunMode::Simple);
        assert_eq!(
            "with_callback".parse::<RunMode>().unwrap(),
            RunMode::WithCallback
        );
        assert!("callback".parse::<RunMode>().is_err());
    }

    #[test]
    fn role_rejects_unknown() {
        assert!("user".parse::<MessageRole>().is_ok());
        assert!("bot".parse::<MessageRole>().is_err());
    }

    #[test]
    fn params_defaults() {
        let params: RunParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.max_iterations, 10);
        assert!(params.record_run);
        assert!(!params.stream);
        assert_eq!(params.run_mode, RunMode::Simple);
    }

    #[test]
    fn clamp_iterations_handles_garbage() {
        assert_eq!(RunParams::clamp_iterations(Some(5)), 5);
        assert_eq!(RunParams::clamp_iterations(Some(0)), 1);
        assert_eq!(RunParams::clamp_iterations(Some(-3)), 1);
        assert_eq!(RunParams::clamp_iterations(None), 1);
    }
}
