use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub thread_id: String,
    pub assistant_id: String,
    pub status: RunStatus,
    pub input: serde_json::Value,
    pub config: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(thread_id: String, user_id: String, req: RunCreate) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            thread_id,
            assistant_id: req.assistant_id,
            status: RunStatus::Pending,
            input: req.input,
            config: req.config,
            output: None,
            error_message: None,
            user_id,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Streaming,
    Completed,
    Failed,
    Cancelled,
    Interrupted,
}

impl RunStatus {
    /// Terminal statuses never change again; `interrupted` is terminal for
    /// lifecycle purposes even though the graph could in principle resume.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Interrupted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "streaming" => Some(Self::Streaming),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "interrupted" => Some(Self::Interrupted),
            _ => None,
        }
    }
}

/// Request model for creating runs.
#[derive(Debug, Clone, Deserialize)]
pub struct RunCreate {
    pub assistant_id: String,
    pub input: serde_json::Value,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    /// Explicit opt-in: cancel the run if the creating stream client
    /// disconnects before the run reaches a terminal state.
    #[serde(default)]
    pub cancel_on_disconnect: bool,
}

#[derive(Debug, Serialize)]
pub struct RunList {
    pub runs: Vec<Run>,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::Interrupted.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Streaming.is_terminal());
    }

    #[test]
    fn status_round_trip() {
        for s in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Streaming,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::Interrupted,
        ] {
            assert_eq!(RunStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(RunStatus::parse("nope"), None);
    }
}
