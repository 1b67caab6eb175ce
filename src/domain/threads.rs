use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: String,
    pub status: ThreadStatus,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(user_id: String, metadata: Option<serde_json::Value>) -> Self {
        let now = Utc::now();
        Self {
            thread_id: Uuid::new_v4().to_string(),
            status: ThreadStatus::Idle,
            metadata: metadata.unwrap_or_else(|| serde_json::json!({})),
            user_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// A thread record materialized on demand when a run references a thread
    /// that was never explicitly created.
    pub fn implicit(thread_id: &str, user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            thread_id: thread_id.to_string(),
            status: ThreadStatus::Idle,
            metadata: serde_json::json!({}),
            user_id: user_id.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Idle,
    Busy,
    Interrupted,
    Error,
}

impl ThreadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Interrupted => "interrupted",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "interrupted" => Some(Self::Interrupted),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Request model for creating threads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThreadCreate {
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}
