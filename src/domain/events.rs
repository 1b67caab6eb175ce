use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stream channel a run event belongs to. Mirrors the wire-level SSE
/// `event:` field one-to-one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Metadata,
    Values,
    Messages,
    State,
    Logs,
    Tasks,
    Subgraphs,
    Debug,
    Events,
    End,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Values => "values",
            Self::Messages => "messages",
            Self::State => "state",
            Self::Logs => "logs",
            Self::Tasks => "tasks",
            Self::Subgraphs => "subgraphs",
            Self::Debug => "debug",
            Self::Events => "events",
            Self::End => "end",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "metadata" => Some(Self::Metadata),
            "values" => Some(Self::Values),
            "messages" => Some(Self::Messages),
            "state" => Some(Self::State),
            "logs" => Some(Self::Logs),
            "tasks" => Some(Self::Tasks),
            "subgraphs" => Some(Self::Subgraphs),
            "debug" => Some(Self::Debug),
            "events" => Some(Self::Events),
            "end" => Some(Self::End),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// An `end` or `error` event is always the last event of a run and the
    /// sole signal that the stream is exhausted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::End | Self::Error)
    }
}

/// One sequenced, durable, immutable unit of run output.
///
/// Identity is `(run_id, sequence)`; sequences start at 1 and are strictly
/// increasing per run with no gaps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: String,
    pub sequence: u64,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl RunEvent {
    pub fn new(run_id: &str, sequence: u64, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            run_id: run_id.to_string(),
            sequence,
            kind,
            payload,
            created_at: Utc::now(),
        }
    }
}

/// One chunk emitted by an external event source.
///
/// Sources hand back bare payloads (implicitly `values`), `(kind, payload)`
/// pairs, or `(node_path, kind, payload)` triples. The execution driver
/// decodes this shape exactly once; everything downstream works with
/// [`EventKind`] + payload.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Bare(serde_json::Value),
    Tagged(EventKind, serde_json::Value),
    Node(String, EventKind, serde_json::Value),
}

impl StreamChunk {
    /// Decompose into `(node_path, kind, payload)`.
    pub fn into_parts(self) -> (Option<String>, EventKind, serde_json::Value) {
        match self {
            Self::Bare(payload) => (None, EventKind::Values, payload),
            Self::Tagged(kind, payload) => (None, kind, payload),
            Self::Node(path, kind, payload) => (Some(path), kind, payload),
        }
    }
}
