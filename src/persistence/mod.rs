use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::events::{EventKind, RunEvent};
use crate::domain::runs::{Run, RunStatus};
use crate::domain::threads::{Thread, ThreadStatus};

pub mod providers;

/// CRUD persistence for assistants/threads/runs metadata.
///
/// `update_run_status` must never regress a terminal status; implementations
/// treat such writes as no-ops.
#[async_trait]
pub trait MetadataStore: Send + Sync + std::fmt::Debug {
    async fn insert_run(&self, run: &Run) -> Result<()>;
    async fn get_run(&self, run_id: &str) -> Result<Option<Run>>;
    async fn list_runs(&self, user_id: &str) -> Result<Vec<Run>>;
    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()>;

    async fn upsert_thread(&self, thread: &Thread) -> Result<()>;
    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>>;
    async fn set_thread_status(&self, thread_id: &str, status: ThreadStatus) -> Result<()>;

    /// Cheap connectivity check for the health endpoint.
    async fn ping(&self) -> Result<()>;
}

/// Durable, append-only log of run events keyed by `(run_id, sequence)`.
///
/// This is the authoritative record the stream reconciler replays from, so
/// `append` failures are fatal to the owning run. Concurrent appends for the
/// same run serialize; assigned sequences start at 1, strictly increasing
/// with no reuse.
#[async_trait]
pub trait EventLog: Send + Sync + std::fmt::Debug {
    /// Assign the next sequence for `run_id`, persist atomically, and return
    /// the stored event.
    async fn append(
        &self,
        run_id: &str,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<RunEvent>;

    /// All events with `sequence > last_sequence`, ascending. `None` returns
    /// the full history.
    async fn read_since(&self, run_id: &str, last_sequence: Option<u64>) -> Result<Vec<RunEvent>>;

    async fn read_all(&self, run_id: &str) -> Result<Vec<RunEvent>>;

    /// Delete all events for a run.
    async fn purge(&self, run_id: &str) -> Result<()>;

    /// Retention sweep: delete events older than `ttl`, returning how many
    /// were removed.
    async fn purge_expired(&self, ttl: Duration) -> Result<u64>;
}
