use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::domain::events::{EventKind, RunEvent};
use crate::domain::runs::{Run, RunStatus};
use crate::domain::threads::{Thread, ThreadStatus};
use crate::persistence::{EventLog, MetadataStore};

/// In-memory provider backing tests and storeless development.
///
/// The per-run event vectors double as the durable log; `append` holds the
/// log lock for the whole assign-and-insert step, which serializes
/// concurrent appends per run.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    runs: Mutex<HashMap<String, Run>>,
    threads: Mutex<HashMap<String, Thread>>,
    events: Mutex<HashMap<String, Vec<RunEvent>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryProvider {
    async fn insert_run(&self, run: &Run) -> Result<()> {
        self.runs
            .lock()
            .await
            .insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        Ok(self.runs.lock().await.get(run_id).cloned())
    }

    async fn list_runs(&self, user_id: &str) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .runs
            .lock()
            .await
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()> {
        let mut runs = self.runs.lock().await;
        if let Some(run) = runs.get_mut(run_id) {
            if run.status.is_terminal() {
                tracing::warn!(
                    run_id,
                    current = run.status.as_str(),
                    requested = status.as_str(),
                    "ignoring status update on terminal run"
                );
                return Ok(());
            }
            run.status = status;
            run.updated_at = Utc::now();
            if output.is_some() {
                run.output = output;
            }
            if error.is_some() {
                run.error_message = error;
            }
        }
        Ok(())
    }

    async fn upsert_thread(&self, thread: &Thread) -> Result<()> {
        self.threads
            .lock()
            .await
            .insert(thread.thread_id.clone(), thread.clone());
        Ok(())
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>> {
        Ok(self.threads.lock().await.get(thread_id).cloned())
    }

    async fn set_thread_status(&self, thread_id: &str, status: ThreadStatus) -> Result<()> {
        if let Some(thread) = self.threads.lock().await.get_mut(thread_id) {
            thread.status = status;
            thread.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl EventLog for MemoryProvider {
    async fn append(
        &self,
        run_id: &str,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<RunEvent> {
        let mut events = self.events.lock().await;
        let log = events.entry(run_id.to_string()).or_default();
        let sequence = log.last().map_or(0, |e| e.sequence) + 1;
        let event = RunEvent::new(run_id, sequence, kind, payload);
        log.push(event.clone());
        Ok(event)
    }

    async fn read_since(&self, run_id: &str, last_sequence: Option<u64>) -> Result<Vec<RunEvent>> {
        let floor = last_sequence.unwrap_or(0);
        Ok(self
            .events
            .lock()
            .await
            .get(run_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.sequence > floor)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read_all(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        self.read_since(run_id, None).await
    }

    async fn purge(&self, run_id: &str) -> Result<()> {
        self.events.lock().await.remove(run_id);
        Ok(())
    }

    async fn purge_expired(&self, ttl: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl)?;
        let mut removed = 0u64;
        let mut events = self.events.lock().await;
        for log in events.values_mut() {
            let before = log.len();
            log.retain(|e| e.created_at >= cutoff);
            removed += (before - log.len()) as u64;
        }
        events.retain(|_, log| !log.is_empty());
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn append_assigns_gapless_sequences() {
        let provider = MemoryProvider::new();
        for expected in 1..=5u64 {
            let ev = provider
                .append("r1", EventKind::Values, json!({ "n": expected }))
                .await
                .unwrap();
            assert_eq!(ev.sequence, expected);
        }
        let all = provider.read_all("r1").await.unwrap();
        assert_eq!(
            all.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
    }

    #[tokio::test]
    async fn concurrent_appends_serialize_per_run() {
        let provider = std::sync::Arc::new(MemoryProvider::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let p = std::sync::Arc::clone(&provider);
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    p.append("r1", EventKind::Values, json!({})).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let all = provider.read_all("r1").await.unwrap();
        let seqs: Vec<u64> = all.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, (1..=100).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn read_since_returns_strict_suffix() {
        let provider = MemoryProvider::new();
        for _ in 0..5 {
            provider
                .append("r1", EventKind::Values, json!({}))
                .await
                .unwrap();
        }
        for k in 0..=5u64 {
            let suffix = provider.read_since("r1", Some(k)).await.unwrap();
            assert_eq!(
                suffix.iter().map(|e| e.sequence).collect::<Vec<_>>(),
                ((k + 1)..=5).collect::<Vec<u64>>()
            );
        }
    }

    #[tokio::test]
    async fn terminal_status_never_regresses() {
        let provider = MemoryProvider::new();
        let run = Run::new(
            "t1".into(),
            "u1".into(),
            crate::domain::runs::RunCreate {
                assistant_id: "agent".into(),
                input: json!({}),
                config: None,
                cancel_on_disconnect: false,
            },
        );
        let run_id = run.run_id.clone();
        provider.insert_run(&run).await.unwrap();
        provider
            .update_run_status(&run_id, RunStatus::Cancelled, None, None)
            .await
            .unwrap();
        provider
            .update_run_status(&run_id, RunStatus::Completed, Some(json!({"x": 1})), None)
            .await
            .unwrap();
        let run = provider.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.output.is_none());
    }
}
