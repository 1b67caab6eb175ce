use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::domain::events::EventKind;
use crate::domain::runs::{Run, RunStatus};
use crate::domain::threads::ThreadStatus;
use crate::persistence::{EventLog, MetadataStore};
use crate::streaming::broker::BrokerRegistry;
use crate::streaming::source::{EventSource, ExecutionContext};
use crate::streaming::{StopSignal, StopReason};

/// How one run ended.
enum Outcome {
    Completed,
    Stopped(StopSignal),
    Failed(String),
}

/// Owns the lifecycle of one run's execution: drives the event source,
/// sequences every chunk, persists it, publishes it live, and writes the
/// single terminal event.
#[derive(Debug)]
pub(crate) struct ExecutionDriver {
    pub log: Arc<dyn EventLog>,
    pub store: Arc<dyn MetadataStore>,
    pub brokers: Arc<BrokerRegistry>,
}

impl ExecutionDriver {
    /// The invariant throughout: append to the durable log first, publish to
    /// the broker second. A live event must never become visible before it
    /// is recorded, or a racing replay could miss it.
    #[instrument(skip_all, fields(run_id = %run.run_id, assistant_id = %run.assistant_id))]
    pub async fn drive(
        &self,
        run: Run,
        source: Arc<dyn EventSource>,
        ctx: ExecutionContext,
        cancel: CancellationToken,
        stop_reason: StopReason,
    ) {
        let run_id = run.run_id.clone();

        if let Err(e) = self
            .store
            .update_run_status(&run_id, RunStatus::Running, None, None)
            .await
        {
            tracing::error!(error = %e, "could not mark run running");
            self.finish(&run, Outcome::Failed(format!("metadata store unavailable: {e}")), None)
                .await;
            return;
        }
        if let Err(e) = self
            .store
            .set_thread_status(&run.thread_id, ThreadStatus::Busy)
            .await
        {
            tracing::warn!(error = %e, "could not mark thread busy");
        }

        let mut stream = match source.run(run.input.clone(), &ctx).await {
            Ok(stream) => stream,
            Err(e) => {
                self.finish(&run, Outcome::Failed(e.to_string()), None).await;
                return;
            }
        };

        let broker = self.brokers.get_or_create(&run_id);
        let mut last_values: Option<Value> = None;
        let mut streaming_marked = false;

        let outcome = loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let signal = stop_reason.get().copied().unwrap_or(StopSignal::Cancel);
                    break Outcome::Stopped(signal);
                }
                chunk = stream.next() => match chunk {
                    None => break Outcome::Completed,
                    Some(Err(e)) => break Outcome::Failed(e.to_string()),
                    Some(Ok(chunk)) => {
                        let (node_path, kind, mut payload) = chunk.into_parts();
                        if let (Some(path), Some(obj)) = (node_path, payload.as_object_mut()) {
                            obj.insert("node_path".into(), json!(path));
                        }

                        let event = match self.log.append(&run_id, kind, payload.clone()).await {
                            Ok(event) => event,
                            // The log is the authoritative record; an
                            // unrecorded event must end the run.
                            Err(e) => break Outcome::Failed(format!("event log append failed: {e}")),
                        };
                        if kind == EventKind::Values {
                            last_values = Some(payload);
                        }
                        broker.put(event);

                        if !streaming_marked {
                            streaming_marked = true;
                            if let Err(e) = self
                                .store
                                .update_run_status(&run_id, RunStatus::Streaming, None, None)
                                .await
                            {
                                tracing::warn!(error = %e, "could not mark run streaming");
                            }
                        }
                    }
                }
            }
        };

        self.finish(&run, outcome, last_values).await;
    }

    /// Terminal path, reached exactly once per run: append the single
    /// terminal event, persist the final status, release the broker, and
    /// return the thread to idle.
    async fn finish(&self, run: &Run, outcome: Outcome, last_values: Option<Value>) {
        let run_id = &run.run_id;
        let (kind, payload, status, output, error) = match outcome {
            Outcome::Completed => (
                EventKind::End,
                json!({ "status": "completed", "final_output": last_values }),
                RunStatus::Completed,
                last_values,
                None,
            ),
            Outcome::Stopped(StopSignal::Cancel) => (
                EventKind::End,
                json!({ "status": "cancelled" }),
                RunStatus::Cancelled,
                None,
                None,
            ),
            Outcome::Stopped(StopSignal::Interrupt) => (
                EventKind::End,
                json!({ "status": "interrupted" }),
                RunStatus::Interrupted,
                None,
                None,
            ),
            Outcome::Failed(message) => (
                EventKind::Error,
                json!({ "error": message, "timestamp": Utc::now() }),
                RunStatus::Failed,
                None,
                Some(message),
            ),
        };

        match self.log.append(run_id, kind, payload).await {
            Ok(event) => {
                // No-op if a lifecycle signal already pushed a synthetic
                // terminal event and finished the broker.
                self.brokers.get_or_create(run_id).put(event);
            }
            Err(e) => tracing::error!(error = %e, "could not append terminal event"),
        }

        if let Err(e) = self
            .store
            .update_run_status(run_id, status, output, error.clone())
            .await
        {
            tracing::error!(error = %e, "could not persist terminal run status");
        }

        self.brokers.release(run_id);

        if let Err(e) = self
            .store
            .set_thread_status(&run.thread_id, ThreadStatus::Idle)
            .await
        {
            tracing::warn!(error = %e, "could not mark thread idle");
        }

        tracing::info!(
            name: "run.finished",
            run_id = %run_id,
            status = status.as_str(),
            error = error.as_deref().unwrap_or(""),
            "run finished"
        );
    }
}
