use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::domain::events::{EventKind, RunEvent};
use crate::domain::runs::{Run, RunStatus};
use crate::error::ApiError;
use crate::persistence::MetadataStore;
use crate::streaming::broker::BrokerRegistry;
use crate::streaming::{ActiveRuns, StopSignal};

/// Cancel/interrupt/join semantics for runs.
///
/// Signals are cooperative: the execution driver observes them at its next
/// suspension point. A synthetic terminal broker event makes attached
/// streams end promptly even if driver cleanup is delayed, and persisted
/// status is updated even for runs with no live broker at all.
#[derive(Debug)]
pub struct LifecycleController {
    pub(crate) store: Arc<dyn MetadataStore>,
    pub(crate) brokers: Arc<BrokerRegistry>,
    pub(crate) active: ActiveRuns,
    pub(crate) join_timeout: Duration,
}

impl LifecycleController {
    /// Stop a run as soon as possible. Repeating a cancel on an
    /// already-cancelled run is a no-op returning the terminal state;
    /// cancelling a run that reached any other terminal status is a
    /// conflict.
    pub async fn cancel(&self, run_id: &str) -> Result<Run, ApiError> {
        let run = self.fetch(run_id).await?;
        if run.status.is_terminal() {
            if run.status == RunStatus::Cancelled {
                return Ok(run);
            }
            return Err(ApiError::conflict(format!(
                "cannot cancel run with status: {}",
                run.status.as_str()
            )));
        }

        self.signal(run_id, StopSignal::Cancel, json!({ "status": "cancelled" }))
            .await;
        self.store
            .update_run_status(run_id, RunStatus::Cancelled, None, None)
            .await?;
        self.fetch(run_id).await
    }

    /// Request a graceful stop, honored at the driver's next safe point.
    pub async fn interrupt(&self, run_id: &str) -> Result<Run, ApiError> {
        let run = self.fetch(run_id).await?;
        if run.status == RunStatus::Interrupted {
            return Ok(run);
        }
        if !matches!(run.status, RunStatus::Running | RunStatus::Streaming) {
            return Err(ApiError::conflict(format!(
                "cannot interrupt run with status: {}",
                run.status.as_str()
            )));
        }

        self.signal(run_id, StopSignal::Interrupt, json!({ "status": "interrupted" }))
            .await;
        self.store
            .update_run_status(run_id, RunStatus::Interrupted, None, None)
            .await?;
        self.fetch(run_id).await
    }

    /// Block (cooperatively, bounded) until the run reaches a terminal
    /// status; on timeout the current persisted state is returned as-is.
    pub async fn join(&self, run_id: &str) -> Result<Run, ApiError> {
        let run = self.fetch(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        let done = self
            .active
            .read()
            .await
            .get(run_id)
            .map(|handle| handle.done.clone());
        if let Some(mut done) = done {
            // A closed channel means the driver task is gone, which is just
            // as final as an explicit completion signal.
            let _ = tokio::time::timeout(self.join_timeout, done.wait_for(|finished| *finished))
                .await;
        }

        self.fetch(run_id).await
    }

    async fn fetch(&self, run_id: &str) -> Result<Run, ApiError> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| ApiError::not_found(format!("Run '{run_id}'")))
    }

    /// Signal the driver (if still running) and push a synthetic terminal
    /// event so attached consumers end promptly. Safe on runs whose task
    /// already completed and on runs with no broker.
    async fn signal(&self, run_id: &str, signal: StopSignal, payload: serde_json::Value) {
        if let Some(handle) = self.active.read().await.get(run_id) {
            let _ = handle.stop_reason.set(signal);
            handle.cancel.cancel();
        }

        if let Some(broker) = self.brokers.get(run_id) {
            let sequence = broker.last_sequence() + 1;
            broker.put(RunEvent::new(run_id, sequence, EventKind::End, payload));
        }
    }
}

/// Drop guard for cancel-on-disconnect streams: if the stream future is
/// dropped before a terminal event went out, the run is cancelled.
#[derive(Debug)]
pub struct DisconnectGuard {
    lifecycle: Arc<LifecycleController>,
    run_id: String,
    armed: bool,
}

impl DisconnectGuard {
    pub fn new(lifecycle: Arc<LifecycleController>, run_id: String) -> Self {
        Self {
            lifecycle,
            run_id,
            armed: true,
        }
    }

    /// Call once the stream ended normally; the guard then does nothing.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let lifecycle = Arc::clone(&self.lifecycle);
        let run_id = self.run_id.clone();
        tokio::spawn(async move {
            tracing::info!(run_id, "client disconnected, cancelling run");
            if let Err(e) = lifecycle.cancel(&run_id).await {
                tracing::debug!(run_id, error = %e, "disconnect-triggered cancel skipped");
            }
        });
    }
}
