use std::sync::Arc;

use async_stream::stream;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use serde_json::json;

use crate::domain::events::{EventKind, RunEvent};
use crate::persistence::{EventLog, MetadataStore};
use crate::streaming::broker::BrokerRegistry;

/// Merges persisted replay with live broker consumption into one gapless,
/// duplicate-free event sequence for a single stream request.
#[derive(Debug)]
pub struct StreamReconciler {
    pub(crate) log: Arc<dyn EventLog>,
    pub(crate) store: Arc<dyn MetadataStore>,
    pub(crate) brokers: Arc<BrokerRegistry>,
}

impl StreamReconciler {
    /// Open a reconciled stream for one client session.
    ///
    /// `last_seen` is the client's cursor. A cursor that does not match a
    /// stored sequence degrades to a full replay rather than dropping
    /// events. The returned stream is cancel-safe at every yield point;
    /// dropping it only abandons this consumer's private cursor.
    pub fn open_stream(
        &self,
        run_id: String,
        last_seen: Option<u64>,
    ) -> impl Stream<Item = RunEvent> + Send + 'static + use<> {
        let log = Arc::clone(&self.log);
        let store = Arc::clone(&self.store);
        let brokers = Arc::clone(&self.brokers);

        stream! {
            // The duplicate-skip watermark starts at what the log actually
            // confirmed the client has seen, never at the raw cursor: a
            // bogus cursor with an empty replay must not swallow the live
            // phase.
            let (replay, floor) = match Self::replay_set(&*log, &run_id, last_seen).await {
                Ok(replay) => replay,
                Err(e) => {
                    tracing::error!(run_id, error = %e, "event replay failed");
                    yield RunEvent::new(
                        &run_id,
                        0,
                        EventKind::Error,
                        json!({ "error": e.to_string(), "timestamp": Utc::now() }),
                    );
                    return;
                }
            };

            let mut last_sent = floor;
            for event in replay {
                last_sent = event.sequence;
                let terminal = event.kind.is_terminal();
                yield event;
                if terminal {
                    return;
                }
            }

            // A run the store does not know must not spawn a broker that
            // nothing will ever finish; the stream just ends.
            let run = match store.get_run(&run_id).await {
                Ok(Some(run)) => run,
                Ok(None) => {
                    tracing::warn!(run_id, "stream requested for unknown run");
                    return;
                }
                Err(e) => {
                    tracing::error!(run_id, error = %e, "run lookup failed mid-stream");
                    yield RunEvent::new(
                        &run_id,
                        0,
                        EventKind::Error,
                        json!({ "error": e.to_string(), "timestamp": Utc::now() }),
                    );
                    return;
                }
            };

            // Nothing live to add when the run is already terminal and the
            // broker (if one survives) has been finished.
            let broker_finished = brokers.get(&run_id).is_none_or(|b| b.is_finished());
            if run.status.is_terminal() && broker_finished {
                return;
            }

            let live = brokers.get_or_create(&run_id).consume();
            pin_mut!(live);
            while let Some(event) = live.next().await {
                // Overlap with the replay set: already delivered.
                if event.sequence <= last_sent {
                    continue;
                }
                last_sent = event.sequence;
                let terminal = event.kind.is_terminal();
                yield event;
                if terminal {
                    return;
                }
            }
        }
    }

    /// Determine what to replay for a cursor, returning the events plus the
    /// highest sequence the client is confirmed to have already seen.
    ///
    /// A cursor is only honored if the log actually holds the event the
    /// client claims to have seen; otherwise (a cursor from some foreign
    /// numbering scheme, or one beyond the history) the full history is
    /// replayed and the confirmed floor is 0.
    async fn replay_set(
        log: &dyn EventLog,
        run_id: &str,
        last_seen: Option<u64>,
    ) -> anyhow::Result<(Vec<RunEvent>, u64)> {
        let Some(cursor) = last_seen.filter(|c| *c > 0) else {
            return Ok((log.read_all(run_id).await?, 0));
        };

        let mut from_cursor = log.read_since(run_id, Some(cursor - 1)).await?;
        match from_cursor.first() {
            Some(first) if first.sequence == cursor => {
                from_cursor.remove(0);
                Ok((from_cursor, cursor))
            }
            _ => {
                tracing::warn!(run_id, cursor, "unknown cursor, replaying full history");
                Ok((log.read_all(run_id).await?, 0))
            }
        }
    }
}
