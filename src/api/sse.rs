use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::json;

use crate::domain::events::{EventKind, RunEvent};

/// Convert one internal run event to its wire representation.
///
/// `id` carries the per-run sequence so clients can resume with
/// `Last-Event-ID`; `end` events carry no data. A payload that fails to
/// serialize is logged and skipped rather than aborting the stream.
pub fn wire_event(event: &RunEvent) -> Option<Event> {
    let data = match event.kind {
        EventKind::End => String::new(),
        _ => match serde_json::to_string(&event.payload) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(
                    run_id = %event.run_id,
                    sequence = event.sequence,
                    error = %e,
                    "skipping unserializable event"
                );
                return None;
            }
        },
    };
    Some(
        Event::default()
            .id(event.sequence.to_string())
            .event(event.kind.as_str())
            .data(data),
    )
}

/// Unsequenced preamble identifying the run on stream-on-create responses.
pub fn metadata_event(run_id: &str) -> Event {
    let data = json!({ "run_id": run_id, "timestamp": Utc::now() });
    Event::default()
        .id("0")
        .event(EventKind::Metadata.as_str())
        .data(data.to_string())
}

pub fn build_sse_response<S>(
    stream: S,
    keep_alive: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send>
where
    S: Stream<Item = Event> + Send + 'static,
{
    Sse::new(stream.map(Ok)).keep_alive(KeepAlive::new().interval(keep_alive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_event_has_no_data() {
        let event = RunEvent::new("r1", 3, EventKind::End, json!({ "status": "completed" }));
        assert!(wire_event(&event).is_some());
    }

    #[test]
    fn values_event_converts() {
        let event = RunEvent::new("r1", 1, EventKind::Values, json!({ "messages": [] }));
        assert!(wire_event(&event).is_some());
    }
}
