use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_stream::stream;
use futures::Stream;
use tokio::sync::Notify;

use crate::domain::events::RunEvent;

/// How long a consumer sleeps between checks when no event has arrived.
/// Bounded so a consumer can observe "finished and drained" and exit.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct BrokerState {
    /// Append-only list of published events. Each consumer keeps a private
    /// cursor into it, so any number of concurrent consumers see the full
    /// sequence without interfering with each other.
    events: Vec<RunEvent>,
    finished: bool,
}

/// In-memory, per-run, single-producer/multi-consumer event distributor.
///
/// Created lazily on first publish or first stream attach, torn down by the
/// registry sweep once finished. Never persisted; the durable event log is
/// the authoritative record.
#[derive(Debug)]
pub struct RunBroker {
    run_id: String,
    state: Mutex<BrokerState>,
    notify: Notify,
    created_at: Instant,
}

impl RunBroker {
    fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            state: Mutex::new(BrokerState::default()),
            notify: Notify::new(),
            created_at: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an event for distribution. A terminal event also marks the
    /// broker finished; publishing after that point is a logged no-op.
    pub fn put(&self, event: RunEvent) {
        let terminal = event.kind.is_terminal();
        {
            let mut state = self.lock();
            if state.finished {
                tracing::warn!(
                    run_id = %self.run_id,
                    sequence = event.sequence,
                    "dropping event published to finished broker"
                );
                return;
            }
            state.events.push(event);
            if terminal {
                state.finished = true;
            }
        }
        self.notify.notify_waiters();
    }

    /// Mark finished without a terminal event (driver cleanup path).
    pub fn mark_finished(&self) {
        self.lock().finished = true;
        self.notify.notify_waiters();
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    /// Highest sequence published so far, 0 if none.
    pub fn last_sequence(&self) -> u64 {
        self.lock().events.last().map_or(0, |e| e.sequence)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Independent cursor over the broker's event list.
    ///
    /// Ends exactly once a terminal event has been yielded, or once the
    /// broker is finished and this consumer has drained everything buffered.
    pub fn consume(self: Arc<Self>) -> impl Stream<Item = RunEvent> + Send {
        stream! {
            let mut cursor = 0usize;
            loop {
                let (batch, finished) = {
                    let state = self.lock();
                    let batch = state.events[cursor..].to_vec();
                    cursor = state.events.len();
                    (batch, state.finished)
                };

                let mut saw_terminal = false;
                for event in batch {
                    saw_terminal = event.kind.is_terminal();
                    yield event;
                    if saw_terminal {
                        break;
                    }
                }
                if saw_terminal || finished {
                    break;
                }

                let _ = tokio::time::timeout(POLL_INTERVAL, self.notify.notified()).await;
            }
        }
    }
}

/// Owns the live brokers of all in-flight runs. Instance state on the
/// stream coordinator, never a process-wide global.
#[derive(Debug)]
pub struct BrokerRegistry {
    brokers: Mutex<HashMap<String, Arc<RunBroker>>>,
    retention: Duration,
}

impl BrokerRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            brokers: Mutex::new(HashMap::new()),
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<RunBroker>>> {
        self.brokers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_or_create(&self, run_id: &str) -> Arc<RunBroker> {
        Arc::clone(
            self.lock()
                .entry(run_id.to_string())
                .or_insert_with(|| Arc::new(RunBroker::new(run_id))),
        )
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<RunBroker>> {
        self.lock().get(run_id).map(Arc::clone)
    }

    /// Mark a run's broker finished but keep it around for consumers that
    /// are still draining; the sweep removes it later.
    pub fn release(&self, run_id: &str) {
        if let Some(broker) = self.get(run_id) {
            broker.mark_finished();
        }
    }

    pub fn remove(&self, run_id: &str) {
        if let Some(broker) = self.lock().remove(run_id) {
            broker.mark_finished();
        }
    }

    /// Reap brokers that are finished and older than the retention window.
    /// Late stream requests replay from the durable log instead.
    pub fn sweep(&self) -> usize {
        let mut brokers = self.lock();
        let before = brokers.len();
        brokers.retain(|_, b| !(b.is_finished() && b.age() > self.retention));
        before - brokers.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::EventKind;
    use futures::StreamExt;
    use serde_json::json;

    fn event(seq: u64, kind: EventKind) -> RunEvent {
        RunEvent::new("r1", seq, kind, json!({ "seq": seq }))
    }

    #[tokio::test]
    async fn consumer_ends_after_terminal_event() {
        let broker = Arc::new(RunBroker::new("r1"));
        broker.put(event(1, EventKind::Values));
        broker.put(event(2, EventKind::Values));
        broker.put(event(3, EventKind::End));

        let collected: Vec<RunEvent> = Arc::clone(&broker).consume().collect().await;
        assert_eq!(
            collected.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(broker.is_finished());
    }

    #[tokio::test]
    async fn put_after_finished_is_noop() {
        let broker = Arc::new(RunBroker::new("r1"));
        broker.put(event(1, EventKind::End));
        broker.put(event(2, EventKind::Values));

        let collected: Vec<RunEvent> = Arc::clone(&broker).consume().collect().await;
        assert_eq!(collected.len(), 1);
        assert_eq!(broker.last_sequence(), 1);
    }

    #[tokio::test]
    async fn two_consumers_each_see_every_event() {
        let broker = Arc::new(RunBroker::new("r1"));
        let a = tokio::spawn(Arc::clone(&broker).consume().collect::<Vec<RunEvent>>());
        let b = tokio::spawn(Arc::clone(&broker).consume().collect::<Vec<RunEvent>>());

        for seq in 1..=10 {
            broker.put(event(seq, EventKind::Values));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        broker.put(event(11, EventKind::End));

        let a = a.await.unwrap();
        let b = b.await.unwrap();
        let expected: Vec<u64> = (1..=11).collect();
        assert_eq!(a.iter().map(|e| e.sequence).collect::<Vec<_>>(), expected);
        assert_eq!(b.iter().map(|e| e.sequence).collect::<Vec<_>>(), expected);
    }

    #[tokio::test]
    async fn consumer_exits_when_finished_and_drained() {
        let broker = Arc::new(RunBroker::new("r1"));
        broker.put(event(1, EventKind::Values));
        broker.mark_finished();

        let collected: Vec<RunEvent> = Arc::clone(&broker).consume().collect().await;
        assert_eq!(collected.len(), 1);
    }

    #[tokio::test]
    async fn sweep_reaps_only_finished_old_brokers() {
        let registry = BrokerRegistry::new(Duration::ZERO);
        registry.get_or_create("live");
        registry.get_or_create("done").mark_finished();

        assert_eq!(registry.sweep(), 1);
        assert!(registry.get("live").is_some());
        assert!(registry.get("done").is_none());
    }
}
