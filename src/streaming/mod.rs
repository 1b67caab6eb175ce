//! The run-streaming core: durable event log consumers, per-run live
//! brokers, the execution driver, stream reconciliation, and run lifecycle
//! control, all owned by a single [`StreamCoordinator`] service object.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::events::RunEvent;
use crate::domain::runs::{Run, RunCreate};
use crate::domain::threads::{Thread, ThreadCreate};
use crate::error::ApiError;
use crate::persistence::{EventLog, MetadataStore};

pub mod broker;
pub mod driver;
pub mod lifecycle;
pub mod reconciler;
pub mod source;

use broker::BrokerRegistry;
use driver::ExecutionDriver;
use lifecycle::LifecycleController;
use reconciler::StreamReconciler;
use source::{ExecutionContext, GraphRegistry};

/// Which flavor of externally-triggered stop was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Stop as soon as possible.
    Cancel,
    /// Graceful stop at the next safe point.
    Interrupt,
}

/// Set once by the lifecycle controller before firing the cancellation
/// token, read by the driver to pick the terminal status.
pub type StopReason = Arc<OnceLock<StopSignal>>;

/// Control handle for one in-flight run's background task.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub cancel: CancellationToken,
    pub stop_reason: StopReason,
    pub done: watch::Receiver<bool>,
}

/// run_id -> background task handle, for join/cancel. Written by the
/// coordinator on start and by the task itself on finish.
pub type ActiveRuns = Arc<RwLock<HashMap<String, RunHandle>>>;

/// Tunables for the streaming core.
#[derive(Debug, Clone)]
pub struct StreamingSettings {
    /// Events older than this are deleted by the retention sweep.
    pub event_ttl: Duration,
    /// Finished brokers older than this are reaped.
    pub broker_retention: Duration,
    pub sweep_interval: Duration,
    pub join_timeout: Duration,
    pub keep_alive: Duration,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            event_ttl: Duration::from_secs(3600),
            broker_retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
            join_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(15),
        }
    }
}

/// Process-wide streaming service: owns the broker registry and the
/// active-run registry, spawns execution drivers, and hands out reconciled
/// streams. Constructed once, injected through `AppState`.
#[derive(Debug)]
pub struct StreamCoordinator {
    store: Arc<dyn MetadataStore>,
    graphs: Arc<GraphRegistry>,
    brokers: Arc<BrokerRegistry>,
    active: ActiveRuns,
    driver: Arc<ExecutionDriver>,
    reconciler: StreamReconciler,
    lifecycle: Arc<LifecycleController>,
    settings: StreamingSettings,
    log: Arc<dyn EventLog>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl StreamCoordinator {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        log: Arc<dyn EventLog>,
        graphs: Arc<GraphRegistry>,
        settings: StreamingSettings,
    ) -> Arc<Self> {
        let brokers = Arc::new(BrokerRegistry::new(settings.broker_retention));
        let active: ActiveRuns = Arc::new(RwLock::new(HashMap::new()));

        let driver = Arc::new(ExecutionDriver {
            log: Arc::clone(&log),
            store: Arc::clone(&store),
            brokers: Arc::clone(&brokers),
        });
        let reconciler = StreamReconciler {
            log: Arc::clone(&log),
            store: Arc::clone(&store),
            brokers: Arc::clone(&brokers),
        };
        let lifecycle = Arc::new(LifecycleController {
            store: Arc::clone(&store),
            brokers: Arc::clone(&brokers),
            active: Arc::clone(&active),
            join_timeout: settings.join_timeout,
        });

        Arc::new(Self {
            store,
            graphs,
            brokers,
            active,
            driver,
            reconciler,
            lifecycle,
            settings,
            log,
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        })
    }

    /// Start the periodic maintenance sweep (broker reaping + event log
    /// retention).
    pub fn start(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(coordinator.settings.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = coordinator.shutdown.cancelled() => break,
                    _ = interval.tick() => coordinator.sweep_once().await,
                }
            }
        });
        *self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    async fn sweep_once(&self) {
        let reaped = self.brokers.sweep();
        if reaped > 0 {
            tracing::info!(name: "broker.sweep", reaped, "reaped idle brokers");
        }
        match self.log.purge_expired(self.settings.event_ttl).await {
            Ok(0) => {}
            Ok(purged) => tracing::info!(name: "events.sweep", purged, "purged expired events"),
            Err(e) => tracing::error!(error = %e, "event retention sweep failed"),
        }
    }

    /// Cooperatively stop the sweep and signal all in-flight runs.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for handle in self.active.read().await.values() {
            handle.cancel.cancel();
        }
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
    }

    /// Create a run and schedule its execution driver in the background.
    /// Returns the run still in `pending` status.
    pub async fn create_run(
        &self,
        thread_id: &str,
        user_id: &str,
        req: RunCreate,
    ) -> Result<Run, ApiError> {
        let Some(source) = self.graphs.get(&req.assistant_id) else {
            return Err(ApiError::not_found(format!(
                "Assistant '{}'",
                req.assistant_id
            )));
        };

        if self.store.get_thread(thread_id).await?.is_none() {
            self.store
                .upsert_thread(&Thread::implicit(thread_id, user_id))
                .await?;
        }

        let run = Run::new(thread_id.to_string(), user_id.to_string(), req);
        self.store.insert_run(&run).await?;

        let mut ctx = ExecutionContext::new(&run.run_id, thread_id, &run.assistant_id, user_id);
        ctx.merge_config(run.config.as_ref());

        let cancel = CancellationToken::new();
        let stop_reason: StopReason = Arc::new(OnceLock::new());
        let (done_tx, done_rx) = watch::channel(false);
        self.active.write().await.insert(
            run.run_id.clone(),
            RunHandle {
                cancel: cancel.clone(),
                stop_reason: Arc::clone(&stop_reason),
                done: done_rx,
            },
        );

        let driver = Arc::clone(&self.driver);
        let active = Arc::clone(&self.active);
        let task_run = run.clone();
        let run_id = run.run_id.clone();
        tokio::spawn(async move {
            driver
                .drive(task_run, source, ctx, cancel, stop_reason)
                .await;
            active.write().await.remove(&run_id);
            let _ = done_tx.send(true);
        });

        Ok(run)
    }

    /// Reconciled replay + live stream for one client session.
    pub fn open_run_stream(
        &self,
        run_id: &str,
        last_seen: Option<u64>,
    ) -> impl Stream<Item = RunEvent> + Send + 'static + use<> {
        self.reconciler.open_stream(run_id.to_string(), last_seen)
    }

    pub async fn cancel(&self, run_id: &str) -> Result<Run, ApiError> {
        self.lifecycle.cancel(run_id).await
    }

    pub async fn interrupt(&self, run_id: &str) -> Result<Run, ApiError> {
        self.lifecycle.interrupt(run_id).await
    }

    pub async fn join(&self, run_id: &str) -> Result<Run, ApiError> {
        self.lifecycle.join(run_id).await
    }

    pub fn lifecycle(&self) -> Arc<LifecycleController> {
        Arc::clone(&self.lifecycle)
    }

    /// Fetch a run, masking other users' runs as not-found.
    pub async fn get_run_for(&self, run_id: &str, user_id: &str) -> Result<Run, ApiError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .filter(|r| r.user_id == user_id)
            .ok_or_else(|| ApiError::not_found(format!("Run '{run_id}'")))?;
        Ok(run)
    }

    pub async fn list_runs(&self, user_id: &str) -> Result<Vec<Run>, ApiError> {
        Ok(self.store.list_runs(user_id).await?)
    }

    pub async fn create_thread(
        &self,
        user_id: &str,
        req: ThreadCreate,
    ) -> Result<Thread, ApiError> {
        let thread = Thread::new(user_id.to_string(), req.metadata);
        self.store.upsert_thread(&thread).await?;
        Ok(thread)
    }

    pub async fn get_thread_for(
        &self,
        thread_id: &str,
        user_id: &str,
    ) -> Result<Thread, ApiError> {
        self.store
            .get_thread(thread_id)
            .await?
            .filter(|t| t.user_id == user_id)
            .ok_or_else(|| ApiError::not_found(format!("Thread '{thread_id}'")))
    }

    pub fn assistants(&self) -> Vec<String> {
        self.graphs.list()
    }

    pub fn settings(&self) -> &StreamingSettings {
        &self.settings
    }

    pub async fn ping_store(&self) -> Result<(), ApiError> {
        Ok(self.store.ping().await?)
    }
}
