use crate::collaborator::{IdentityProvider, StaticIdentity, TaskExecutor};
use crate::command::ShutdownMode;
use crate::config::SyncConfig;
use crate::engine::Engine;
use crate::error::{BuildError, QueryError, ShutdownError};
use crate::ingest::{run_ingestion_loop, ChangeNotification, IngestReport};
use crate::job::{InstanceId, JobId};
use crate::metrics::{MetricsSnapshot, SyncMetrics};
use crate::reconcile::{run_reconciliation_loop, SweepReport};
use crate::store::JobStore;
use crate::timer::{Clock, SystemClock, TimerTable};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Builder for configuring and starting a [`FireKeeper`].
///
/// A store and an executor are required; everything else has a default.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use firekeeper::{ExecutionResult, FireKeeper, FnExecutor, InMemoryJobStore};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let keeper = FireKeeper::builder()
///     .store(Arc::new(InMemoryJobStore::new()))
///     .executor(Arc::new(FnExecutor::new(|_req| async { ExecutionResult::success("ok") })))
///     .horizon(Duration::from_secs(120))
///     .build()?;
/// # keeper.shutdown_graceful(None).await?;
/// # Ok(())
/// # }
/// ```
pub struct SchedulerBuilder {
  store: Option<Arc<dyn JobStore>>,
  executor: Option<Arc<dyn TaskExecutor>>,
  identity: Arc<dyn IdentityProvider>,
  clock: Arc<dyn Clock>,
  config: SyncConfig,
  change_feed: Option<broadcast::Receiver<ChangeNotification>>,
  periodic_sweeps: bool,
}

impl std::fmt::Debug for SchedulerBuilder {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SchedulerBuilder")
      .field("store", &self.store.is_some())
      .field("executor", &self.executor.is_some())
      .field("identity", &self.identity.current_identity())
      .field("config", &self.config)
      .field("change_feed", &self.change_feed.is_some())
      .field("periodic_sweeps", &self.periodic_sweeps)
      .finish()
  }
}

impl Default for SchedulerBuilder {
  fn default() -> Self {
    Self {
      store: None,
      executor: None,
      identity: Arc::new(StaticIdentity::default()),
      clock: Arc::new(SystemClock),
      config: SyncConfig::default(),
      change_feed: None,
      periodic_sweeps: true,
    }
  }
}

impl SchedulerBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the job store (required).
  pub fn store<S: JobStore + 'static>(mut self, store: Arc<S>) -> Self {
    let store: Arc<dyn JobStore> = store;
    self.store = Some(store);
    self
  }

  /// Sets the task executor (required).
  pub fn executor<E: TaskExecutor + 'static>(mut self, executor: Arc<E>) -> Self {
    let executor: Arc<dyn TaskExecutor> = executor;
    self.executor = Some(executor);
    self
  }

  /// Sets the identity stamped onto assigned jobs. Defaults to
  /// [`StaticIdentity::default`].
  pub fn identity<I: IdentityProvider + 'static>(mut self, identity: Arc<I>) -> Self {
    self.identity = identity;
    self
  }

  /// Replaces the wall clock, e.g. with a [`TokioClock`](crate::TokioClock) in tests.
  pub fn clock<C: Clock>(mut self, clock: Arc<C>) -> Self {
    self.clock = clock;
    self
  }

  /// Replaces the whole configuration.
  pub fn config(mut self, config: SyncConfig) -> Self {
    self.config = config;
    self
  }

  pub fn sweep_interval(mut self, interval: Duration) -> Self {
    self.config.sweep_interval = interval;
    self
  }

  pub fn horizon(mut self, horizon: Duration) -> Self {
    self.config.horizon = horizon;
    self
  }

  pub fn grace_window(mut self, grace: Duration) -> Self {
    self.config.grace_window = grace;
    self
  }

  pub fn job_collection(mut self, collection: &str) -> Self {
    self.config.job_collection = collection.to_string();
    self
  }

  pub fn catch_up_missed(mut self, enabled: bool) -> Self {
    self.config.catch_up_missed = enabled;
    self
  }

  /// Subscribes to the store's change feed.
  pub fn change_feed(mut self, feed: broadcast::Receiver<ChangeNotification>) -> Self {
    self.change_feed = Some(feed);
    self
  }

  /// Disables the background sweep loop. Sweeps then run only through
  /// [`FireKeeper::sweep_now`].
  pub fn manual_sweeps(mut self) -> Self {
    self.periodic_sweeps = false;
    self
  }

  /// Builds the scheduler and spawns its background tasks: the timer driver,
  /// the reconciliation loop, and change-feed ingestion when a feed was given.
  ///
  /// Must be called from within a Tokio runtime.
  ///
  /// # Errors
  ///
  /// - [`BuildError::MissingStore`] / [`BuildError::MissingExecutor`]: a required
  ///   collaborator was not set.
  /// - [`BuildError::ZeroSweepInterval`]: `sweep_interval` is zero.
  pub fn build(self) -> Result<FireKeeper, BuildError> {
    let store = self.store.ok_or(BuildError::MissingStore)?;
    let executor = self.executor.ok_or(BuildError::MissingExecutor)?;
    if self.config.sweep_interval.is_zero() {
      return Err(BuildError::ZeroSweepInterval);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel::<Option<ShutdownMode>>(None);
    let timers = Arc::new(TimerTable::new());
    let engine = Engine::new(
      store,
      executor,
      self.identity,
      self.clock,
      timers,
      self.config,
      SyncMetrics::new(),
      shutdown_rx.clone(),
    );

    let mut handles = Vec::with_capacity(3);

    let driver_engine = engine.clone();
    let driver_shutdown_rx = shutdown_rx.clone();
    handles.push((
      "timer-driver",
      Handle::current().spawn(async move {
        let clock = driver_engine.clock.clone();
        driver_engine.timers.run(clock.as_ref(), driver_shutdown_rx).await;
      }),
    ));

    if self.periodic_sweeps {
      handles.push((
        "reconciliation",
        Handle::current().spawn(run_reconciliation_loop(engine.clone(), shutdown_rx.clone())),
      ));
    }

    if let Some(feed) = self.change_feed {
      handles.push((
        "ingestion",
        Handle::current().spawn(run_ingestion_loop(engine.clone(), feed, shutdown_rx.clone())),
      ));
    }

    info!(
      identity = ?engine.identity.current_identity(),
      horizon = ?engine.config.horizon,
      sweep_interval = ?engine.config.sweep_interval,
      "Scheduler started."
    );

    Ok(FireKeeper {
      engine,
      shutdown_tx,
      task_handles: Arc::new(Mutex::new(handles)),
    })
  }
}

/// Handle to a running scheduler.
///
/// Keeps this process's timer table in step with the job store: a periodic
/// sweep arms everything due soon and recovers missed or abandoned work, and
/// the change feed reacts to writes in between. Fired jobs run through the
/// configured [`TaskExecutor`] and are settled back into the store.
///
/// Use [`FireKeeper::builder()`] to create one.
#[derive(Debug)]
pub struct FireKeeper {
  engine: Arc<Engine>,
  shutdown_tx: watch::Sender<Option<ShutdownMode>>,
  task_handles: Arc<Mutex<Vec<(&'static str, JoinHandle<()>)>>>,
}

impl FireKeeper {
  pub fn builder() -> SchedulerBuilder {
    SchedulerBuilder::new()
  }

  fn ensure_running(&self) -> Result<(), QueryError> {
    if self.engine.is_shutting_down() {
      Err(QueryError::SchedulerShutdown)
    } else {
      Ok(())
    }
  }

  /// Runs a reconciliation sweep now, independent of the periodic loop.
  pub async fn sweep_now(&self) -> Result<SweepReport, QueryError> {
    self.ensure_running()?;
    Ok(self.engine.sweep().await)
  }

  /// Feeds one change notification through ingestion, as the change feed would.
  pub async fn handle_notification(
    &self,
    notification: &ChangeNotification,
  ) -> Result<IngestReport, QueryError> {
    self.ensure_running()?;
    Ok(self.engine.ingest(notification).await)
  }

  /// Assigns the job and fires it as soon as possible, ahead of its schedule.
  ///
  /// The job's following occurrence is resolved from the time it actually ran.
  ///
  /// # Errors
  ///
  /// - [`QueryError::SchedulerShutdown`]: the scheduler is shutting down.
  /// - [`QueryError::JobNotFound`] / [`QueryError::JobInactive`]: nothing to trigger.
  /// - [`QueryError::JobRunning`]: the job is executing in this process.
  /// - [`QueryError::Sync`]: the store could not be read or written.
  pub async fn trigger_job_now(&self, job_id: &str) -> Result<InstanceId, QueryError> {
    self.ensure_running()?;
    let job_id: JobId = job_id.to_string();
    let record = self
      .engine
      .fetch(&job_id)
      .await?
      .ok_or_else(|| QueryError::JobNotFound(job_id.clone()))?;
    if !record.active {
      return Err(QueryError::JobInactive(job_id));
    }
    if self.engine.is_in_flight(&job_id) {
      return Err(QueryError::JobRunning(job_id));
    }
    let now = self.engine.clock.now();
    let instance_id = self.engine.promote(&job_id, &record.job, now).await?;
    info!(%job_id, %instance_id, "Job triggered manually.");
    Ok(instance_id)
  }

  pub fn is_armed(&self, job_id: &str) -> bool {
    self.engine.timers.is_armed(job_id)
  }

  pub fn armed_at(&self, job_id: &str) -> Option<DateTime<Utc>> {
    self.engine.timers.armed_at(job_id)
  }

  /// Ids of every job with a timer armed in this process, sorted.
  pub fn armed_jobs(&self) -> Vec<JobId> {
    let mut ids = self.engine.timers.armed_ids();
    ids.sort();
    ids
  }

  pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
    self.engine.timers.next_deadline()
  }

  /// Settlement writes still waiting for the store to accept them.
  pub fn pending_settlements(&self) -> usize {
    self.engine.deferred_len()
  }

  pub fn config(&self) -> &SyncConfig {
    &self.engine.config
  }

  pub fn get_metrics_snapshot(&self) -> MetricsSnapshot {
    self.engine.metrics.snapshot(self.engine.timers.len())
  }

  /// Initiates a graceful shutdown.
  ///
  /// Stops sweeping, ingesting and firing, then waits for executions already
  /// in flight to settle. Armed timers are dropped; their jobs stay `assigned`
  /// in the store and are recovered by whichever process sweeps next.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::SignalFailed`]: Failed to send the shutdown signal.
  /// - [`ShutdownError::Timeout`]: Waiting exceeded the timeout.
  /// - [`ShutdownError::TaskPanic`]: A background task panicked.
  pub async fn shutdown_graceful(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!("Initiating graceful shutdown...");
    self
      .shutdown_tx
      .send(Some(ShutdownMode::Graceful))
      .map_err(|_| ShutdownError::SignalFailed)?;
    self.await_shutdown(ShutdownMode::Graceful, timeout).await
  }

  /// Initiates a forced shutdown.
  ///
  /// Stops background tasks without waiting for in-flight executions. Their
  /// jobs are left `running` or `assigned` and fall to stale recovery.
  pub async fn shutdown_force(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!("Initiating forced shutdown...");
    self
      .shutdown_tx
      .send(Some(ShutdownMode::Force))
      .map_err(|_| ShutdownError::SignalFailed)?;
    self.await_shutdown(ShutdownMode::Force, timeout).await
  }

  async fn await_shutdown(
    &self,
    mode: ShutdownMode,
    timeout_duration: Option<Duration>,
  ) -> Result<(), ShutdownError> {
    let handles = {
      let mut guard = self.task_handles.lock().await;
      std::mem::take(&mut *guard)
    };

    let tasks = handles.into_iter().map(|(name, handle)| async move {
      handle.await.map_err(|e| {
        error!(task = name, "Background task panicked: {:?}", e);
        ShutdownError::TaskPanic
      })
    });
    let engine = self.engine.clone();
    let wait_all = async move {
      try_join_all(tasks).await?;
      if mode == ShutdownMode::Graceful {
        while engine.in_flight_count() > 0 {
          tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
      }
      Ok::<(), ShutdownError>(())
    };

    let result = match timeout_duration {
      Some(timeout) => match tokio::time::timeout(timeout, wait_all).await {
        Ok(result) => result,
        Err(_) => {
          error!("Shutdown timed out after {:?}", timeout);
          Err(ShutdownError::Timeout)
        }
      },
      None => wait_all.await,
    };

    let dropped = self.engine.timers.clear();
    if dropped > 0 {
      warn!(dropped, "Dropped armed timers at shutdown.");
    }

    if result.is_ok() {
      info!("All tasks joined successfully.");
    } else {
      error!("Error during shutdown: {:?}", result);
    }
    result
  }
}
