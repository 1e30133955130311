use crate::collaborator::{IdentityProvider, TaskExecutor};
use crate::command::ShutdownMode;
use crate::config::SyncConfig;
use crate::error::{PersistenceError, SyncError};
use crate::job::{InstanceId, JobId, JobRecord, TaskPayload};
use crate::lifecycle;
use crate::metrics::SyncMetrics;
use crate::store::{JobPatch, JobStore, UpdateAck, UpdateOptions};
use crate::timer::{Clock, TimerTable};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// State shared by the reconciliation loop, event ingestion and the fire path.
///
/// Both entry points funnel into the same two operations, `promote` (persist
/// `assigned`, then arm) and `disarm`, which are the only ways the timer table
/// changes outside of a timer firing.
pub(crate) struct Engine {
  me: Weak<Engine>,
  pub(crate) store: Arc<dyn JobStore>,
  pub(crate) executor: Arc<dyn TaskExecutor>,
  pub(crate) identity: Arc<dyn IdentityProvider>,
  pub(crate) clock: Arc<dyn Clock>,
  pub(crate) timers: Arc<TimerTable>,
  pub(crate) config: SyncConfig,
  pub(crate) metrics: SyncMetrics,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  /// Jobs whose execution is currently running in this process.
  in_flight: Mutex<HashSet<JobId>>,
  /// Settlement patches that failed to persist; flushed by the next sweep.
  deferred: Mutex<HashMap<JobId, JobPatch>>,
  /// Armed timers that are retries of a failed attempt, by fire instant.
  retries: Mutex<HashMap<JobId, DateTime<Utc>>>,
}

impl fmt::Debug for Engine {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Engine")
      .field("config", &self.config)
      .field("timers", &self.timers)
      .field("in_flight", &self.in_flight.lock().len())
      .field("deferred", &self.deferred.lock().len())
      .finish()
  }
}

impl Engine {
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    store: Arc<dyn JobStore>,
    executor: Arc<dyn TaskExecutor>,
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    timers: Arc<TimerTable>,
    config: SyncConfig,
    metrics: SyncMetrics,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  ) -> Arc<Self> {
    Arc::new_cyclic(|me| Self {
      me: me.clone(),
      store,
      executor,
      identity,
      clock,
      timers,
      config,
      metrics,
      shutdown_rx,
      in_flight: Mutex::new(HashSet::new()),
      deferred: Mutex::new(HashMap::new()),
      retries: Mutex::new(HashMap::new()),
    })
  }

  pub(crate) fn is_shutting_down(&self) -> bool {
    self.shutdown_rx.borrow().is_some()
  }

  // --- Timer operations ---

  /// Arms `job_id` to fire at `at`. `attempt` travels with the timer so a
  /// retry knows how many attempts preceded it.
  pub(crate) fn arm(
    &self,
    job_id: &str,
    at: DateTime<Utc>,
    payload: TaskPayload,
    attempt: u32,
  ) -> InstanceId {
    {
      let mut retries = self.retries.lock();
      if attempt > 0 {
        retries.insert(job_id.to_string(), at);
      } else {
        retries.remove(job_id);
      }
    }
    let engine = self.me.clone();
    self.timers.arm(
      job_id,
      at,
      payload,
      Box::new(move |fired| {
        Box::pin(async move {
          if let Some(engine) = engine.upgrade() {
            engine.on_fire(fired, attempt).await;
          }
        })
      }),
    )
  }

  pub(crate) fn disarm(&self, job_id: &str) -> bool {
    self.retries.lock().remove(job_id);
    let removed = self.timers.disarm(job_id);
    if removed {
      SyncMetrics::incr(&self.metrics.timers_disarmed);
      debug!(%job_id, "Disarmed timer for job.");
    }
    removed
  }

  /// `pending -> assigned`: stamp ownership, persist, then arm.
  ///
  /// Nothing is armed unless the write lands. A write that matches no document
  /// means the job was deleted; any timer for it is dropped.
  pub(crate) async fn promote(
    &self,
    job_id: &JobId,
    payload: &TaskPayload,
    at: DateTime<Utc>,
  ) -> Result<InstanceId, SyncError> {
    let patch = lifecycle::assign(at, self.identity.current_identity());
    let ack = self.write(job_id, &patch).await?;
    if !ack.matched {
      self.disarm(job_id);
      return Err(SyncError::JobVanished(job_id.clone()));
    }
    let instance_id = self.arm(job_id, at, payload.clone(), 0);
    SyncMetrics::incr(&self.metrics.jobs_assigned);
    info!(%job_id, %instance_id, fire_at = %at, "Job assigned and armed.");
    Ok(instance_id)
  }

  /// Whether the timer armed for `job_id` is a retry due at `at`.
  pub(crate) fn is_retry_armed(&self, job_id: &str, at: DateTime<Utc>) -> bool {
    self.retries.lock().get(job_id) == Some(&at) && self.timers.armed_at(job_id) == Some(at)
  }

  /// Forgets the retry marker of a timer that just fired.
  pub(crate) fn clear_retry(&self, job_id: &str, fire_at: DateTime<Utc>) {
    let mut retries = self.retries.lock();
    if retries.get(job_id) == Some(&fire_at) {
      retries.remove(job_id);
    }
  }

  // --- Persistence helpers ---

  /// Writes a patch without upsert, counting failures.
  pub(crate) async fn write(&self, job_id: &JobId, patch: &JobPatch) -> Result<UpdateAck, SyncError> {
    self
      .store
      .update(job_id, patch, UpdateOptions::default())
      .await
      .map_err(|e| {
        SyncMetrics::incr(&self.metrics.persistence_write_failures);
        warn!(%job_id, error = %e, "Job write failed.");
        SyncError::from(e)
      })
  }

  pub(crate) async fn fetch(&self, job_id: &JobId) -> Result<Option<JobRecord>, PersistenceError> {
    self.store.get(job_id).await
  }

  /// Keeps a settlement patch for the next sweep. A newer patch for the same
  /// job replaces an older one.
  pub(crate) fn defer(&self, job_id: &JobId, patch: JobPatch) {
    self.deferred.lock().insert(job_id.clone(), patch);
  }

  /// Retries deferred settlement writes. Returns how many landed.
  pub(crate) async fn flush_deferred(&self) -> usize {
    let pending: Vec<(JobId, JobPatch)> = self.deferred.lock().drain().collect();
    if pending.is_empty() {
      return 0;
    }
    let mut flushed = 0;
    for (job_id, patch) in pending {
      match self.write(&job_id, &patch).await {
        Ok(_) => {
          flushed += 1;
          debug!(%job_id, "Flushed deferred settlement.");
        }
        Err(_) => {
          // Keep whichever is newer: a patch deferred while we were flushing wins.
          self.deferred.lock().entry(job_id).or_insert(patch);
        }
      }
    }
    flushed
  }

  pub(crate) fn deferred_len(&self) -> usize {
    self.deferred.lock().len()
  }

  // --- In-flight tracking ---

  /// Marks `job_id` as executing. Returns `false` if it already is.
  pub(crate) fn begin_execution(&self, job_id: &str) -> bool {
    let inserted = self.in_flight.lock().insert(job_id.to_string());
    if inserted {
      self
        .metrics
        .executions_in_flight
        .fetch_add(1, AtomicOrdering::Relaxed);
    }
    inserted
  }

  pub(crate) fn finish_execution(&self, job_id: &str) {
    if self.in_flight.lock().remove(job_id) {
      self
        .metrics
        .executions_in_flight
        .fetch_sub(1, AtomicOrdering::Relaxed);
      trace!(%job_id, "Execution finished.");
    }
  }

  pub(crate) fn is_in_flight(&self, job_id: &str) -> bool {
    self.in_flight.lock().contains(job_id)
  }

  pub(crate) fn in_flight_count(&self) -> usize {
    self.in_flight.lock().len()
  }

  /// Whether this process should take the job into its timer table now.
  pub(crate) fn needs_arming(&self, record: &JobRecord) -> bool {
    record.next_execution_time.is_some()
      && !self.timers.is_armed(&record.id)
      && !self.is_in_flight(&record.id)
  }

  /// The record is assigned to a different identity than ours.
  pub(crate) fn owned_elsewhere(&self, record: &JobRecord) -> bool {
    record
      .assignment
      .as_ref()
      .is_some_and(|owner| *owner != self.identity.current_identity())
  }

  pub(crate) fn within_horizon(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    at <= now + self.config.horizon_chrono()
  }
}
