use crate::command::ShutdownMode;
use crate::job::{InstanceId, JobId, TaskPayload};

use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use priority_queue::priority_queue::PriorityQueue;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

// --- Clock ---

/// Source of "now" for every time-dependent decision in the scheduler.
pub trait Clock: Send + Sync + 'static {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock anchored at a fixed UTC instant that advances with tokio's clock.
///
/// Under `tokio::time::pause()` (or `#[tokio::test(start_paused = true)]`)
/// time only moves when the runtime auto-advances or `tokio::time::advance` is
/// called, which lets tests walk through hours of schedule without sleeping.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
  anchor_utc: DateTime<Utc>,
  anchor: tokio::time::Instant,
}

impl TokioClock {
  pub fn starting_at(anchor_utc: DateTime<Utc>) -> Self {
    Self {
      anchor_utc,
      anchor: tokio::time::Instant::now(),
    }
  }
}

impl Clock for TokioClock {
  fn now(&self) -> DateTime<Utc> {
    let elapsed = tokio::time::Instant::now().duration_since(self.anchor);
    self.anchor_utc + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero())
  }
}

// --- Timer entries ---

/// What a firing timer hands to its callback: an immutable snapshot taken at
/// arm time.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredTimer {
  pub job_id: JobId,
  pub instance_id: InstanceId,
  pub fire_at: DateTime<Utc>,
  pub payload: TaskPayload,
}

/// Callback run when a timer fires. Invoked exactly once, after the entry has
/// been removed from the table.
pub type FireFn = Box<dyn FnOnce(FiredTimer) -> BoxFuture<'static, ()> + Send + 'static>;

struct TimerEntry {
  instance_id: InstanceId,
  fire_at: DateTime<Utc>,
  payload: TaskPayload,
  on_fire: FireFn,
}

#[derive(Default)]
struct TimerState {
  queue: PriorityQueue<JobId, Reverse<DateTime<Utc>>>,
  entries: HashMap<JobId, TimerEntry>,
}

/// Process-local table of armed timers, at most one per job.
///
/// All mutation goes through `arm`, `disarm`, and `fire_due`, which take the
/// same lock, so operations on any given job id never interleave.
pub struct TimerTable {
  state: Mutex<TimerState>,
  wake: Notify,
}

impl fmt::Debug for TimerTable {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    f.debug_struct("TimerTable")
      .field("armed", &state.entries.len())
      .field("next_deadline", &state.queue.peek().map(|(_, Reverse(at))| *at))
      .finish()
  }
}

impl Default for TimerTable {
  fn default() -> Self {
    Self::new()
  }
}

impl TimerTable {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(TimerState::default()),
      wake: Notify::new(),
    }
  }

  /// Arms a timer for `job_id`, replacing any timer already armed for it.
  pub fn arm(
    &self,
    job_id: &str,
    fire_at: DateTime<Utc>,
    payload: TaskPayload,
    on_fire: FireFn,
  ) -> InstanceId {
    let instance_id = Uuid::new_v4();
    {
      let mut state = self.state.lock();
      if let Some(previous) = state.entries.remove(job_id) {
        debug!(%job_id, replaced = %previous.instance_id, "Replacing armed timer.");
      }
      state.queue.push(job_id.to_string(), Reverse(fire_at));
      state.entries.insert(
        job_id.to_string(),
        TimerEntry {
          instance_id,
          fire_at,
          payload,
          on_fire,
        },
      );
    }
    trace!(%job_id, %instance_id, %fire_at, "Armed timer.");
    self.wake.notify_one();
    instance_id
  }

  /// Cancels the timer for `job_id`. Returns whether one was armed; unknown
  /// ids are not an error.
  pub fn disarm(&self, job_id: &str) -> bool {
    let removed = {
      let mut state = self.state.lock();
      state.queue.remove(job_id);
      state.entries.remove(job_id)
    };
    match removed {
      Some(entry) => {
        trace!(%job_id, instance_id = %entry.instance_id, "Disarmed timer.");
        self.wake.notify_one();
        true
      }
      None => false,
    }
  }

  pub fn is_armed(&self, job_id: &str) -> bool {
    self.state.lock().entries.contains_key(job_id)
  }

  /// Fire instant of the timer armed for `job_id`, if any.
  pub fn armed_at(&self, job_id: &str) -> Option<DateTime<Utc>> {
    self.state.lock().entries.get(job_id).map(|entry| entry.fire_at)
  }

  pub fn armed_ids(&self) -> Vec<JobId> {
    self.state.lock().entries.keys().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.state.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
    self.state.lock().queue.peek().map(|(_, Reverse(at))| *at)
  }

  /// Drops every armed timer without firing it.
  pub fn clear(&self) -> usize {
    let mut state = self.state.lock();
    let count = state.entries.len();
    state.queue.clear();
    state.entries.clear();
    count
  }

  /// Removes all timers due at `now` and spawns their callbacks.
  ///
  /// Entries leave the table before their callback starts, so a callback that
  /// re-arms its own job id creates a fresh entry. Returns how many fired.
  pub fn fire_due(&self, now: DateTime<Utc>) -> usize {
    let due = self.take_due(now);
    let count = due.len();
    for (fired, on_fire) in due {
      trace!(job_id = %fired.job_id, instance_id = %fired.instance_id, "Timer fired.");
      tokio::spawn(on_fire(fired));
    }
    count
  }

  fn take_due(&self, now: DateTime<Utc>) -> Vec<(FiredTimer, FireFn)> {
    let mut state = self.state.lock();
    let mut due = Vec::new();
    while let Some((_, Reverse(at))) = state.queue.peek() {
      if *at > now {
        break;
      }
      let Some((job_id, _)) = state.queue.pop() else {
        break;
      };
      match state.entries.remove(&job_id) {
        Some(entry) => due.push((
          FiredTimer {
            job_id,
            instance_id: entry.instance_id,
            fire_at: entry.fire_at,
            payload: entry.payload,
          },
          entry.on_fire,
        )),
        None => warn!(%job_id, "Queued timer had no entry; dropping."),
      }
    }
    due
  }

  /// Drives the table: sleeps until the earliest deadline (or until woken by
  /// `arm`/`disarm`) and fires whatever is due. Exits on shutdown.
  pub async fn run(
    &self,
    clock: &dyn Clock,
    mut shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  ) {
    info!("Timer driver started.");
    loop {
      if shutdown_rx.borrow().is_some() {
        break;
      }
      let sleep_duration = self.calculate_sleep(clock.now());

      tokio::select! {
        biased;

        changed = shutdown_rx.changed() => {
          if changed.is_err() || shutdown_rx.borrow().is_some() {
            break;
          }
        }

        _ = self.wake.notified() => {
          trace!("Timer driver woken by table change.");
        }

        _ = tokio::time::sleep(sleep_duration) => {
          let fired = self.fire_due(clock.now());
          if fired > 0 {
            debug!(fired, "Fired due timers.");
          }
        }
      }
    }
    info!("Timer driver shutting down.");
  }

  fn calculate_sleep(&self, now: DateTime<Utc>) -> Duration {
    match self.next_deadline() {
      Some(deadline) if deadline > now => (deadline - now)
        .to_std()
        .unwrap_or(Duration::from_millis(10))
        .max(Duration::from_millis(1)),
      Some(_) => Duration::ZERO,
      // Nothing armed; `arm` wakes the driver.
      None => Duration::from_secs(60 * 60 * 24),
    }
  }
}
