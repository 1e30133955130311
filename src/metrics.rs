use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count and sum.
///
/// Suitable for simple latency tracking without percentile information.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Main Metrics Struct (Internal State) ---

/// Counters shared between the reconciliation loop, event ingestion and the
/// fire path. Cloning only clones the `Arc`s.
#[derive(Debug, Clone, Default)]
pub struct SyncMetrics {
  // --- Counters ---
  /// Completed reconciliation sweeps.
  pub sweeps_completed: Arc<AtomicUsize>,
  /// Sweep queries that failed (the sweep carried on without them).
  pub sweep_query_failures: Arc<AtomicUsize>,
  /// Jobs moved to `assigned` and armed.
  pub jobs_assigned: Arc<AtomicUsize>,
  /// `assigned` jobs found past their grace window and re-armed.
  pub stale_assignments_recovered: Arc<AtomicUsize>,
  /// Overdue `pending` jobs picked up by catch-up.
  pub missed_runs_caught_up: Arc<AtomicUsize>,
  /// Timers disarmed because their job was deleted or deactivated.
  pub timers_disarmed: Arc<AtomicUsize>,
  /// Timers that fired.
  pub timers_fired: Arc<AtomicUsize>,
  /// Fires dropped because the job changed underneath the timer.
  pub fires_discarded: Arc<AtomicUsize>,
  pub executions_succeeded: Arc<AtomicUsize>,
  pub executions_failed: Arc<AtomicUsize>,
  pub executions_panicked: Arc<AtomicUsize>,
  pub retries_scheduled: Arc<AtomicUsize>,
  /// Jobs that reached `completed` with no further occurrences.
  pub jobs_completed: Arc<AtomicUsize>,
  /// Jobs marked `failed` (retries exhausted or schedule unsatisfiable).
  pub jobs_failed: Arc<AtomicUsize>,
  /// Individual job writes that failed.
  pub persistence_write_failures: Arc<AtomicUsize>,
  /// Notifications handled for the job collection.
  pub notifications_processed: Arc<AtomicUsize>,
  /// Notifications for other collections.
  pub notifications_ignored: Arc<AtomicUsize>,

  // --- Gauges ---
  /// Executions currently running in this process.
  pub executions_in_flight: Arc<AtomicUsize>,

  // --- Histograms ---
  pub execution_duration: Arc<SimpleHistogram>,
}

impl SyncMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn incr(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  /// Point-in-time copy of every metric. `timers_armed` is supplied by the
  /// caller since the timer table owns that number.
  pub fn snapshot(&self, timers_armed: usize) -> MetricsSnapshot {
    let order = Ordering::Relaxed;
    MetricsSnapshot {
      sweeps_completed: self.sweeps_completed.load(order),
      sweep_query_failures: self.sweep_query_failures.load(order),
      jobs_assigned: self.jobs_assigned.load(order),
      stale_assignments_recovered: self.stale_assignments_recovered.load(order),
      missed_runs_caught_up: self.missed_runs_caught_up.load(order),
      timers_disarmed: self.timers_disarmed.load(order),
      timers_fired: self.timers_fired.load(order),
      fires_discarded: self.fires_discarded.load(order),
      executions_succeeded: self.executions_succeeded.load(order),
      executions_failed: self.executions_failed.load(order),
      executions_panicked: self.executions_panicked.load(order),
      retries_scheduled: self.retries_scheduled.load(order),
      jobs_completed: self.jobs_completed.load(order),
      jobs_failed: self.jobs_failed.load(order),
      persistence_write_failures: self.persistence_write_failures.load(order),
      notifications_processed: self.notifications_processed.load(order),
      notifications_ignored: self.notifications_ignored.load(order),
      executions_in_flight: self.executions_in_flight.load(order),
      timers_armed,
      execution_duration_count: self.execution_duration.get_count(),
      execution_duration_sum_micros: self.execution_duration.get_sum_micros(),
    }
  }
}

// --- Metrics Snapshot Struct (Public Data) ---

#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
  // Counters
  pub sweeps_completed: usize,
  pub sweep_query_failures: usize,
  pub jobs_assigned: usize,
  pub stale_assignments_recovered: usize,
  pub missed_runs_caught_up: usize,
  pub timers_disarmed: usize,
  pub timers_fired: usize,
  pub fires_discarded: usize,
  pub executions_succeeded: usize,
  pub executions_failed: usize,
  pub executions_panicked: usize,
  pub retries_scheduled: usize,
  pub jobs_completed: usize,
  pub jobs_failed: usize,
  pub persistence_write_failures: usize,
  pub notifications_processed: usize,
  pub notifications_ignored: usize,
  // Gauges
  pub executions_in_flight: usize,
  pub timers_armed: usize,
  // Histogram Data
  pub execution_duration_count: usize,
  pub execution_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean execution duration, if anything has executed.
  pub fn mean_execution_duration(&self) -> Option<Duration> {
    if self.execution_duration_count == 0 {
      None
    } else {
      let mean = self.execution_duration_sum_micros as f64 / self.execution_duration_count as f64;
      Some(Duration::from_micros(mean as u64))
    }
  }
}
