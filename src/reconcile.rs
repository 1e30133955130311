use crate::command::ShutdownMode;
use crate::engine::Engine;
use crate::error::SyncError;
use crate::job::{JobRecord, JobStatus};
use crate::lifecycle;
use crate::metrics::SyncMetrics;
use crate::resolver::{resolve_next, NextRun};
use crate::store::{JobPatch, JobQuery, NextExecutionFilter, StatusFilter};

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// What one reconciliation sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
  /// Jobs due within the horizon that were assigned and armed.
  pub armed: usize,
  /// Overdue `pending`/`failed` jobs armed to fire immediately.
  pub caught_up: usize,
  /// `assigned` or `running` jobs past their grace window that were re-armed.
  pub stale_recovered: usize,
  /// Jobs whose first occurrence was resolved and persisted.
  pub resolved: usize,
  /// Timers dropped because their job was deleted or deactivated.
  pub disarmed: usize,
  /// Settlement writes from earlier executions that finally landed.
  pub deferred_flushed: usize,
  /// Queries or per-job operations that failed.
  pub failures: usize,
  /// Earliest occurrence beyond the horizon, if any.
  pub next_beyond_horizon: Option<DateTime<Utc>>,
}

/// Tally of a batch of per-job operations.
#[derive(Default)]
struct Batch {
  ok: usize,
  failed: usize,
}

impl Batch {
  fn collect<T>(results: Vec<Result<T, SyncError>>) -> Self {
    let mut batch = Batch::default();
    for result in results {
      match result {
        Ok(_) => batch.ok += 1,
        Err(_) => batch.failed += 1,
      }
    }
    batch
  }
}

impl Engine {
  /// One pass over the store: arms everything due within the horizon, recovers
  /// what was missed, and drops timers for jobs that went away.
  ///
  /// A failing query only skips its own part of the sweep.
  pub(crate) async fn sweep(&self) -> SweepReport {
    let now = self.clock.now();
    let horizon_end = now + self.config.horizon_chrono();
    let mut report = SweepReport {
      deferred_flushed: self.flush_deferred().await,
      ..Default::default()
    };
    debug!(%now, %horizon_end, "Starting reconciliation sweep.");

    // Due within the horizon.
    let due = JobQuery::new()
      .active(true)
      .status(StatusFilter::Ne(JobStatus::Assigned))
      .next_execution(NextExecutionFilter::Between(now, horizon_end))
      .sorted();
    if let Some(jobs) = self.sweep_query("due", &due, &mut report).await {
      let batch = Batch::collect(
        join_all(
          jobs
            .iter()
            .filter(|job| !matches!(job.status, JobStatus::Running | JobStatus::Completed))
            .filter(|job| self.needs_arming(job))
            .map(|job| self.promote_record(job)),
        )
        .await,
      );
      report.armed += batch.ok;
      report.failures += batch.failed;
    }

    // Occurrences that passed while nobody held a timer for them.
    if self.config.catch_up_missed {
      let missed = JobQuery::new()
        .active(true)
        .status(StatusFilter::In(vec![JobStatus::Pending, JobStatus::Failed]))
        .next_execution(NextExecutionFilter::Before(now))
        .sorted();
      if let Some(jobs) = self.sweep_query("missed", &missed, &mut report).await {
        let batch = Batch::collect(
          join_all(
            jobs
              .iter()
              .filter(|job| self.needs_arming(job))
              .map(|job| async move {
                let result = self.promote_record(job).await;
                if result.is_ok() {
                  SyncMetrics::incr(&self.metrics.missed_runs_caught_up);
                  info!(job_id = %job.id, missed = ?job.next_execution_time, "Catching up missed run.");
                }
                result
              }),
          )
          .await,
        );
        report.caught_up += batch.ok;
        report.failures += batch.failed;
      }
    }

    // Assigned but never fired, or running but never settled: the owner died,
    // lost its timer, or was force-stopped mid-execution.
    let stale = JobQuery::new()
      .active(true)
      .status(StatusFilter::In(vec![JobStatus::Assigned, JobStatus::Running]))
      .next_execution(NextExecutionFilter::Before(now - self.config.grace_chrono()))
      .sorted();
    if let Some(jobs) = self.sweep_query("stale", &stale, &mut report).await {
      let batch = Batch::collect(
        join_all(
          jobs
            .iter()
            .filter(|job| self.needs_arming(job))
            .map(|job| self.recover_stale(job)),
        )
        .await,
      );
      report.stale_recovered += batch.ok;
      report.failures += batch.failed;
    }

    // New jobs nobody has resolved yet.
    let unresolved = JobQuery::new()
      .active(true)
      .status(StatusFilter::Eq(JobStatus::Pending))
      .next_execution(NextExecutionFilter::Unset);
    if let Some(jobs) = self.sweep_query("unresolved", &unresolved, &mut report).await {
      let batch = Batch::collect(
        join_all(
          jobs
            .iter()
            .filter(|job| !self.is_in_flight(&job.id))
            .map(|job| self.resolve_unset(job, now)),
        )
        .await,
      );
      report.resolved += batch.ok;
      report.failures += batch.failed;
    }

    report.disarmed = self.disarm_orphans(&mut report).await;

    let beyond = JobQuery::next_after(horizon_end);
    if let Some(jobs) = self.sweep_query("beyond-horizon", &beyond, &mut report).await {
      report.next_beyond_horizon = jobs.first().and_then(|job| job.next_execution_time);
    }

    SyncMetrics::incr(&self.metrics.sweeps_completed);
    info!(
      armed = report.armed,
      caught_up = report.caught_up,
      stale_recovered = report.stale_recovered,
      resolved = report.resolved,
      disarmed = report.disarmed,
      failures = report.failures,
      timers_armed = self.timers.len(),
      next_beyond_horizon = ?report.next_beyond_horizon,
      "Reconciliation sweep finished."
    );
    report
  }

  async fn sweep_query(
    &self,
    name: &str,
    query: &JobQuery,
    report: &mut SweepReport,
  ) -> Option<Vec<JobRecord>> {
    match self.store.read(query).await {
      Ok(jobs) => {
        debug!(query = name, matched = jobs.len(), "Sweep query returned.");
        Some(jobs)
      }
      Err(e) => {
        error!(query = name, error = %e, "Sweep query failed; skipping it this sweep.");
        SyncMetrics::incr(&self.metrics.sweep_query_failures);
        report.failures += 1;
        None
      }
    }
  }

  async fn promote_record(&self, job: &JobRecord) -> Result<(), SyncError> {
    let Some(at) = job.next_execution_time else {
      return Ok(());
    };
    self.promote(&job.id, &job.job, at).await.map(|_| ())
  }

  async fn recover_stale(&self, job: &JobRecord) -> Result<(), SyncError> {
    let Some(at) = job.next_execution_time else {
      return Ok(());
    };
    let stale = SyncError::StaleAssignment {
      job_id: job.id.clone(),
      next_execution_time: at,
    };
    warn!(error = %stale, status = %job.status, owner = ?job.assignment, "Recovering stale assignment.");
    self.promote(&job.id, &job.job, at).await?;
    SyncMetrics::incr(&self.metrics.stale_assignments_recovered);
    Ok(())
  }

  /// Resolves and persists the first occurrence of a job that has none.
  async fn resolve_unset(&self, job: &JobRecord, now: DateTime<Utc>) -> Result<(), SyncError> {
    match resolve_next(&job.schedule, now) {
      Ok(NextRun::At(at)) if self.within_horizon(at, now) => {
        self.promote(&job.id, &job.job, at).await.map(|_| ())
      }
      Ok(NextRun::At(at)) => {
        let patch = JobPatch::new().next_execution_time(Some(at));
        self.write(&job.id, &patch).await?;
        debug!(job_id = %job.id, next_run = %at, "Resolved first occurrence.");
        Ok(())
      }
      Ok(NextRun::Exhausted) => {
        self
          .write(&job.id, &lifecycle::complete(now, "schedule has no occurrences"))
          .await?;
        SyncMetrics::incr(&self.metrics.jobs_completed);
        info!(job_id = %job.id, "Job schedule has no occurrences; completed.");
        Ok(())
      }
      Err(source) => {
        self.write(&job.id, &lifecycle::unsatisfiable(now, &source)).await?;
        SyncMetrics::incr(&self.metrics.jobs_failed);
        let e = SyncError::ScheduleUnsatisfiable {
          job_id: job.id.clone(),
          source,
        };
        error!(error = %e, "Marked job failed.");
        Err(e)
      }
    }
  }

  /// Drops timers whose job is gone or inactive.
  async fn disarm_orphans(&self, report: &mut SweepReport) -> usize {
    let armed = self.timers.armed_ids();
    if armed.is_empty() {
      return 0;
    }
    let Some(records) = self
      .sweep_query("armed", &JobQuery::by_ids(armed.clone()), report)
      .await
    else {
      return 0;
    };
    let live: HashSet<&str> = records
      .iter()
      .filter(|record| record.active)
      .map(|record| record.id.as_str())
      .collect();
    armed
      .iter()
      .filter(|id| !live.contains(id.as_str()))
      .filter(|id| self.disarm(id))
      .count()
  }
}

/// Sweeps once immediately, then every `sweep_interval`, until shutdown.
pub(crate) async fn run_reconciliation_loop(
  engine: Arc<Engine>,
  mut shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
) {
  info!(interval = ?engine.config.sweep_interval, "Reconciliation loop started.");
  let mut ticker = tokio::time::interval(engine.config.sweep_interval);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    tokio::select! {
      biased;

      changed = shutdown_rx.changed() => {
        if changed.is_err() || shutdown_rx.borrow().is_some() {
          break;
        }
      }

      _ = ticker.tick() => {
        engine.sweep().await;
      }
    }
  }
  info!("Reconciliation loop shutting down.");
}
