use crate::collaborator::{ExecutionRequest, ExecutionResult};
use crate::command::FollowUp;
use crate::engine::Engine;
use crate::error::SyncError;
use crate::job::{JobRecord, JobStatus};
use crate::lifecycle::{self, SettledAs, Settlement};
use crate::metrics::SyncMetrics;
use crate::timer::FiredTimer;

use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, trace, warn, Instrument};

/// Why a fired timer was dropped without executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discard {
  Deleted,
  Inactive,
  Rescheduled,
  NotAssigned(JobStatus),
  OwnedElsewhere,
}

impl Discard {
  fn as_str(&self) -> &'static str {
    match self {
      Discard::Deleted => "job no longer exists",
      Discard::Inactive => "job is inactive",
      Discard::Rescheduled => "job was rescheduled after arming",
      Discard::NotAssigned(_) => "job is not assigned",
      Discard::OwnedElsewhere => "job is assigned to another worker",
    }
  }
}

/// Timer work left once an execution has settled.
struct NextStep {
  follow_up: FollowUp,
  record: JobRecord,
  now: DateTime<Utc>,
}

impl Engine {
  /// Entry point for every fired timer.
  pub(crate) async fn on_fire(&self, fired: FiredTimer, attempt: u32) {
    SyncMetrics::incr(&self.metrics.timers_fired);
    let job_id = fired.job_id.clone();
    self.clear_retry(&job_id, fired.fire_at);

    if self.is_shutting_down() {
      debug!(%job_id, "Timer fired during shutdown; not executing.");
      SyncMetrics::incr(&self.metrics.fires_discarded);
      return;
    }
    if !self.begin_execution(&job_id) {
      warn!(%job_id, "Timer fired while the job is still executing; skipping.");
      SyncMetrics::incr(&self.metrics.fires_discarded);
      return;
    }

    let job_span = tracing::span!(
      tracing::Level::INFO,
      "job_exec",
      %job_id,
      instance_id = %fired.instance_id,
      attempt
    );
    let next_step = self.run_fired(fired, attempt).instrument(job_span.clone()).await;

    // Out of the in-flight set before any follow-up: its timer may already be due.
    self.finish_execution(&job_id);
    if let Some(step) = next_step {
      self
        .apply_follow_up(step.follow_up, &step.record, step.now)
        .instrument(job_span)
        .await;
    }
  }

  async fn run_fired(&self, fired: FiredTimer, attempt: u32) -> Option<NextStep> {
    // The store is the source of truth: the timer only carries a snapshot.
    let record = match self.fetch(&fired.job_id).await {
      Ok(Some(record)) => record,
      Ok(None) => {
        self.discard(&fired, Discard::Deleted);
        return None;
      }
      Err(e) => {
        // Leave the record alone; the stale-assignment sweep re-arms it.
        warn!(error = %e, "Could not re-read job before executing; skipping this fire.");
        SyncMetrics::incr(&self.metrics.fires_discarded);
        return None;
      }
    };
    if let Some(reason) = self.fire_rejection(&record, fired.fire_at) {
      self.discard(&fired, reason);
      return None;
    }

    if let Err(e) = self.write(&record.id, &lifecycle::start_running()).await {
      warn!(error = %e, "Could not mark job running; executing anyway.");
    }

    let request = ExecutionRequest {
      job_id: record.id.clone(),
      organization_id: record.organization_id.clone(),
      instance_id: fired.instance_id,
      attempt,
      scheduled_for: fired.fire_at,
      payload: fired.payload,
    };

    info!(scheduled_for = %fired.fire_at, "Starting job execution.");
    let started = Instant::now();
    let result = self.execute(request).await;
    let duration = started.elapsed();
    self.metrics.execution_duration.record(duration);
    info!(
      duration_ms = duration.as_millis(),
      success = result.is_success(),
      message = %result.message,
      "Finished job execution."
    );

    let now = self.clock.now();
    let settlement = lifecycle::settle(&record, attempt, fired.fire_at, &result, now);
    self.record_settlement(&record, &result, &settlement);

    match self.write(&record.id, &settlement.patch).await {
      Ok(ack) if !ack.matched => {
        info!("Job was deleted during execution; dropping its settlement.");
        self.disarm(&record.id);
        return None;
      }
      Ok(_) => {}
      Err(_) => {
        // The follow-up depends on this write: without it a new timer would be
        // rejected on fire. The next sweep flushes it and picks the job up.
        warn!("Deferring settlement until the next sweep.");
        self.defer(&record.id, settlement.patch);
        return None;
      }
    }

    Some(NextStep {
      follow_up: settlement.follow_up(&record),
      record,
      now,
    })
  }

  /// Checks the freshly read record against the timer that fired.
  fn fire_rejection(&self, record: &JobRecord, fire_at: DateTime<Utc>) -> Option<Discard> {
    if !record.active {
      return Some(Discard::Inactive);
    }
    if record.next_execution_time != Some(fire_at) {
      return Some(Discard::Rescheduled);
    }
    if record.status != JobStatus::Assigned {
      return Some(Discard::NotAssigned(record.status));
    }
    if self.owned_elsewhere(record) {
      return Some(Discard::OwnedElsewhere);
    }
    None
  }

  fn discard(&self, fired: &FiredTimer, reason: Discard) {
    SyncMetrics::incr(&self.metrics.fires_discarded);
    match reason {
      Discard::NotAssigned(status) => {
        info!(%status, fire_at = %fired.fire_at, "Discarding fire: {}.", reason.as_str())
      }
      _ => info!(fire_at = %fired.fire_at, "Discarding fire: {}.", reason.as_str()),
    }
  }

  /// Runs the executor on its own task so a panic surfaces as a `JoinError`
  /// instead of unwinding through the scheduler.
  async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
    let executor = self.executor.clone();
    let task = tokio::spawn(async move { executor.execute(request).await });

    match task.await {
      Ok(result) => {
        if result.is_success() {
          SyncMetrics::incr(&self.metrics.executions_succeeded);
        } else {
          SyncMetrics::incr(&self.metrics.executions_failed);
        }
        result
      }
      Err(join_error) if join_error.is_panic() => {
        error!("Executor panicked.");
        SyncMetrics::incr(&self.metrics.executions_panicked);
        ExecutionResult::failure("executor panicked")
      }
      Err(_) => {
        warn!("Execution task was cancelled.");
        SyncMetrics::incr(&self.metrics.executions_failed);
        ExecutionResult::failure("execution cancelled")
      }
    }
  }

  fn record_settlement(&self, record: &JobRecord, result: &ExecutionResult, settlement: &Settlement) {
    match &settlement.outcome {
      SettledAs::Rescheduled(next) => {
        info!(next_run = %next, "Job settled; next occurrence resolved.");
      }
      SettledAs::Completed => {
        SyncMetrics::incr(&self.metrics.jobs_completed);
        info!("Job has no further occurrences; completed.");
      }
      SettledAs::RetryScheduled { at, attempt } => {
        SyncMetrics::incr(&self.metrics.retries_scheduled);
        info!(retry_attempt = attempt, next_run = %at, "Job failed, scheduling retry.");
      }
      SettledAs::Failed { next } => {
        SyncMetrics::incr(&self.metrics.jobs_failed);
        let failure = SyncError::ExecutionFailure {
          job_id: record.id.clone(),
          message: result.message.clone(),
        };
        match next {
          Some(next) => error!(error = %failure, next_run = %next, "Retries exhausted; keeping next occurrence."),
          None => error!(error = %failure, "Retries exhausted and no further occurrences."),
        }
      }
      SettledAs::Unsatisfiable(e) => {
        SyncMetrics::incr(&self.metrics.jobs_failed);
        error!(error = %e, "Job schedule has no satisfiable next occurrence.");
      }
    }
  }

  pub(crate) async fn apply_follow_up(
    &self,
    follow_up: FollowUp,
    record: &JobRecord,
    now: DateTime<Utc>,
  ) {
    match follow_up {
      FollowUp::None => {}
      FollowUp::Retry { job_id, at, attempt } => {
        let instance_id = self.arm(&job_id, at, record.job.clone(), attempt);
        trace!(%instance_id, retry_attempt = attempt, "Armed retry timer.");
      }
      FollowUp::Promote { job_id, at } => {
        if !self.within_horizon(at, now) {
          debug!(next_run = %at, "Next occurrence is beyond the horizon; leaving it to the sweep.");
          return;
        }
        if let Err(e) = self.promote(&job_id, &record.job, at).await {
          warn!(error = %e, "Could not promote next occurrence; the sweep will retry.");
        }
      }
      FollowUp::Disarm { job_id } => {
        self.disarm(&job_id);
      }
    }
  }
}
