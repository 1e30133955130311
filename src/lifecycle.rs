//! Job status transitions.
//!
//! `pending -> assigned -> running -> {completed | failed} -> pending`
//!
//! Every transition is expressed as a [`JobPatch`] computed from the current
//! record. The engine persists the patch and carries out the side effects
//! (arming, disarming, promoting).

use crate::collaborator::ExecutionResult;
use crate::command::FollowUp;
use crate::error::ResolveError;
use crate::job::{Assignment, JobRecord, JobStatus};
use crate::resolver::{resolve_next, successor_seed, NextRun};
use crate::store::JobPatch;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// `pending -> assigned`: stamp ownership and pin the fire instant.
pub fn assign(next_execution_time: DateTime<Utc>, identity: Assignment) -> JobPatch {
  JobPatch::new()
    .status(JobStatus::Assigned)
    .next_execution_time(Some(next_execution_time))
    .assignment(Some(identity))
}

/// `assigned -> running`.
pub fn start_running() -> JobPatch {
  JobPatch::new().status(JobStatus::Running)
}

/// Schedule exhausted: the job becomes inactive and `completed`.
pub fn complete(now: DateTime<Utc>, message: impl Into<String>) -> JobPatch {
  JobPatch::new()
    .active(false)
    .status(JobStatus::Completed)
    .next_execution_time(None)
    .log(now, JobStatus::Completed, message)
}

/// Schedule cannot be resolved: `failed`, left active for an operator.
pub fn unsatisfiable(now: DateTime<Utc>, error: &ResolveError) -> JobPatch {
  JobPatch::new()
    .status(JobStatus::Failed)
    .next_execution_time(None)
    .log(now, JobStatus::Failed, error.to_string())
}

/// How a finished execution left the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettledAs {
  /// Back to `pending` for the next occurrence.
  Rescheduled(DateTime<Utc>),
  /// No further occurrences; inactive.
  Completed,
  /// Still `assigned`, to be retried at `at`.
  RetryScheduled { at: DateTime<Utc>, attempt: u32 },
  /// Retries exhausted. `next` holds the following occurrence for repeating
  /// jobs, which stay active.
  Failed { next: Option<DateTime<Utc>> },
  /// The schedule could not be resolved.
  Unsatisfiable(ResolveError),
}

/// A `running -> *` transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
  pub patch: JobPatch,
  pub outcome: SettledAs,
}

impl Settlement {
  pub(crate) fn follow_up(&self, record: &JobRecord) -> FollowUp {
    let job_id = record.id.clone();
    match &self.outcome {
      SettledAs::Rescheduled(at) => FollowUp::Promote { job_id, at: *at },
      SettledAs::RetryScheduled { at, attempt } => FollowUp::Retry {
        job_id,
        at: *at,
        attempt: *attempt,
      },
      SettledAs::Completed => FollowUp::Disarm { job_id },
      SettledAs::Failed { next: Some(at) } => FollowUp::Promote { job_id, at: *at },
      SettledAs::Failed { next: None } => FollowUp::Disarm { job_id },
      SettledAs::Unsatisfiable(_) => FollowUp::None,
    }
  }
}

/// Decides where a job goes after an execution attempt.
///
/// * success on a repeating schedule -> next occurrence, `pending`
/// * success with nothing left (or a one-shot schedule) -> `completed`, inactive
/// * failure with retries left -> `assigned` again at `now + retryInterval`
/// * failure with retries spent -> `failed`; repeating jobs keep their next
///   occurrence and stay active, one-shots become inactive
pub fn settle(
  record: &JobRecord,
  attempt: u32,
  fired_at: DateTime<Utc>,
  result: &ExecutionResult,
  now: DateTime<Utc>,
) -> Settlement {
  if !result.is_success() {
    if let Some(policy) = record.retry_policy {
      if attempt < policy.retries {
        let delay = ChronoDuration::from_std(policy.retry_interval).unwrap_or(ChronoDuration::zero());
        let at = now + delay;
        let next_attempt = attempt + 1;
        return Settlement {
          patch: JobPatch::new()
            .status(JobStatus::Assigned)
            .next_execution_time(Some(at))
            .log(
              now,
              JobStatus::Failed,
              format!(
                "{} (retry {} of {} at {})",
                result.message, next_attempt, policy.retries, at
              ),
            ),
          outcome: SettledAs::RetryScheduled {
            at,
            attempt: next_attempt,
          },
        };
      }
    }
  }

  let next = if record.schedule.is_recurring() {
    resolve_next(&record.schedule, successor_seed(&record.schedule, fired_at, now))
  } else {
    Ok(NextRun::Exhausted)
  };

  let next = match next {
    Ok(next) => next,
    Err(error) => {
      return Settlement {
        patch: unsatisfiable(now, &error),
        outcome: SettledAs::Unsatisfiable(error),
      };
    }
  };

  match (result.is_success(), next) {
    (true, NextRun::At(at)) => Settlement {
      patch: JobPatch::new()
        .status(JobStatus::Pending)
        .next_execution_time(Some(at))
        .assignment(None)
        .log(now, JobStatus::Completed, result.message.clone()),
      outcome: SettledAs::Rescheduled(at),
    },
    (true, NextRun::Exhausted) => Settlement {
      patch: complete(now, result.message.clone()),
      outcome: SettledAs::Completed,
    },
    (false, NextRun::At(at)) => Settlement {
      patch: JobPatch::new()
        .status(JobStatus::Failed)
        .next_execution_time(Some(at))
        .assignment(None)
        .log(now, JobStatus::Failed, result.message.clone()),
      outcome: SettledAs::Failed { next: Some(at) },
    },
    (false, NextRun::Exhausted) => Settlement {
      patch: JobPatch::new()
        .active(false)
        .status(JobStatus::Failed)
        .next_execution_time(None)
        .log(now, JobStatus::Failed, result.message.clone()),
      outcome: SettledAs::Failed { next: None },
    },
  }
}
