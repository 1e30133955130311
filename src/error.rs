use crate::job::JobId;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur while building the scheduler with `SchedulerBuilder`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("A job store must be provided via `SchedulerBuilder::store`")]
  MissingStore,
  #[error("A task executor must be provided via `SchedulerBuilder::executor`")]
  MissingExecutor,
  #[error("The reconciliation sweep interval must be greater than zero")]
  ZeroSweepInterval,
}

// --- Resolution Errors ---

/// Errors produced by the recurrence resolver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
  /// The calendar constraints cannot be met within the bounded walk
  /// (e.g. `daysOfMonth: [31]` with `months: [February]`).
  #[error("Schedule cannot be satisfied within {days} days of {seed}")]
  ScheduleUnsatisfiable { seed: DateTime<Utc>, days: i64 },
  #[error("Unknown timezone '{0}'")]
  InvalidTimezone(String),
  #[error("Invalid cron expression '{expression}': {reason}")]
  InvalidCron { expression: String, reason: String },
  #[error("Cron expression '{0}' present but the `cron_schedule` feature is disabled")]
  CronUnsupported(String),
}

// --- Persistence Errors ---

/// Failures reported by a `JobStore` implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
  #[error("Job query failed: {0}")]
  Query(String),
  #[error("Write for job {id} failed: {reason}")]
  Write { id: JobId, reason: String },
  #[error("Persistence backend unavailable: {0}")]
  Unavailable(String),
}

// --- Job-scoped Errors ---

/// Failures scoped to a single job. None of these stop the process or the
/// processing of other jobs; they are logged and the job is left for the next
/// sweep, its retry policy, or an operator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
  #[error("Job {job_id}: {source}")]
  ScheduleUnsatisfiable {
    job_id: JobId,
    #[source]
    source: ResolveError,
  },
  #[error(transparent)]
  Persistence(#[from] PersistenceError),
  #[error("Job {job_id} execution failed: {message}")]
  ExecutionFailure { job_id: JobId, message: String },
  #[error("Job {job_id} was due at {next_execution_time} but never fired or never settled")]
  StaleAssignment {
    job_id: JobId,
    next_execution_time: DateTime<Utc>,
  },
  #[error("Job {0} no longer exists in the store")]
  JobVanished(JobId),
}

// --- Query Errors ---

/// Errors returned by the `FireKeeper` handle's query and trigger methods.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
  #[error("Scheduler is shut down or shutting down.")]
  SchedulerShutdown,
  #[error("Job {0} not found.")]
  JobNotFound(JobId),
  #[error("Job {0} is not active.")]
  JobInactive(JobId),
  #[error("Job {0} is executing in this process.")]
  JobRunning(JobId),
  #[error(transparent)]
  Sync(#[from] SyncError),
}

impl From<PersistenceError> for QueryError {
  fn from(err: PersistenceError) -> Self {
    QueryError::Sync(SyncError::Persistence(err))
  }
}

// --- Shutdown Errors ---

/// Errors related to the scheduler shutdown process (`shutdown_graceful`, `shutdown_force`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Failed to send shutdown signal (scheduler already shut down or watch channel error).")]
  SignalFailed,
  #[error("Timed out waiting for scheduler tasks to complete shutdown.")]
  Timeout,
  #[error("A background task panicked during the shutdown process.")]
  TaskPanic,
}
