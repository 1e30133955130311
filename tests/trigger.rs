//! tests/trigger.rs
//! Tests for running a job ahead of its schedule.

mod common;

use crate::common::{build_keeper, setup_tracing, test_epoch, utc, RecordingExecutor};
use chrono::NaiveTime;
use firekeeper::{InMemoryJobStore, JobRecord, JobStatus, QueryError, ScheduleSpec};
use std::sync::Arc;
use std::time::Duration as StdDuration;

fn tomorrow_morning() -> JobRecord {
  JobRecord::new(
    "job",
    "org-1",
    ScheduleSpec::daily_at(NaiveTime::from_hms_opt(9, 0, 0).unwrap()),
    serde_json::json!({ "$api": "report" }),
  )
  .with_next_execution_time(utc(2024, 9, 11, 9, 0, 0))
}

#[tokio::test(start_paused = true)]
async fn test_trigger_runs_job_immediately() {
  setup_tracing();
  let store = Arc::new(InMemoryJobStore::with_records([tomorrow_morning()]));
  let executor = RecordingExecutor::new();
  let keeper = build_keeper(store.clone(), executor.clone());

  keeper.trigger_job_now("job").await.unwrap();
  assert_eq!(keeper.armed_at("job"), Some(test_epoch()));

  tokio::time::sleep(StdDuration::from_secs(1)).await;
  let calls = executor.calls();
  assert_eq!(calls.len(), 1);
  assert_eq!(calls[0].scheduled_for, test_epoch());
  assert_eq!(calls[0].payload, serde_json::json!({ "$api": "report" }));

  let settled = store.snapshot("job").unwrap();
  assert_eq!(settled.status, JobStatus::Pending);
  assert_eq!(settled.next_execution_time, Some(utc(2024, 9, 11, 9, 0, 0)));

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_trigger_rejects_missing_and_inactive_jobs() {
  setup_tracing();
  let store = Arc::new(InMemoryJobStore::with_records([tomorrow_morning().inactive()]));
  let keeper = build_keeper(store, RecordingExecutor::new());

  let missing = keeper.trigger_job_now("missing").await;
  assert!(matches!(missing, Err(QueryError::JobNotFound(id)) if id == "missing"));

  let inactive = keeper.trigger_job_now("job").await;
  assert!(matches!(inactive, Err(QueryError::JobInactive(id)) if id == "job"));
  assert!(keeper.armed_jobs().is_empty());

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_trigger_rejects_job_already_executing() {
  setup_tracing();
  let store = Arc::new(InMemoryJobStore::with_records([tomorrow_morning()]));
  let executor = RecordingExecutor::with_delay(StdDuration::from_secs(30));
  let keeper = build_keeper(store, executor.clone());

  keeper.trigger_job_now("job").await.unwrap();
  tokio::time::sleep(StdDuration::from_secs(1)).await;
  assert_eq!(executor.call_count(), 1);

  let again = keeper.trigger_job_now("job").await;
  assert!(matches!(again, Err(QueryError::JobRunning(id)) if id == "job"));

  tokio::time::sleep(StdDuration::from_secs(30)).await;
  assert_eq!(executor.completed(), 1);
  assert_eq!(executor.call_count(), 1);

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_trigger_after_shutdown_fails() {
  setup_tracing();
  let store = Arc::new(InMemoryJobStore::with_records([tomorrow_morning()]));
  let keeper = build_keeper(store, RecordingExecutor::new());

  keeper.shutdown_graceful(None).await.unwrap();
  let result = keeper.trigger_job_now("job").await;
  assert!(matches!(result, Err(QueryError::SchedulerShutdown)));
}
