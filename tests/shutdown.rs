//! tests/shutdown.rs
//! Tests for graceful and forced shutdown.

mod common;

use crate::common::{build_keeper, setup_tracing, utc, RecordingExecutor};
use chrono::NaiveTime;
use firekeeper::{
  ChangeNotification, ChangeType, InMemoryJobStore, JobRecord, JobStatus, QueryError,
  ScheduleSpec, ShutdownError,
};
use std::sync::Arc;
use std::time::Duration as StdDuration;

fn daily(id: &str, minute: u32) -> JobRecord {
  JobRecord::new(
    id,
    "org-1",
    ScheduleSpec::daily_at(NaiveTime::from_hms_opt(10, minute, 0).unwrap()),
    serde_json::Value::Null,
  )
  .with_next_execution_time(utc(2024, 9, 10, 10, minute, 0))
}

#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_waits_for_in_flight_execution() {
  setup_tracing();
  let store = Arc::new(InMemoryJobStore::with_records([daily("job", 1)]));
  let executor = RecordingExecutor::with_delay(StdDuration::from_secs(30));
  let keeper = build_keeper(store.clone(), executor.clone());

  keeper.sweep_now().await.unwrap();
  tokio::time::sleep(StdDuration::from_secs(61)).await;
  assert_eq!(executor.call_count(), 1);
  assert_eq!(keeper.get_metrics_snapshot().executions_in_flight, 1);

  keeper.shutdown_graceful(None).await.unwrap();

  assert_eq!(executor.completed(), 1);
  assert_eq!(keeper.get_metrics_snapshot().executions_in_flight, 0);
  let settled = store.snapshot("job").unwrap();
  assert_eq!(settled.status, JobStatus::Pending);
  assert_eq!(settled.next_execution_time, Some(utc(2024, 9, 11, 10, 1, 0)));

  assert!(matches!(
    keeper.sweep_now().await,
    Err(QueryError::SchedulerShutdown)
  ));
  let notification = ChangeNotification::new(ChangeType::Update, "jobs", Vec::new());
  assert!(matches!(
    keeper.handle_notification(&notification).await,
    Err(QueryError::SchedulerShutdown)
  ));
}

#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_times_out() {
  setup_tracing();
  let store = Arc::new(InMemoryJobStore::with_records([daily("job", 1)]));
  let executor = RecordingExecutor::with_delay(StdDuration::from_secs(600));
  let keeper = build_keeper(store, executor.clone());

  keeper.sweep_now().await.unwrap();
  tokio::time::sleep(StdDuration::from_secs(61)).await;

  let result = keeper.shutdown_graceful(Some(StdDuration::from_secs(5))).await;
  assert!(matches!(result, Err(ShutdownError::Timeout)));
  assert_eq!(executor.completed(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_force_shutdown_does_not_wait() {
  setup_tracing();
  let store = Arc::new(InMemoryJobStore::with_records([daily("job", 1)]));
  let executor = RecordingExecutor::with_delay(StdDuration::from_secs(30));
  let keeper = build_keeper(store.clone(), executor.clone());

  keeper.sweep_now().await.unwrap();
  tokio::time::sleep(StdDuration::from_secs(61)).await;

  keeper.shutdown_force(None).await.unwrap();
  assert_eq!(executor.completed(), 0);
  assert_eq!(store.snapshot("job").unwrap().status, JobStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drops_armed_timers_and_leaves_assignments() {
  setup_tracing();
  let store = Arc::new(InMemoryJobStore::with_records([daily("job", 3)]));
  let executor = RecordingExecutor::new();
  let keeper = build_keeper(store.clone(), executor.clone());

  keeper.sweep_now().await.unwrap();
  assert!(keeper.is_armed("job"));

  keeper.shutdown_graceful(None).await.unwrap();
  assert!(keeper.armed_jobs().is_empty());
  assert_eq!(keeper.get_metrics_snapshot().timers_armed, 0);
  // Left for stale recovery by whoever sweeps next.
  assert_eq!(store.snapshot("job").unwrap().status, JobStatus::Assigned);

  tokio::time::sleep(StdDuration::from_secs(300)).await;
  assert_eq!(executor.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_second_shutdown_is_harmless() {
  setup_tracing();
  let store = Arc::new(InMemoryJobStore::new());
  let keeper = build_keeper(store, RecordingExecutor::new());

  keeper.shutdown_graceful(None).await.unwrap();
  // Tasks are already joined; nothing is left to wait for.
  assert!(keeper.shutdown_force(None).await.is_ok());
}
