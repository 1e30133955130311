//! tests/ingest.rs
//! Tests for change-feed ingestion.

mod common;

use crate::common::{
  build_keeper, identity, other_identity, setup_tracing, test_epoch, utc, FlakyStore,
  RecordingExecutor, Scripted, COLLECTION,
};
use chrono::NaiveTime;
use firekeeper::{
  ChangeNotification, ChangeType, FireKeeper, IdentityProvider, InMemoryJobStore, JobRecord,
  JobStatus, MonthName, ScheduleSpec, TokioClock,
};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::broadcast;

fn daily(id: &str, hour: u32, minute: u32) -> JobRecord {
  JobRecord::new(
    id,
    "org-1",
    ScheduleSpec::daily_at(NaiveTime::from_hms_opt(hour, minute, 0).unwrap()),
    serde_json::json!({ "$api": id }),
  )
}

fn notify(change_type: ChangeType, records: &[JobRecord]) -> ChangeNotification {
  ChangeNotification::from_records(change_type, COLLECTION, records).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_other_collections_are_ignored() {
  setup_tracing();
  let store = Arc::new(InMemoryJobStore::new());
  let keeper = build_keeper(store, RecordingExecutor::new());

  let report = keeper
    .handle_notification(&ChangeNotification::new(
      ChangeType::Create,
      "users",
      vec![serde_json::json!({ "id": "u-1" })],
    ))
    .await
    .unwrap();
  assert!(report.ignored);
  assert_eq!(keeper.get_metrics_snapshot().notifications_ignored, 1);
  assert!(keeper.armed_jobs().is_empty());

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_created_job_within_horizon_is_armed() {
  setup_tracing();
  let job = daily("job", 10, 3);
  let store = Arc::new(InMemoryJobStore::with_records([job.clone()]));
  let executor = RecordingExecutor::new();
  let keeper = build_keeper(store.clone(), executor.clone());

  let report = keeper
    .handle_notification(&notify(ChangeType::Create, &[job]))
    .await
    .unwrap();
  assert_eq!(report.armed, 1);
  assert_eq!(keeper.armed_at("job"), Some(utc(2024, 9, 10, 10, 3, 0)));

  let stored = store.snapshot("job").unwrap();
  assert_eq!(stored.status, JobStatus::Assigned);
  assert_eq!(stored.next_execution_time, Some(utc(2024, 9, 10, 10, 3, 0)));
  assert_eq!(stored.assignment, Some(identity().current_identity()));

  tokio::time::sleep(StdDuration::from_secs(185)).await;
  assert_eq!(executor.call_count(), 1);

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_job_beyond_horizon_is_persisted_not_armed() {
  setup_tracing();
  let job = daily("job", 18, 0);
  let store = Arc::new(InMemoryJobStore::with_records([job.clone()]));
  let keeper = build_keeper(store.clone(), RecordingExecutor::new());

  let report = keeper
    .handle_notification(&notify(ChangeType::Update, &[job]))
    .await
    .unwrap();
  assert_eq!(report.deferred, 1);
  assert!(!keeper.is_armed("job"));

  let stored = store.snapshot("job").unwrap();
  assert_eq!(stored.status, JobStatus::Pending);
  assert_eq!(stored.next_execution_time, Some(utc(2024, 9, 10, 18, 0, 0)));

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_own_assignment_echo_is_unchanged() {
  setup_tracing();
  let job = daily("job", 10, 3);
  let store = Arc::new(InMemoryJobStore::with_records([job.clone()]));
  let keeper = build_keeper(store.clone(), RecordingExecutor::new());

  keeper
    .handle_notification(&notify(ChangeType::Create, &[job]))
    .await
    .unwrap();

  // The assignment write comes back through the feed.
  let echo = store.snapshot("job").unwrap();
  let report = keeper
    .handle_notification(&notify(ChangeType::Update, &[echo]))
    .await
    .unwrap();
  assert_eq!(report.unchanged, 1);
  assert_eq!(report.armed, 0);
  assert_eq!(keeper.armed_at("job"), Some(utc(2024, 9, 10, 10, 3, 0)));
  assert_eq!(keeper.get_metrics_snapshot().jobs_assigned, 1);

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_job_owned_elsewhere_is_left_alone() {
  setup_tracing();
  let job = daily("job", 10, 3)
    .with_status(JobStatus::Assigned)
    .with_next_execution_time(utc(2024, 9, 10, 10, 3, 0))
    .with_assignment(other_identity().current_identity());
  let store = FlakyStore::with_records([job.clone()]);
  let keeper = build_keeper(store.clone(), RecordingExecutor::new());

  let report = keeper
    .handle_notification(&notify(ChangeType::Update, &[job]))
    .await
    .unwrap();
  assert_eq!(report.unchanged, 1);
  assert!(!keeper.is_armed("job"));
  assert_eq!(store.writes(), 0);

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_delete_and_deactivate_disarm() {
  setup_tracing();
  let first = daily("first", 10, 3);
  let second = daily("second", 10, 4);
  let store = Arc::new(InMemoryJobStore::with_records([first.clone(), second.clone()]));
  let keeper = build_keeper(store.clone(), RecordingExecutor::new());

  let report = keeper
    .handle_notification(&notify(ChangeType::Create, &[first, second]))
    .await
    .unwrap();
  assert_eq!(report.armed, 2);

  store.remove("first");
  let report = keeper
    .handle_notification(&ChangeNotification::deleted(COLLECTION, &["first"]))
    .await
    .unwrap();
  assert_eq!(report.disarmed, 1);
  assert!(!keeper.is_armed("first"));

  let deactivated = store.snapshot("second").unwrap().inactive();
  store.insert(deactivated.clone());
  let report = keeper
    .handle_notification(&notify(ChangeType::Update, &[deactivated]))
    .await
    .unwrap();
  assert_eq!(report.disarmed, 1);
  assert!(keeper.armed_jobs().is_empty());

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_deactivation_wins_within_a_batch() {
  setup_tracing();
  let job = daily("job", 10, 3);
  let store = Arc::new(InMemoryJobStore::with_records([job.clone()]));
  let keeper = build_keeper(store.clone(), RecordingExecutor::new());

  keeper
    .handle_notification(&notify(ChangeType::Create, &[job.clone()]))
    .await
    .unwrap();
  assert!(keeper.is_armed("job"));

  let report = keeper
    .handle_notification(&notify(ChangeType::Update, &[job.clone(), job.inactive()]))
    .await
    .unwrap();
  assert_eq!(report.disarmed, 1);
  assert_eq!(report.armed, 0);
  assert!(!keeper.is_armed("job"));

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unsatisfiable_job_is_failed_once() {
  setup_tracing();
  let broken = JobRecord::new(
    "broken",
    "org-1",
    ScheduleSpec::daily_at(NaiveTime::from_hms_opt(6, 0, 0).unwrap())
      .on_days_of_month([31])
      .in_months([MonthName::February]),
    serde_json::Value::Null,
  );
  let store = FlakyStore::with_records([broken.clone()]);
  let keeper = build_keeper(store.clone(), RecordingExecutor::new());

  let report = keeper
    .handle_notification(&notify(ChangeType::Create, &[broken]))
    .await
    .unwrap();
  assert_eq!(report.failed, 1);
  assert_eq!(store.writes(), 1);
  let failed = store.snapshot("broken").unwrap();
  assert_eq!(failed.status, JobStatus::Failed);
  assert!(failed.active);

  // Our own `failed` write echoing back must not be written again.
  let report = keeper
    .handle_notification(&notify(ChangeType::Update, &[failed]))
    .await
    .unwrap();
  assert_eq!(report.failed, 1);
  assert_eq!(store.writes(), 1);

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_schedule_completes_job() {
  setup_tracing();
  let mut job = daily("job", 9, 0);
  job.schedule = job.schedule.ending(utc(2024, 9, 1, 0, 0, 0));
  let store = Arc::new(InMemoryJobStore::with_records([job.clone()]));
  let keeper = build_keeper(store.clone(), RecordingExecutor::new());

  let report = keeper
    .handle_notification(&notify(ChangeType::Update, &[job]))
    .await
    .unwrap();
  assert_eq!(report.completed, 1);

  let stored = store.snapshot("job").unwrap();
  assert_eq!(stored.status, JobStatus::Completed);
  assert!(!stored.active);
  assert_eq!(stored.next_execution_time, None);

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_records_are_rejected() {
  setup_tracing();
  let job = daily("job", 10, 3);
  let store = Arc::new(InMemoryJobStore::with_records([job.clone()]));
  let keeper = build_keeper(store.clone(), RecordingExecutor::new());

  let mut notification = notify(ChangeType::Create, &[job]);
  notification.records.push(serde_json::json!({ "id": 42 }));
  let report = keeper.handle_notification(&notification).await.unwrap();
  assert_eq!(report.rejected, 1);
  assert_eq!(report.armed, 1);

  let report = keeper
    .handle_notification(&ChangeNotification::new(
      ChangeType::Delete,
      COLLECTION,
      vec![serde_json::json!({ "name": "no id" })],
    ))
    .await
    .unwrap();
  assert_eq!(report.rejected, 1);

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_change_feed_drives_ingestion() {
  setup_tracing();
  let job = daily("job", 10, 3);
  let store = Arc::new(InMemoryJobStore::with_records([job.clone()]));
  let executor = RecordingExecutor::new();
  let (feed_tx, feed_rx) = broadcast::channel(16);
  let keeper = FireKeeper::builder()
    .store(store.clone())
    .executor(executor.clone())
    .identity(Arc::new(identity()))
    .clock(Arc::new(TokioClock::starting_at(test_epoch())))
    .change_feed(feed_rx)
    .manual_sweeps()
    .build()
    .unwrap();

  feed_tx.send(notify(ChangeType::Create, &[job])).unwrap();
  tokio::time::sleep(StdDuration::from_millis(50)).await;
  assert_eq!(keeper.armed_at("job"), Some(utc(2024, 9, 10, 10, 3, 0)));
  assert_eq!(keeper.get_metrics_snapshot().notifications_processed, 1);

  tokio::time::sleep(StdDuration::from_secs(185)).await;
  assert_eq!(executor.call_count(), 1);

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_schedule_edit_moves_armed_job() {
  setup_tracing();
  let job = daily("job", 10, 3);
  let store = Arc::new(InMemoryJobStore::with_records([job.clone()]));
  let executor = RecordingExecutor::new();
  let keeper = build_keeper(store.clone(), executor.clone());

  keeper
    .handle_notification(&notify(ChangeType::Create, &[job]))
    .await
    .unwrap();
  assert_eq!(keeper.armed_at("job"), Some(utc(2024, 9, 10, 10, 3, 0)));

  // The user moves the job to the evening while the 10:03 timer is armed.
  let mut edited = store.snapshot("job").unwrap();
  edited.schedule.time = NaiveTime::from_hms_opt(23, 0, 0);
  store.insert(edited.clone());
  let report = keeper
    .handle_notification(&notify(ChangeType::Update, &[edited]))
    .await
    .unwrap();
  assert_eq!(report.deferred, 1);
  assert!(!keeper.is_armed("job"));

  let stored = store.snapshot("job").unwrap();
  assert_eq!(stored.status, JobStatus::Pending);
  assert_eq!(stored.next_execution_time, Some(utc(2024, 9, 10, 23, 0, 0)));
  assert_eq!(stored.assignment, None);

  tokio::time::sleep(StdDuration::from_secs(200)).await;
  assert_eq!(executor.call_count(), 0);

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_schedule_edit_to_earlier_time_is_not_skipped() {
  setup_tracing();
  let job = daily("job", 9, 0).with_next_execution_time(utc(2024, 9, 11, 9, 0, 0));
  let store = Arc::new(InMemoryJobStore::with_records([job.clone()]));
  let executor = RecordingExecutor::new();
  let keeper = build_keeper(store.clone(), executor.clone());

  // 10:02 today is still ahead even though tomorrow 09:00 was stored.
  let mut edited = job;
  edited.schedule.time = NaiveTime::from_hms_opt(10, 2, 0);
  store.insert(edited.clone());
  let report = keeper
    .handle_notification(&notify(ChangeType::Update, &[edited]))
    .await
    .unwrap();
  assert_eq!(report.armed, 1);
  assert_eq!(keeper.armed_at("job"), Some(utc(2024, 9, 10, 10, 2, 0)));
  assert_eq!(
    store.snapshot("job").unwrap().next_execution_time,
    Some(utc(2024, 9, 10, 10, 2, 0))
  );

  tokio::time::sleep(StdDuration::from_secs(125)).await;
  let calls = executor.calls();
  assert_eq!(calls.len(), 1);
  assert_eq!(calls[0].scheduled_for, utc(2024, 9, 10, 10, 2, 0));

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_retry_echo_keeps_retry_timer() {
  setup_tracing();
  let job = daily("job", 10, 2)
    .with_next_execution_time(utc(2024, 9, 10, 10, 2, 0))
    .with_retry_policy(2, StdDuration::from_secs(30));
  let store = Arc::new(InMemoryJobStore::with_records([job]));
  let executor = RecordingExecutor::scripted([Scripted::Fail]);
  let keeper = build_keeper(store.clone(), executor.clone());

  keeper.sweep_now().await.unwrap();
  tokio::time::sleep(StdDuration::from_secs(125)).await;
  assert_eq!(keeper.armed_at("job"), Some(utc(2024, 9, 10, 10, 2, 30)));

  // The retry write comes back through the feed.
  let echo = store.snapshot("job").unwrap();
  let report = keeper
    .handle_notification(&notify(ChangeType::Update, &[echo]))
    .await
    .unwrap();
  assert_eq!(report.unchanged, 1);
  assert_eq!(keeper.armed_at("job"), Some(utc(2024, 9, 10, 10, 2, 30)));

  tokio::time::sleep(StdDuration::from_secs(30)).await;
  let calls = executor.calls();
  assert_eq!(calls.len(), 2);
  assert_eq!(calls[1].attempt, 1);

  keeper.shutdown_graceful(None).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_interval_echo_keeps_armed_occurrence() {
  setup_tracing();
  let job = JobRecord::new(
    "ticker",
    "org-1",
    ScheduleSpec::every(StdDuration::from_secs(60)).starting(test_epoch()),
    serde_json::Value::Null,
  )
  .with_next_execution_time(utc(2024, 9, 10, 10, 1, 0));
  let store = Arc::new(InMemoryJobStore::with_records([job]));
  let keeper = build_keeper(store.clone(), RecordingExecutor::new());

  keeper.sweep_now().await.unwrap();
  assert_eq!(keeper.armed_at("ticker"), Some(utc(2024, 9, 10, 10, 1, 0)));

  // 10:00 is itself on the grid; the armed 10:01 must not be pulled back.
  let echo = store.snapshot("ticker").unwrap();
  let report = keeper
    .handle_notification(&notify(ChangeType::Update, &[echo]))
    .await
    .unwrap();
  assert_eq!(report.unchanged, 1);
  assert_eq!(keeper.armed_at("ticker"), Some(utc(2024, 9, 10, 10, 1, 0)));
  assert_eq!(keeper.get_metrics_snapshot().jobs_assigned, 1);

  keeper.shutdown_graceful(None).await.unwrap();
}
