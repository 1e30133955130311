//! demos/daily_schedule.rs
//!
//! Demonstrates a daily job: the sweep arms it, it fires, and settlement
//! persists tomorrow's occurrence.

use chrono::{Duration as ChronoDuration, NaiveTime, Timelike, Utc};
use firekeeper::{
  ExecutionRequest, ExecutionResult, FireKeeper, FnExecutor, InMemoryJobStore, JobRecord, ScheduleSpec,
  StaticIdentity, WeekdayName,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  // --- Setup Tracing ---
  let filter = tracing_subscriber::EnvFilter::try_new("warn,firekeeper=info,daily_schedule=trace")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  // --- Define Jobs ---
  // Today's occurrence lands a few seconds from now.
  let soon = (Utc::now() + ChronoDuration::seconds(3)).time();
  let time_of_day = NaiveTime::from_hms_opt(soon.hour(), soon.minute(), soon.second())
    .ok_or("invalid time of day")?;

  let store = Arc::new(InMemoryJobStore::new());
  store.insert(JobRecord::new(
    "daily-digest",
    "org-1",
    ScheduleSpec::daily_at(time_of_day),
    serde_json::json!({ "digest": "daily" }),
  ));
  // Never due within the horizon; the sweep only persists its next occurrence.
  store.insert(JobRecord::new(
    "weekend-cleanup",
    "org-1",
    ScheduleSpec::daily_at(NaiveTime::from_hms_opt(3, 30, 0).ok_or("invalid time of day")?)
      .on_weekdays([WeekdayName::Saturday, WeekdayName::Sunday])
      .in_timezone("America/New_York"),
    serde_json::json!({ "cleanup": "weekend" }),
  ));

  // --- Build Keeper ---
  let runs = Arc::new(AtomicUsize::new(0));
  let counter = runs.clone();
  let executor = FnExecutor::new(move |request: ExecutionRequest| {
    let counter = counter.clone();
    async move {
      let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
      info!(job_id = %request.job_id, scheduled_for = %request.scheduled_for, count, "*** Job executing ***");
      ExecutionResult::success("digest sent")
    }
  });

  let keeper = FireKeeper::builder()
    .store(store.clone())
    .executor(Arc::new(executor))
    .identity(Arc::new(StaticIdentity::new("demo", "localhost", "worker-0")))
    .horizon(StdDuration::from_secs(60))
    .manual_sweeps()
    .build()?;

  // --- Sweep and Wait ---
  let report = keeper.sweep_now().await?;
  info!(?report, "Initial sweep done.");
  for id in ["daily-digest", "weekend-cleanup"] {
    if let Some(record) = store.snapshot(id) {
      info!(job_id = id, status = %record.status, next = ?record.next_execution_time, "After sweep.");
    }
  }

  tokio::time::sleep(StdDuration::from_secs(5)).await;

  if let Some(record) = store.snapshot("daily-digest") {
    info!(
      status = %record.status,
      next = ?record.next_execution_time,
      log = ?record.log,
      "Digest settled."
    );
  }
  info!(runs = runs.load(Ordering::Relaxed), metrics = ?keeper.get_metrics_snapshot(), "Done.");

  keeper.shutdown_graceful(Some(StdDuration::from_secs(5))).await?;
  Ok(())
}
