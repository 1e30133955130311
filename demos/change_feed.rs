//! demos/change_feed.rs
//!
//! Demonstrates change-feed ingestion: a writer publishes job changes on a
//! broadcast channel and the keeper arms, re-arms, and disarms accordingly.

use chrono::{Duration as ChronoDuration, Utc};
use firekeeper::{
  ChangeNotification, ChangeType, ExecutionRequest, ExecutionResult, FireKeeper, FnExecutor, InMemoryJobStore,
  JobRecord, ScheduleSpec, StaticIdentity,
};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::broadcast;
use tracing::info;

const COLLECTION: &str = "jobs";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  // --- Setup Tracing ---
  let filter = tracing_subscriber::EnvFilter::try_new("warn,firekeeper=debug,change_feed=trace")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  // --- Build Keeper ---
  let store = Arc::new(InMemoryJobStore::new());
  let executor = FnExecutor::new(|request: ExecutionRequest| async move {
    info!(job_id = %request.job_id, attempt = request.attempt, "*** Job executing ***");
    ExecutionResult::success("ok")
  });

  let (feed_tx, feed_rx) = broadcast::channel(64);
  let keeper = FireKeeper::builder()
    .store(store.clone())
    .executor(Arc::new(executor))
    .identity(Arc::new(StaticIdentity::new("demo", "localhost", "worker-0")))
    .job_collection(COLLECTION)
    .change_feed(feed_rx)
    .manual_sweeps()
    .build()?;

  // --- Create ---
  // Every two seconds, starting now.
  let ticker = JobRecord::new(
    "ticker",
    "org-1",
    ScheduleSpec::every(StdDuration::from_secs(2)).starting(Utc::now()),
    serde_json::json!({ "tick": true }),
  );
  store.insert(ticker.clone());
  feed_tx.send(ChangeNotification::from_records(ChangeType::Create, COLLECTION, &[ticker])?)?;

  tokio::time::sleep(StdDuration::from_secs(5)).await;
  info!(armed_at = ?keeper.armed_at("ticker"), "Ticker running.");

  // --- Update ---
  // Push the start boundary out; the armed timer moves with it.
  let mut edited = store.snapshot("ticker").ok_or("ticker vanished")?;
  edited.schedule.start_boundary = Some(Utc::now() + ChronoDuration::hours(1));
  store.insert(edited.clone());
  feed_tx.send(ChangeNotification::from_records(ChangeType::Update, COLLECTION, &[edited])?)?;

  tokio::time::sleep(StdDuration::from_millis(200)).await;
  info!(
    armed = keeper.is_armed("ticker"),
    next = ?store.snapshot("ticker").and_then(|record| record.next_execution_time),
    "Ticker postponed."
  );

  // --- Delete ---
  store.remove("ticker");
  feed_tx.send(ChangeNotification::deleted(COLLECTION, &["ticker"]))?;

  tokio::time::sleep(StdDuration::from_millis(200)).await;
  info!(armed_jobs = ?keeper.armed_jobs(), metrics = ?keeper.get_metrics_snapshot(), "Done.");

  keeper.shutdown_graceful(Some(StdDuration::from_secs(5))).await?;
  Ok(())
}
