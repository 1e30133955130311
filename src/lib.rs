//! FireKeeper: Persisted Job Timers, Kept in Sync
//!
//! Resolves recurrence rules into concrete execution instants and keeps an
//! in-process timer table consistent with job documents held in a persistent
//! store, across restarts, crashes, and several worker processes.
//!
//! # Features
//!
//! - Recurrence rules ([`ScheduleSpec`]) combining, in any mix:
//!   - a time of day in an IANA timezone,
//!   - allowed weekdays, days of the month, and months,
//!   - skipped calendar dates,
//!   - start and end boundaries,
//!   - a fixed interval,
//!   - a cron expression (requires the `cron_schedule` feature).
//! - A reconciliation sweep that arms jobs due within a near-term horizon,
//!   catches up runs missed while no process was watching, and re-arms
//!   assignments abandoned by a crashed worker.
//! - Change-feed ingestion that re-resolves and re-arms jobs as they are
//!   created, updated, deactivated, or deleted.
//! - A `pending -> assigned -> running -> completed | failed` lifecycle with
//!   per-job retry policies and a `log` entry recording the latest outcome.
//! - Pluggable [`JobStore`], [`TaskExecutor`], [`IdentityProvider`], and [`Clock`].
//! - Built-in metrics ([`MetricsSnapshot`]) and `tracing` instrumentation.
//! - Graceful and forced shutdown (with optional timeout).
//!
//! # Usage
//!
//! ```no_run
//! use firekeeper::{
//!     ChangeNotification, ChangeType, ExecutionRequest, ExecutionResult, FireKeeper, FnExecutor,
//!     InMemoryJobStore, JobRecord, ScheduleSpec, StaticIdentity,
//! };
//! use chrono::NaiveTime;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // tracing_subscriber::fmt().with_env_filter("warn,firekeeper=info").init();
//!
//!     let store = Arc::new(InMemoryJobStore::new());
//!     store.insert(JobRecord::new(
//!         "nightly-report",
//!         "org-1",
//!         ScheduleSpec::daily_at(NaiveTime::from_hms_opt(2, 0, 0).unwrap())
//!             .in_timezone("Europe/Berlin"),
//!         serde_json::json!({ "report": "usage" }),
//!     ));
//!
//!     let executor = FnExecutor::new(|request: ExecutionRequest| async move {
//!         println!("Running {} ({})", request.job_id, request.payload);
//!         ExecutionResult::success("report sent")
//!     });
//!
//!     let (feed_tx, feed_rx) = tokio::sync::broadcast::channel(64);
//!     let keeper = FireKeeper::builder()
//!         .store(store.clone())
//!         .executor(Arc::new(executor))
//!         .identity(Arc::new(StaticIdentity::new("cluster-a", "host-1", "worker-0")))
//!         .horizon(Duration::from_secs(5 * 60))
//!         .change_feed(feed_rx)
//!         .build()?;
//!
//!     // Whoever writes to the store publishes the change.
//!     let record = store.snapshot("nightly-report").unwrap();
//!     feed_tx.send(ChangeNotification::from_records(ChangeType::Update, "jobs", &[record])?)?;
//!
//!     tokio::time::sleep(Duration::from_secs(60)).await;
//!     println!("{:#?}", keeper.get_metrics_snapshot());
//!
//!     keeper.shutdown_graceful(Some(Duration::from_secs(10))).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Use the [`SchedulerBuilder`] (or a deserialized [`SyncConfig`]) to set:
//! - `sweep_interval`: time between reconciliation sweeps (default 5 minutes).
//! - `horizon`: how far ahead jobs are armed (default 5 minutes).
//! - `grace_window`: how long an `assigned` job may sit past due before it is
//!   considered abandoned (default 60 seconds).
//! - `job_collection`: change notifications for other collections are ignored.
//! - `catch_up_missed`: fire overdue `pending` jobs at the next sweep.
//!
//! # Job Lifecycle
//!
//! - The store is the source of truth; the timer table is a cache of what is
//!   due soon. A fired timer re-reads its job and discards itself if the job
//!   was deleted, deactivated, rescheduled, or claimed elsewhere.
//! - Jobs are armed only after `assigned` has been persisted.
//! - After execution, successes move to the next occurrence (`pending`) or
//!   `completed`; failures retry per the job's [`RetryPolicy`] and finally
//!   land in `failed`.
//!
//! # Observability
//!
//! - Retrieve metrics snapshots using [`FireKeeper::get_metrics_snapshot`].
//! - Each sweep returns a [`SweepReport`]; each notification an [`IngestReport`].
//! - Executions run inside a `job_exec` tracing span.

pub mod collaborator;
pub mod command;
pub mod config;
mod engine;
pub mod error;
pub mod ingest;
pub mod job;
pub mod lifecycle;
pub mod metrics;
pub mod reconcile;
pub mod resolver;
pub mod scheduler;
pub mod store;
pub mod timer;
mod worker;

// --- Public Re-exports ---

// Core scheduler components
pub use scheduler::{FireKeeper, SchedulerBuilder};
pub use config::SyncConfig;

// Error types
pub use error::{BuildError, PersistenceError, QueryError, ResolveError, ShutdownError, SyncError};

// Job related types
pub use job::{
  Assignment, InstanceId, JobId, JobLog, JobRecord, JobStatus, MonthName, RetryPolicy,
  ScheduleSpec, TaskPayload, WeekdayName,
};

// Resolution
pub use resolver::{resolve_next, NextRun};

// Collaborators
pub use collaborator::{
  ExecutionRequest, ExecutionResult, ExecutionStatus, FnExecutor, IdentityProvider,
  StaticIdentity, TaskExecutor,
};
pub use store::{InMemoryJobStore, JobPatch, JobQuery, JobStore};
pub use timer::{Clock, SystemClock, TimerTable, TokioClock};

// Sync
pub use ingest::{ChangeNotification, ChangeType, IngestReport};
pub use reconcile::SweepReport;

// Metrics related types
pub use metrics::MetricsSnapshot;
