//! Change-feed ingestion: keeps the timer table in step with writes made by
//! anyone, between sweeps.

use crate::command::ShutdownMode;
use crate::engine::Engine;
use crate::error::SyncError;
use crate::job::{JobId, JobRecord, JobStatus};
use crate::lifecycle;
use crate::metrics::SyncMetrics;
use crate::resolver::{resolve_next, NextRun};
use crate::store::JobPatch;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
  Create,
  Update,
  Delete,
}

/// A batch of document changes from the store's change feed.
///
/// `records` are raw documents. For `Delete` only their `id` is read; for
/// `Create`/`Update` they must decode as [`JobRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
  pub change_type: ChangeType,
  pub collection: String,
  pub records: Vec<serde_json::Value>,
}

impl ChangeNotification {
  pub fn new(change_type: ChangeType, collection: &str, records: Vec<serde_json::Value>) -> Self {
    Self {
      change_type,
      collection: collection.to_string(),
      records,
    }
  }

  /// Builds a notification from typed records.
  pub fn from_records(
    change_type: ChangeType,
    collection: &str,
    records: &[JobRecord],
  ) -> Result<Self, serde_json::Error> {
    let records = records
      .iter()
      .map(serde_json::to_value)
      .collect::<Result<Vec<_>, _>>()?;
    Ok(Self::new(change_type, collection, records))
  }

  /// A delete notification carrying only ids.
  pub fn deleted(collection: &str, ids: &[&str]) -> Self {
    let records = ids.iter().map(|id| serde_json::json!({ "id": id })).collect();
    Self::new(ChangeType::Delete, collection, records)
  }
}

/// What ingesting one notification did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
  /// The notification was for another collection.
  pub ignored: bool,
  pub armed: usize,
  pub disarmed: usize,
  /// Next occurrence persisted but beyond the horizon.
  pub deferred: usize,
  /// Already armed for the same instant, or owned/executing elsewhere.
  pub unchanged: usize,
  pub completed: usize,
  pub failed: usize,
  /// Records that could not be decoded.
  pub rejected: usize,
}

enum Ingested {
  Armed,
  Deferred,
  Unchanged,
  Completed,
}

impl Engine {
  pub(crate) async fn ingest(&self, notification: &ChangeNotification) -> IngestReport {
    if !self.config.is_job_collection(&notification.collection) {
      SyncMetrics::incr(&self.metrics.notifications_ignored);
      trace!(collection = %notification.collection, "Ignoring notification for another collection.");
      return IngestReport {
        ignored: true,
        ..Default::default()
      };
    }
    SyncMetrics::incr(&self.metrics.notifications_processed);
    let now = self.clock.now();
    let mut report = IngestReport::default();

    // Phase one: everything deleted or deactivated loses its timer before any
    // record in the batch is armed.
    let mut pruned: HashSet<JobId> = HashSet::new();
    let mut live: Vec<JobRecord> = Vec::new();
    for value in &notification.records {
      match notification.change_type {
        ChangeType::Delete => match value.get("id").and_then(|id| id.as_str()) {
          Some(id) => {
            pruned.insert(id.to_string());
          }
          None => {
            warn!("Delete notification record has no id; skipping it.");
            report.rejected += 1;
          }
        },
        ChangeType::Create | ChangeType::Update => {
          match serde_json::from_value::<JobRecord>(value.clone()) {
            Ok(record) if !record.active => {
              pruned.insert(record.id);
            }
            Ok(record) => live.push(record),
            Err(e) => {
              warn!(error = %e, "Skipping undecodable job record.");
              report.rejected += 1;
            }
          }
        }
      }
    }
    report.disarmed += pruned.iter().filter(|id| self.disarm(id)).count();

    // Phase two: re-resolve and re-arm what is left.
    let results = join_all(
      live
        .iter()
        .filter(|record| !pruned.contains(&record.id))
        .map(|record| self.ingest_record(record, now)),
    )
    .await;
    for result in results {
      match result {
        Ok(Ingested::Armed) => report.armed += 1,
        Ok(Ingested::Deferred) => report.deferred += 1,
        Ok(Ingested::Unchanged) => report.unchanged += 1,
        Ok(Ingested::Completed) => report.completed += 1,
        Err(_) => report.failed += 1,
      }
    }

    debug!(
      change = ?notification.change_type,
      records = notification.records.len(),
      armed = report.armed,
      disarmed = report.disarmed,
      deferred = report.deferred,
      unchanged = report.unchanged,
      "Processed change notification."
    );
    report
  }

  async fn ingest_record(
    &self,
    record: &JobRecord,
    now: DateTime<Utc>,
  ) -> Result<Ingested, SyncError> {
    let job_id = &record.id;

    // Executing here or elsewhere: settlement decides what comes next.
    if self.is_in_flight(job_id) || record.status == JobStatus::Running {
      return Ok(Ingested::Unchanged);
    }
    if record.status == JobStatus::Assigned {
      if self.owned_elsewhere(record) {
        return Ok(Ingested::Unchanged);
      }
      // A pending retry is timed by its policy, not by the schedule.
      if let Some(next) = record.next_execution_time {
        if self.is_retry_armed(job_id, next) {
          return Ok(Ingested::Unchanged);
        }
      }
    }

    match resolve_next(&record.schedule, now) {
      Err(source) => {
        self.disarm(job_id);
        // Writing `failed` again would only echo back as another update.
        if record.status != JobStatus::Failed || record.next_execution_time.is_some() {
          self.write(job_id, &lifecycle::unsatisfiable(now, &source)).await?;
          SyncMetrics::incr(&self.metrics.jobs_failed);
        }
        let e = SyncError::ScheduleUnsatisfiable {
          job_id: job_id.clone(),
          source,
        };
        warn!(error = %e, "Job schedule is unsatisfiable.");
        Err(e)
      }
      Ok(NextRun::Exhausted) => {
        self.disarm(job_id);
        self
          .write(job_id, &lifecycle::complete(now, "schedule has no further occurrences"))
          .await?;
        SyncMetrics::incr(&self.metrics.jobs_completed);
        info!(%job_id, "Job schedule exhausted; completed.");
        Ok(Ingested::Completed)
      }
      Ok(NextRun::At(resolved)) => {
        let at = self.armed_occurrence(record, resolved);
        if self.timers.armed_at(job_id) == Some(at) {
          return Ok(Ingested::Unchanged);
        }
        if self.within_horizon(at, now) {
          self.promote(job_id, &record.job, at).await?;
          return Ok(Ingested::Armed);
        }
        self.disarm(job_id);
        if record.next_execution_time != Some(at) || record.status != JobStatus::Pending {
          let patch = JobPatch::new()
            .status(JobStatus::Pending)
            .next_execution_time(Some(at))
            .assignment(None);
          self.write(job_id, &patch).await?;
        }
        debug!(%job_id, next_run = %at, "Next occurrence is beyond the horizon.");
        Ok(Ingested::Deferred)
      }
    }
  }

  /// The occurrence `record` should be armed for, given the one resolved from
  /// now.
  ///
  /// The record's own later occurrence wins when it is still valid for the
  /// schedule and the resolved one has already been dealt with: either that
  /// later occurrence is what this process has armed, or the record was
  /// settled at or after the resolved instant.
  fn armed_occurrence(&self, record: &JobRecord, resolved: DateTime<Utc>) -> DateTime<Utc> {
    let Some(next) = record.next_execution_time else {
      return resolved;
    };
    if next <= resolved || resolve_next(&record.schedule, next) != Ok(NextRun::At(next)) {
      return resolved;
    }
    let armed_here = self.timers.armed_at(&record.id) == Some(next);
    let settled_since = record.log.as_ref().is_some_and(|log| log.timestamp >= resolved);
    if armed_here || settled_since {
      next
    } else {
      resolved
    }
  }
}

/// Feeds change notifications into the engine until the feed closes or the
/// scheduler shuts down.
pub(crate) async fn run_ingestion_loop(
  engine: Arc<Engine>,
  mut feed: broadcast::Receiver<ChangeNotification>,
  mut shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
) {
  info!(collection = %engine.config.job_collection, "Change feed ingestion started.");
  loop {
    tokio::select! {
      biased;

      changed = shutdown_rx.changed() => {
        if changed.is_err() || shutdown_rx.borrow().is_some() {
          break;
        }
      }

      received = feed.recv() => match received {
        Ok(notification) => {
          engine.ingest(&notification).await;
        }
        Err(RecvError::Lagged(skipped)) => {
          // The next sweep reconciles whatever was missed.
          warn!(skipped, "Change feed lagged; notifications were dropped.");
        }
        Err(RecvError::Closed) => {
          info!("Change feed closed.");
          break;
        }
      }
    }
  }
  info!("Change feed ingestion shutting down.");
}
