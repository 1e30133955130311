//! Persistence contract for job documents, plus an in-memory implementation.

use crate::error::PersistenceError;
use crate::job::{Assignment, JobId, JobLog, JobRecord, JobStatus};

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

// --- Query shapes ---

/// Equality/inequality filter on `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusFilter {
  Eq(JobStatus),
  Ne(JobStatus),
  In(Vec<JobStatus>),
}

impl StatusFilter {
  fn matches(&self, status: JobStatus) -> bool {
    match self {
      StatusFilter::Eq(expected) => status == *expected,
      StatusFilter::Ne(excluded) => status != *excluded,
      StatusFilter::In(allowed) => allowed.contains(&status),
    }
  }
}

/// Range filter on `nextExecutionTime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextExecutionFilter {
  /// `from <= t <= to`
  Between(DateTime<Utc>, DateTime<Utc>),
  /// `t < at`
  Before(DateTime<Utc>),
  /// `t > at`
  After(DateTime<Utc>),
  /// `nextExecutionTime` is not set.
  Unset,
}

impl NextExecutionFilter {
  fn matches(&self, next: Option<DateTime<Utc>>) -> bool {
    match (self, next) {
      (NextExecutionFilter::Unset, next) => next.is_none(),
      (_, None) => false,
      (NextExecutionFilter::Between(from, to), Some(t)) => *from <= t && t <= *to,
      (NextExecutionFilter::Before(at), Some(t)) => t < *at,
      (NextExecutionFilter::After(at), Some(t)) => t > *at,
    }
  }
}

/// A read against the job collection. Unset fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQuery {
  pub ids: Option<Vec<JobId>>,
  pub active: Option<bool>,
  pub status: Option<StatusFilter>,
  pub next_execution: Option<NextExecutionFilter>,
  /// Sort ascending by `nextExecutionTime` (unset last).
  pub sort_by_next_execution: bool,
  pub limit: Option<usize>,
}

impl JobQuery {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn by_id(id: &str) -> Self {
    Self::by_ids(vec![id.to_string()])
  }

  pub fn by_ids(ids: Vec<JobId>) -> Self {
    Self {
      ids: Some(ids),
      ..Self::default()
    }
  }

  /// The first active job due strictly after `at`.
  pub fn next_after(at: DateTime<Utc>) -> Self {
    Self::new()
      .active(true)
      .next_execution(NextExecutionFilter::After(at))
      .sorted()
      .limit(1)
  }

  pub fn active(mut self, active: bool) -> Self {
    self.active = Some(active);
    self
  }

  pub fn status(mut self, filter: StatusFilter) -> Self {
    self.status = Some(filter);
    self
  }

  pub fn next_execution(mut self, filter: NextExecutionFilter) -> Self {
    self.next_execution = Some(filter);
    self
  }

  pub fn sorted(mut self) -> Self {
    self.sort_by_next_execution = true;
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  /// Evaluates the filters against one record.
  pub fn matches(&self, record: &JobRecord) -> bool {
    self.ids.as_ref().map_or(true, |ids| ids.contains(&record.id))
      && self.active.map_or(true, |active| record.active == active)
      && self.status.as_ref().map_or(true, |f| f.matches(record.status))
      && self
        .next_execution
        .as_ref()
        .map_or(true, |f| f.matches(record.next_execution_time))
  }
}

// --- Patches ---

/// A partial update of the scheduling fields of a job document. Applied
/// atomically per record; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobPatch {
  pub status: Option<JobStatus>,
  /// `Some(None)` clears the field.
  pub next_execution_time: Option<Option<DateTime<Utc>>>,
  pub active: Option<bool>,
  pub assignment: Option<Option<Assignment>>,
  pub log: Option<JobLog>,
}

impl JobPatch {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn status(mut self, status: JobStatus) -> Self {
    self.status = Some(status);
    self
  }

  pub fn next_execution_time(mut self, at: Option<DateTime<Utc>>) -> Self {
    self.next_execution_time = Some(at);
    self
  }

  pub fn active(mut self, active: bool) -> Self {
    self.active = Some(active);
    self
  }

  pub fn assignment(mut self, assignment: Option<Assignment>) -> Self {
    self.assignment = Some(assignment);
    self
  }

  pub fn log(mut self, timestamp: DateTime<Utc>, status: JobStatus, message: impl Into<String>) -> Self {
    self.log = Some(JobLog {
      timestamp,
      status,
      message: message.into(),
    });
    self
  }

  pub fn is_empty(&self) -> bool {
    *self == Self::default()
  }

  pub fn apply(&self, record: &mut JobRecord) {
    if let Some(status) = self.status {
      record.status = status;
    }
    if let Some(next) = self.next_execution_time {
      record.next_execution_time = next;
    }
    if let Some(active) = self.active {
      record.active = active;
    }
    if let Some(assignment) = &self.assignment {
      record.assignment = assignment.clone();
    }
    if let Some(log) = &self.log {
      record.log = Some(log.clone());
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
  /// Create the document from the patch if it does not exist.
  pub upsert: bool,
}

/// Acknowledgement of an update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateAck {
  /// An existing document matched the id.
  pub matched: bool,
  /// A new document was created.
  pub upserted: bool,
}

// --- Store contract ---

/// The persistence backend holding job documents.
///
/// Implementations must apply each `update` atomically for its record.
#[async_trait]
pub trait JobStore: Send + Sync {
  async fn read(&self, query: &JobQuery) -> Result<Vec<JobRecord>, PersistenceError>;

  async fn update(
    &self,
    id: &JobId,
    patch: &JobPatch,
    options: UpdateOptions,
  ) -> Result<UpdateAck, PersistenceError>;

  async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, PersistenceError> {
    Ok(self.read(&JobQuery::by_id(id)).await?.into_iter().next())
  }
}

// --- In-memory implementation ---

/// A `JobStore` backed by a map. Useful for tests and single-process setups.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
  records: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_records(records: impl IntoIterator<Item = JobRecord>) -> Self {
    let store = Self::new();
    for record in records {
      store.insert(record);
    }
    store
  }

  /// Inserts or replaces a whole document.
  pub fn insert(&self, record: JobRecord) {
    self.records.write().insert(record.id.clone(), record);
  }

  pub fn remove(&self, id: &str) -> Option<JobRecord> {
    self.records.write().remove(id)
  }

  /// Reads a document synchronously.
  pub fn snapshot(&self, id: &str) -> Option<JobRecord> {
    self.records.read().get(id).cloned()
  }

  pub fn len(&self) -> usize {
    self.records.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
  async fn read(&self, query: &JobQuery) -> Result<Vec<JobRecord>, PersistenceError> {
    let records = self.records.read();
    let mut matched: Vec<JobRecord> = records
      .values()
      .filter(|record| query.matches(record))
      .cloned()
      .collect();
    drop(records);

    if query.sort_by_next_execution {
      matched.sort_by(|a, b| match (a.next_execution_time, b.next_execution_time) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.id.cmp(&b.id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.id.cmp(&b.id),
      });
    }
    if let Some(limit) = query.limit {
      matched.truncate(limit);
    }
    Ok(matched)
  }

  async fn update(
    &self,
    id: &JobId,
    patch: &JobPatch,
    options: UpdateOptions,
  ) -> Result<UpdateAck, PersistenceError> {
    let mut records = self.records.write();
    match records.get_mut(id) {
      Some(record) => {
        patch.apply(record);
        Ok(UpdateAck {
          matched: true,
          upserted: false,
        })
      }
      None if options.upsert => {
        let mut record = JobRecord {
          id: id.clone(),
          ..JobRecord::default()
        };
        patch.apply(&mut record);
        records.insert(id.clone(), record);
        Ok(UpdateAck {
          matched: false,
          upserted: true,
        })
      }
      None => Ok(UpdateAck::default()),
    }
  }
}
