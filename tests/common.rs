//! tests/common.rs
//! Shared helpers for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use firekeeper::{
  error::PersistenceError,
  store::{JobPatch, JobQuery, UpdateAck, UpdateOptions},
  ExecutionRequest, ExecutionResult, FireKeeper, InMemoryJobStore, JobId, JobRecord, JobStore,
  StaticIdentity, TaskExecutor, TokioClock,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing_subscriber::fmt::TestWriter;

pub const COLLECTION: &str = "jobs";

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

pub fn utc(year: i32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
  Utc
    .with_ymd_and_hms(year, month, day, hour, minute, second)
    .single()
    .expect("valid UTC timestamp")
}

/// Tuesday 2024-09-10 10:00:00 UTC, the instant every keeper test starts at.
pub fn test_epoch() -> DateTime<Utc> {
  utc(2024, 9, 10, 10, 0, 0)
}

pub fn identity() -> StaticIdentity {
  StaticIdentity::new("cluster-a", "host-1", "worker-0")
}

pub fn other_identity() -> StaticIdentity {
  StaticIdentity::new("cluster-a", "host-2", "worker-7")
}

// --- Executor ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scripted {
  Succeed,
  Fail,
  Panic,
}

/// Records every request and answers from a script (success once it runs out).
#[derive(Debug, Default)]
pub struct RecordingExecutor {
  calls: Mutex<Vec<ExecutionRequest>>,
  script: Mutex<VecDeque<Scripted>>,
  delay: StdDuration,
  completed: AtomicUsize,
}

impl RecordingExecutor {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn scripted(script: impl IntoIterator<Item = Scripted>) -> Arc<Self> {
    Arc::new(Self {
      script: Mutex::new(script.into_iter().collect()),
      ..Self::default()
    })
  }

  pub fn with_delay(delay: StdDuration) -> Arc<Self> {
    Arc::new(Self {
      delay,
      ..Self::default()
    })
  }

  pub fn calls(&self) -> Vec<ExecutionRequest> {
    self.calls.lock().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().len()
  }

  /// Executions that ran to the end (not panicked).
  pub fn completed(&self) -> usize {
    self.completed.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl TaskExecutor for RecordingExecutor {
  async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
    tracing::debug!(job_id = %request.job_id, attempt = request.attempt, "Test executor running.");
    self.calls.lock().push(request);
    let step = self.script.lock().pop_front().unwrap_or(Scripted::Succeed);
    if self.delay > StdDuration::ZERO {
      tokio::time::sleep(self.delay).await;
    }
    match step {
      Scripted::Succeed => {
        self.completed.fetch_add(1, Ordering::SeqCst);
        ExecutionResult::success("ok")
      }
      Scripted::Fail => {
        self.completed.fetch_add(1, Ordering::SeqCst);
        ExecutionResult::failure("boom")
      }
      Scripted::Panic => panic!("Test executor forced panic!"),
    }
  }
}

// --- Store ---

/// An in-memory store whose reads and writes can be made to fail, and which
/// counts writes.
#[derive(Debug, Default)]
pub struct FlakyStore {
  pub inner: InMemoryJobStore,
  fail_reads: AtomicBool,
  fail_writes: AtomicBool,
  writes: AtomicUsize,
}

impl FlakyStore {
  pub fn with_records(records: impl IntoIterator<Item = JobRecord>) -> Arc<Self> {
    Arc::new(Self {
      inner: InMemoryJobStore::with_records(records),
      ..Self::default()
    })
  }

  pub fn fail_reads(&self, fail: bool) {
    self.fail_reads.store(fail, Ordering::SeqCst);
  }

  pub fn fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  pub fn writes(&self) -> usize {
    self.writes.load(Ordering::SeqCst)
  }

  pub fn snapshot(&self, id: &str) -> Option<JobRecord> {
    self.inner.snapshot(id)
  }
}

#[async_trait]
impl JobStore for FlakyStore {
  async fn read(&self, query: &JobQuery) -> Result<Vec<JobRecord>, PersistenceError> {
    if self.fail_reads.load(Ordering::SeqCst) {
      return Err(PersistenceError::Unavailable("reads disabled".into()));
    }
    self.inner.read(query).await
  }

  async fn update(
    &self,
    id: &JobId,
    patch: &JobPatch,
    options: UpdateOptions,
  ) -> Result<UpdateAck, PersistenceError> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(PersistenceError::Write {
        id: id.clone(),
        reason: "writes disabled".into(),
      });
    }
    self.writes.fetch_add(1, Ordering::SeqCst);
    self.inner.update(id, patch, options).await
  }
}

// --- Keeper ---

/// A keeper on a paused-time clock starting at [`test_epoch`], with periodic
/// sweeps off so each test drives sweeps itself.
pub fn build_keeper<S: JobStore + 'static>(
  store: Arc<S>,
  executor: Arc<RecordingExecutor>,
) -> FireKeeper {
  FireKeeper::builder()
    .store(store)
    .executor(executor)
    .identity(Arc::new(identity()))
    .clock(Arc::new(TokioClock::starting_at(test_epoch())))
    .horizon(StdDuration::from_secs(5 * 60))
    .grace_window(StdDuration::from_secs(60))
    .manual_sweeps()
    .build()
    .expect("keeper builds")
}
