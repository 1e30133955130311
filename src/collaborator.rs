//! Contracts for the collaborators the scheduler calls out to: the task
//! executor and the identity provider.

use crate::job::{Assignment, InstanceId, JobId, TaskPayload};

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Task execution ---

/// Everything the executor learns about one fired occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
  pub job_id: JobId,
  pub organization_id: String,
  /// The armed timer this execution came from.
  pub instance_id: InstanceId,
  /// 0 for the scheduled run, 1.. for retries.
  pub attempt: u32,
  pub scheduled_for: DateTime<Utc>,
  pub payload: TaskPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
  Success,
  Failure,
}

/// Result reported by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
  pub status: ExecutionStatus,
  pub message: String,
}

impl ExecutionResult {
  pub fn success(message: impl Into<String>) -> Self {
    Self {
      status: ExecutionStatus::Success,
      message: message.into(),
    }
  }

  pub fn failure(message: impl Into<String>) -> Self {
    Self {
      status: ExecutionStatus::Failure,
      message: message.into(),
    }
  }

  pub fn is_success(&self) -> bool {
    self.status == ExecutionStatus::Success
  }
}

/// Runs a job's payload.
///
/// Expected to return promptly; long-running work and its timeout belong to
/// the implementation. A reported failure drives the job's retry policy.
/// Panics are caught and treated as failures.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
  async fn execute(&self, request: ExecutionRequest) -> ExecutionResult;
}

/// Adapts an async closure into a [`TaskExecutor`].
pub struct FnExecutor<F> {
  func: F,
}

impl<F> FnExecutor<F> {
  pub fn new(func: F) -> Self {
    Self { func }
  }
}

impl<F> fmt::Debug for FnExecutor<F> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FnExecutor")
      .field("func", &format_args!("<Fn>"))
      .finish()
  }
}

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
  F: Fn(ExecutionRequest) -> Fut + Send + Sync,
  Fut: Future<Output = ExecutionResult> + Send,
{
  async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
    (self.func)(request).await
  }
}

// --- Identity ---

/// Supplies the ownership stamp written onto jobs this process assigns.
///
/// This is an opaque read. Guaranteeing that two processes never both claim
/// the same job (leases, fencing tokens) is the provider's responsibility.
pub trait IdentityProvider: Send + Sync {
  fn current_identity(&self) -> Assignment;
}

/// A fixed identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticIdentity(Assignment);

impl StaticIdentity {
  pub fn new(cluster_id: &str, server_id: &str, worker_id: &str) -> Self {
    Self(Assignment {
      cluster_id: cluster_id.to_string(),
      server_id: server_id.to_string(),
      worker_id: worker_id.to_string(),
    })
  }
}

impl Default for StaticIdentity {
  fn default() -> Self {
    Self::new("local", "localhost", "0")
  }
}

impl IdentityProvider for StaticIdentity {
  fn current_identity(&self) -> Assignment {
    self.0.clone()
  }
}
