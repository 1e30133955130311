use crate::job::JobId;

use chrono::{DateTime, Utc};

/// Represents the requested shutdown mode. Sent via a `watch` channel.
/// `None` indicates the scheduler is running normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Stop sweeping and ingesting, stop firing timers, and wait for executions
  /// already in flight to settle.
  Graceful,
  /// Stop all background tasks as soon as possible. In-flight executions are
  /// abandoned; their jobs stay `running`/`assigned` in the store.
  Force,
}

/// What the fire path must do after a settlement patch has been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FollowUp {
  /// Nothing further in this process; the sweep owns the job from here.
  None,
  /// Re-arm the same job for a retry attempt, staying `assigned`.
  Retry {
    job_id: JobId,
    at: DateTime<Utc>,
    attempt: u32,
  },
  /// The job went back to `pending` with a new occurrence; promote it now if
  /// it falls inside the near-term horizon.
  Promote { job_id: JobId, at: DateTime<Utc> },
  /// The job became inactive; make sure no timer survives for it.
  Disarm { job_id: JobId },
}
