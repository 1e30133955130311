use crate::job::duration_ms;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_HORIZON: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_JOB_COLLECTION: &str = "jobs";

/// Tunables for reconciliation and ingestion.
///
/// Deserializes from camelCase keys with durations in milliseconds, so a host
/// application can load it from its own config file:
///
/// ```
/// let config: firekeeper::SyncConfig =
///   serde_json::from_str(r#"{ "horizonMs": 120000, "jobCollection": "tasks" }"#).unwrap();
/// assert_eq!(config.horizon, std::time::Duration::from_secs(120));
/// assert_eq!(config.grace_window, std::time::Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
  /// Time between reconciliation sweeps.
  #[serde(rename = "sweepIntervalMs", with = "duration_ms")]
  pub sweep_interval: Duration,
  /// Jobs due within this window are armed proactively.
  #[serde(rename = "horizonMs", with = "duration_ms")]
  pub horizon: Duration,
  /// How long past due an `assigned` job may sit before it counts as stale.
  #[serde(rename = "graceWindowMs", with = "duration_ms")]
  pub grace_window: Duration,
  /// Notifications for other collections are ignored.
  pub job_collection: String,
  /// Fire `pending` jobs whose occurrence passed while nobody was watching.
  pub catch_up_missed: bool,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      sweep_interval: DEFAULT_SWEEP_INTERVAL,
      horizon: DEFAULT_HORIZON,
      grace_window: DEFAULT_GRACE_WINDOW,
      job_collection: DEFAULT_JOB_COLLECTION.to_string(),
      catch_up_missed: true,
    }
  }
}

impl SyncConfig {
  pub(crate) fn horizon_chrono(&self) -> chrono::Duration {
    chrono::Duration::from_std(self.horizon).unwrap_or_else(|_| chrono::Duration::days(36_500))
  }

  pub(crate) fn grace_chrono(&self) -> chrono::Duration {
    chrono::Duration::from_std(self.grace_window).unwrap_or_else(|_| chrono::Duration::days(36_500))
  }

  pub(crate) fn is_job_collection(&self, collection: &str) -> bool {
    self.job_collection == collection
  }
}
