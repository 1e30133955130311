use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Month, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Public Type Aliases ---

/// Identifier of a persisted job document.
pub type JobId = String;

/// Identifier of one armed timer for a job. A fresh UUID v4 is minted every
/// time a job is armed, so log lines can tell re-armings apart.
pub type InstanceId = Uuid;

/// Opaque task description carried by a job document (`$crud`, `$api`, ...).
/// The core never looks inside it; it is handed to the task executor as-is.
pub type TaskPayload = serde_json::Value;

pub(crate) fn default_timezone() -> String {
  "UTC".to_string()
}

fn default_true() -> bool {
  true
}

// --- Calendar Names ---

/// Weekday names as stored in job documents (`"Monday"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WeekdayName {
  Monday,
  Tuesday,
  Wednesday,
  Thursday,
  Friday,
  Saturday,
  Sunday,
}

impl From<Weekday> for WeekdayName {
  fn from(day: Weekday) -> Self {
    match day {
      Weekday::Mon => WeekdayName::Monday,
      Weekday::Tue => WeekdayName::Tuesday,
      Weekday::Wed => WeekdayName::Wednesday,
      Weekday::Thu => WeekdayName::Thursday,
      Weekday::Fri => WeekdayName::Friday,
      Weekday::Sat => WeekdayName::Saturday,
      Weekday::Sun => WeekdayName::Sunday,
    }
  }
}

/// Month names as stored in job documents (`"January"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MonthName {
  January,
  February,
  March,
  April,
  May,
  June,
  July,
  August,
  September,
  October,
  November,
  December,
}

impl MonthName {
  /// Maps a 1-based month number (as returned by `Datelike::month`).
  pub fn from_number(month: u32) -> Option<Self> {
    let month = Month::try_from(u8::try_from(month).ok()?).ok()?;
    Some(match month {
      Month::January => MonthName::January,
      Month::February => MonthName::February,
      Month::March => MonthName::March,
      Month::April => MonthName::April,
      Month::May => MonthName::May,
      Month::June => MonthName::June,
      Month::July => MonthName::July,
      Month::August => MonthName::August,
      Month::September => MonthName::September,
      Month::October => MonthName::October,
      Month::November => MonthName::November,
      Month::December => MonthName::December,
    })
  }
}

// --- Schedule Specification ---

/// The recurrence rule of a job document.
///
/// Field names serialize in camelCase so documents written by an existing
/// deployment deserialize unchanged. Empty allow-lists behave as if absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
  /// Explicit cron expression. Five-field expressions are accepted and get a
  /// leading seconds field of `0`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cron_expression: Option<String>,
  /// No occurrence is resolved before this instant.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub start_boundary: Option<DateTime<Utc>>,
  /// No occurrence is resolved after this instant.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub end_boundary: Option<DateTime<Utc>>,
  /// Fixed spacing between runs, in milliseconds on the wire.
  #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_duration_ms")]
  pub interval: Option<StdDuration>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub days_of_week: Option<BTreeSet<WeekdayName>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub days_of_month: Option<BTreeSet<u32>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub months: Option<BTreeSet<MonthName>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub skip_dates: Option<BTreeSet<NaiveDate>>,
  /// IANA timezone id all calendar constraints are evaluated in.
  #[serde(default = "default_timezone")]
  pub timezone: String,
  /// Local time of day (`HH:MM:SS`) each occurrence fires at.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub time: Option<NaiveTime>,
}

impl Default for ScheduleSpec {
  fn default() -> Self {
    Self {
      cron_expression: None,
      start_boundary: None,
      end_boundary: None,
      interval: None,
      days_of_week: None,
      days_of_month: None,
      months: None,
      skip_dates: None,
      timezone: default_timezone(),
      time: None,
    }
  }
}

impl ScheduleSpec {
  /// A schedule that only fires once, at the first instant its constraints allow.
  pub fn once() -> Self {
    Self::default()
  }

  /// Fires every day at `time` (UTC unless `in_timezone` is applied).
  pub fn daily_at(time: NaiveTime) -> Self {
    Self {
      time: Some(time),
      ..Self::default()
    }
  }

  pub fn from_cron(expression: &str) -> Self {
    Self {
      cron_expression: Some(expression.to_string()),
      ..Self::default()
    }
  }

  pub fn every(interval: StdDuration) -> Self {
    Self {
      interval: Some(interval),
      ..Self::default()
    }
  }

  pub fn in_timezone(mut self, timezone: &str) -> Self {
    self.timezone = timezone.to_string();
    self
  }

  pub fn on_weekdays(mut self, days: impl IntoIterator<Item = WeekdayName>) -> Self {
    self.days_of_week = Some(days.into_iter().collect());
    self
  }

  pub fn on_days_of_month(mut self, days: impl IntoIterator<Item = u32>) -> Self {
    self.days_of_month = Some(days.into_iter().collect());
    self
  }

  pub fn in_months(mut self, months: impl IntoIterator<Item = MonthName>) -> Self {
    self.months = Some(months.into_iter().collect());
    self
  }

  pub fn skipping(mut self, dates: impl IntoIterator<Item = NaiveDate>) -> Self {
    self.skip_dates = Some(dates.into_iter().collect());
    self
  }

  pub fn starting(mut self, at: DateTime<Utc>) -> Self {
    self.start_boundary = Some(at);
    self
  }

  pub fn ending(mut self, at: DateTime<Utc>) -> Self {
    self.end_boundary = Some(at);
    self
  }

  /// Whether the schedule yields more than one occurrence.
  ///
  /// Only a cron expression, a time of day, or an interval make a schedule
  /// repeat. Anything else describes a single run at the first instant the
  /// calendar constraints allow.
  pub fn is_recurring(&self) -> bool {
    self.cron_expression.is_some() || self.time.is_some() || self.interval.is_some()
  }

  pub(crate) fn weekdays(&self) -> Option<&BTreeSet<WeekdayName>> {
    self.days_of_week.as_ref().filter(|set| !set.is_empty())
  }

  pub(crate) fn month_days(&self) -> Option<&BTreeSet<u32>> {
    self.days_of_month.as_ref().filter(|set| !set.is_empty())
  }

  pub(crate) fn month_names(&self) -> Option<&BTreeSet<MonthName>> {
    self.months.as_ref().filter(|set| !set.is_empty())
  }
}

// --- Job Record ---

/// Persisted lifecycle status of a job document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
  #[default]
  Pending,
  Assigned,
  Running,
  Completed,
  Failed,
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      JobStatus::Pending => "pending",
      JobStatus::Assigned => "assigned",
      JobStatus::Running => "running",
      JobStatus::Completed => "completed",
      JobStatus::Failed => "failed",
    };
    f.write_str(name)
  }
}

/// How often, and how far apart, failed executions are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
  pub retries: u32,
  #[serde(with = "duration_ms")]
  pub retry_interval: StdDuration,
}

/// Ownership stamp written when a job is assigned to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
  pub cluster_id: String,
  pub server_id: String,
  pub worker_id: String,
}

/// Last recorded outcome on a job document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLog {
  pub timestamp: DateTime<Utc>,
  pub status: JobStatus,
  pub message: String,
}

/// A job document as held by the persistence backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
  pub id: JobId,
  #[serde(default)]
  pub organization_id: String,
  #[serde(default)]
  pub schedule: ScheduleSpec,
  #[serde(default)]
  pub next_execution_time: Option<DateTime<Utc>>,
  #[serde(default)]
  pub status: JobStatus,
  #[serde(default = "default_true")]
  pub active: bool,
  #[serde(default)]
  pub job: TaskPayload,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub retry_policy: Option<RetryPolicy>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub assignment: Option<Assignment>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub log: Option<JobLog>,
}

impl Default for JobRecord {
  fn default() -> Self {
    Self {
      id: JobId::new(),
      organization_id: String::new(),
      schedule: ScheduleSpec::default(),
      next_execution_time: None,
      status: JobStatus::Pending,
      active: true,
      job: TaskPayload::Null,
      retry_policy: None,
      assignment: None,
      log: None,
    }
  }
}

impl JobRecord {
  /// Creates an active, pending job with no resolved execution time.
  pub fn new(id: &str, organization_id: &str, schedule: ScheduleSpec, job: TaskPayload) -> Self {
    Self {
      id: id.to_string(),
      organization_id: organization_id.to_string(),
      schedule,
      job,
      ..Self::default()
    }
  }

  pub fn with_next_execution_time(mut self, at: DateTime<Utc>) -> Self {
    self.next_execution_time = Some(at);
    self
  }

  pub fn with_status(mut self, status: JobStatus) -> Self {
    self.status = status;
    self
  }

  pub fn with_retry_policy(mut self, retries: u32, retry_interval: StdDuration) -> Self {
    self.retry_policy = Some(RetryPolicy {
      retries,
      retry_interval,
    });
    self
  }

  pub fn with_assignment(mut self, assignment: Assignment) -> Self {
    self.assignment = Some(assignment);
    self
  }

  pub fn inactive(mut self) -> Self {
    self.active = false;
    self
  }
}

// --- Serde helpers ---

pub(crate) mod duration_ms {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
  }
}

pub(crate) mod opt_duration_ms {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(
    value: &Option<Duration>,
    serializer: S,
  ) -> Result<S::Ok, S::Error> {
    match value {
      Some(duration) => super::duration_ms::serialize(duration, serializer),
      None => serializer.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(
    deserializer: D,
  ) -> Result<Option<Duration>, D::Error> {
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
  }
}
