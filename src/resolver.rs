//! Recurrence resolution: schedule + instant -> next execution instant.
//!
//! [`resolve_next`] is pure. Calendar constraints are walked on the local wall
//! clock of the schedule's timezone and the result is converted back to UTC.

use crate::error::ResolveError;
use crate::job::{MonthName, ScheduleSpec, WeekdayName};

use chrono::{
  DateTime, Datelike, Duration as ChronoDuration, LocalResult, Months, NaiveDateTime, TimeZone,
  Timelike, Utc,
};
use chrono_tz::Tz;
#[cfg(feature = "cron_schedule")]
use cron::Schedule as CronSchedule;
#[cfg(feature = "cron_schedule")]
use std::str::FromStr;

/// Upper bound on how far past the seed the calendar walk may move (4 years).
pub const MAX_WALK_DAYS: i64 = 4 * 365 + 1;

/// Outcome of a successful resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRun {
  /// The next occurrence.
  At(DateTime<Utc>),
  /// The schedule has no further occurrences.
  Exhausted,
}

impl NextRun {
  pub fn instant(self) -> Option<DateTime<Utc>> {
    match self {
      NextRun::At(at) => Some(at),
      NextRun::Exhausted => None,
    }
  }
}

/// Resolves the next occurrence of `schedule` at or after `now`.
///
/// The walk below is greedy rather than a search for the earliest match: a
/// month walk keeps the day of month, so `months: [October]` seeded on
/// 15 September lands on 15 October, not 1 October.
///
/// Steps, in order:
/// 1. seed = `max(now, startBoundary)`
/// 2. a skipped date moves the candidate one day forward
/// 3. walk days until the weekday is allowed
/// 4. walk days until the day of month is allowed
/// 5. walk months until the month is allowed
/// 6. overwrite the time of day with `time`
/// 7. past `endBoundary` -> [`NextRun::Exhausted`]
/// 8. a cron expression, if present, picks the first match at or after the candidate
///
/// Steps 2-6 repeat until the candidate meets every calendar constraint and is
/// not before the seed. Step 6 can land earlier than the seed on the seed's
/// own day; the candidate then moves to the next day and the walk continues.
///
/// Without a cron expression or time of day, an `interval` combined with a
/// `startBoundary` snaps the candidate up to the grid `start + k * interval`.
/// A grid point beyond the representable range is [`NextRun::Exhausted`].
pub fn resolve_next(schedule: &ScheduleSpec, now: DateTime<Utc>) -> Result<NextRun, ResolveError> {
  let tz = parse_timezone(&schedule.timezone)?;

  let seed = match schedule.start_boundary {
    Some(start) if start > now => start,
    _ => now,
  };

  let mut walk = CalendarWalk::new(schedule, tz, seed);
  let mut candidate = walk.settle()?;

  if schedule.cron_expression.is_none() && schedule.time.is_none() {
    if let (Some(interval), Some(start)) = (schedule.interval, schedule.start_boundary) {
      match snap_to_interval(candidate, start, interval) {
        Some(snapped) => candidate = snapped,
        None => return Ok(NextRun::Exhausted),
      }
    }
  }

  if let Some(end) = schedule.end_boundary {
    if candidate > end {
      return Ok(NextRun::Exhausted);
    }
  }

  let Some(expression) = schedule.cron_expression.as_deref() else {
    return Ok(NextRun::At(candidate));
  };

  match next_cron_match(expression, tz, candidate)? {
    Some(at) if schedule.end_boundary.map_or(true, |end| at <= end) => Ok(NextRun::At(at)),
    _ => Ok(NextRun::Exhausted),
  }
}

/// Seed for the occurrence following one that fired at `fired_at`.
///
/// Interval schedules space runs by the interval; everything else only has to
/// move strictly past the instant that just fired.
pub fn successor_seed(
  schedule: &ScheduleSpec,
  fired_at: DateTime<Utc>,
  now: DateTime<Utc>,
) -> DateTime<Utc> {
  let step = match schedule.interval {
    Some(interval) if schedule.cron_expression.is_none() && schedule.time.is_none() => {
      ChronoDuration::from_std(interval).unwrap_or(ChronoDuration::seconds(1))
    }
    _ => ChronoDuration::seconds(1),
  };
  let after_fire = fired_at.checked_add_signed(step).unwrap_or(fired_at);
  after_fire.max(now)
}

pub(crate) fn parse_timezone(timezone: &str) -> Result<Tz, ResolveError> {
  timezone
    .parse::<Tz>()
    .map_err(|_| ResolveError::InvalidTimezone(timezone.to_string()))
}

// --- Calendar walk ---

struct CalendarWalk<'a> {
  schedule: &'a ScheduleSpec,
  tz: Tz,
  seed: DateTime<Utc>,
  seed_local: NaiveDateTime,
  /// Candidate on the local wall clock.
  local: NaiveDateTime,
}

impl<'a> CalendarWalk<'a> {
  fn new(schedule: &'a ScheduleSpec, tz: Tz, seed: DateTime<Utc>) -> Self {
    let seed_local = seed.with_timezone(&tz).naive_local();
    Self {
      schedule,
      tz,
      seed,
      seed_local,
      local: seed_local,
    }
  }

  /// Runs steps 2-6 to a fixed point and returns the candidate in UTC.
  fn settle(&mut self) -> Result<DateTime<Utc>, ResolveError> {
    loop {
      if self.is_skipped() {
        self.advance_day()?;
      }
      while !self.weekday_allowed() {
        self.advance_day()?;
      }
      while !self.month_day_allowed() {
        self.advance_day()?;
      }
      while !self.month_allowed() {
        self.advance_month()?;
      }
      if let Some(time) = self.schedule.time {
        self.local = self.local.date().and_time(time);
      }

      let candidate = localize(self.tz, self.local);
      if candidate < self.seed {
        self.advance_day()?;
        continue;
      }
      if self.satisfied() {
        return Ok(candidate);
      }
    }
  }

  fn satisfied(&self) -> bool {
    !self.is_skipped() && self.weekday_allowed() && self.month_day_allowed() && self.month_allowed()
  }

  fn is_skipped(&self) -> bool {
    self
      .schedule
      .skip_dates
      .as_ref()
      .is_some_and(|dates| dates.contains(&self.local.date()))
  }

  fn weekday_allowed(&self) -> bool {
    self
      .schedule
      .weekdays()
      .map_or(true, |days| days.contains(&WeekdayName::from(self.local.weekday())))
  }

  fn month_day_allowed(&self) -> bool {
    self
      .schedule
      .month_days()
      .map_or(true, |days| days.contains(&self.local.day()))
  }

  fn month_allowed(&self) -> bool {
    self.schedule.month_names().map_or(true, |months| {
      MonthName::from_number(self.local.month()).is_some_and(|name| months.contains(&name))
    })
  }

  fn advance_day(&mut self) -> Result<(), ResolveError> {
    let next = self
      .local
      .checked_add_signed(ChronoDuration::days(1))
      .ok_or_else(|| self.unsatisfiable())?;
    self.set(next)
  }

  fn advance_month(&mut self) -> Result<(), ResolveError> {
    let next = self
      .local
      .checked_add_months(Months::new(1))
      .ok_or_else(|| self.unsatisfiable())?;
    self.set(next)
  }

  fn set(&mut self, next: NaiveDateTime) -> Result<(), ResolveError> {
    if (next.date() - self.seed_local.date()).num_days() > MAX_WALK_DAYS {
      return Err(self.unsatisfiable());
    }
    self.local = next;
    Ok(())
  }

  fn unsatisfiable(&self) -> ResolveError {
    ResolveError::ScheduleUnsatisfiable {
      seed: self.seed,
      days: MAX_WALK_DAYS,
    }
  }
}

/// Maps a local wall-clock time to UTC. Ambiguous times take the earlier
/// mapping; times inside a DST gap move forward by an hour.
fn localize(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
  let resolved = match tz.from_local_datetime(&local) {
    LocalResult::Single(dt) => Some(dt),
    LocalResult::Ambiguous(earliest, _) => Some(earliest),
    LocalResult::None => tz
      .from_local_datetime(&(local + ChronoDuration::hours(1)))
      .earliest(),
  };
  match resolved {
    Some(dt) => dt.with_timezone(&Utc),
    None => Utc.from_utc_datetime(&local),
  }
}

/// Next grid point `start + k * interval` at or after `candidate`. `None` when
/// that point is past the last representable instant.
fn snap_to_interval(
  candidate: DateTime<Utc>,
  start: DateTime<Utc>,
  interval: std::time::Duration,
) -> Option<DateTime<Utc>> {
  if candidate <= start {
    return Some(start);
  }
  let step_ms = i64::try_from(interval.as_millis()).ok()?;
  if step_ms == 0 {
    return Some(candidate);
  }
  let elapsed_ms = (candidate - start).num_milliseconds();
  let steps = elapsed_ms / step_ms + i64::from(elapsed_ms % step_ms != 0);
  let offset = ChronoDuration::try_milliseconds(steps.checked_mul(step_ms)?)?;
  start.checked_add_signed(offset)
}

// --- Cron delegation ---

/// Accepts classic five-field expressions by adding a seconds field.
#[cfg(feature = "cron_schedule")]
fn normalize_cron(expression: &str) -> String {
  let trimmed = expression.trim();
  if trimmed.split_whitespace().count() == 5 {
    format!("0 {trimmed}")
  } else {
    trimmed.to_string()
  }
}

/// First instant matching `expression` at or after `candidate`, evaluated in `tz`.
#[cfg(feature = "cron_schedule")]
fn next_cron_match(
  expression: &str,
  tz: Tz,
  candidate: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ResolveError> {
  let schedule =
    CronSchedule::from_str(&normalize_cron(expression)).map_err(|e| ResolveError::InvalidCron {
      expression: expression.to_string(),
      reason: e.to_string(),
    })?;

  // `after` is exclusive. Step back one second from a whole-second candidate
  // so the candidate itself can match.
  let whole_second = candidate.with_nanosecond(0).unwrap_or(candidate);
  let reference = if whole_second == candidate {
    whole_second - ChronoDuration::seconds(1)
  } else {
    whole_second
  };

  Ok(
    schedule
      .after(&reference.with_timezone(&tz))
      .next()
      .map(|dt| dt.with_timezone(&Utc)),
  )
}

#[cfg(not(feature = "cron_schedule"))]
fn next_cron_match(
  expression: &str,
  _tz: Tz,
  _candidate: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ResolveError> {
  Err(ResolveError::CronUnsupported(expression.to_string()))
}
