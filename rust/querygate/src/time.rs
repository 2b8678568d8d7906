//! Wall-clock and cron helpers shared by the template store and the cache scheduler.

use chrono::{DateTime, Utc};
use cron::Schedule;
use parking_lot::Mutex;
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Source of "now" for timestamps and schedule computation.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[derive(Debug, Error)]
#[error("invalid cron expression '{expression}': {reason}")]
pub struct CronError {
    expression: String,
    reason: String,
}

/// Six-field (seconds first) cron schedule evaluated in UTC.
///
/// A seventh year field is accepted as well. Day-of-week values follow the `cron`
/// crate numbering (1 = Sunday) when given numerically; names such as `MON` are
/// unambiguous and preferred.
#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let trimmed = expression.trim();
        let fields = trimmed.split_whitespace().count();
        if !(6..=7).contains(&fields) {
            return Err(CronError {
                expression: expression.to_string(),
                reason: format!("expected 6 fields (sec min hour day month weekday), got {fields}"),
            });
        }

        let schedule = Schedule::from_str(trimmed).map_err(|err| CronError {
            expression: expression.to_string(),
            reason: err.to_string(),
        })?;

        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    /// First occurrence strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}
