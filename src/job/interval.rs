//! ISO-8601 recurrence intervals (`PnYnMnWnDTnHnMnS`).

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Months};
use regex::Regex;

use crate::error::SchedulerError;

fn duration_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"^P(?:(\d+)Y)?(?:(\d+)M)?(?:(\d+)W)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?)?$",
            )
            .ok()
        })
        .as_ref()
}

/// Time between two occurrences of a planned job.
///
/// Years and months are calendar months; everything else is a fixed
/// number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecurrenceInterval {
    months: u32,
    seconds: i64,
}

impl RecurrenceInterval {
    /// Builds an interval of fixed seconds.
    pub fn from_secs(seconds: i64) -> Result<Self, SchedulerError> {
        if seconds <= 0 {
            return Err(SchedulerError::InvalidInterval(format!("PT{seconds}S")));
        }
        Ok(Self { months: 0, seconds })
    }

    pub fn months(&self) -> u32 {
        self.months
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    /// Adds one interval to a unix timestamp.
    pub fn add_to(&self, ts: i64) -> Result<i64, SchedulerError> {
        let mut next = ts;
        if self.months > 0 {
            next = DateTime::from_timestamp(ts, 0)
                .and_then(|dt| dt.checked_add_months(Months::new(self.months)))
                .map(|dt| dt.timestamp())
                .ok_or_else(|| SchedulerError::InvalidInterval(self.to_string()))?;
        }
        next.checked_add(self.seconds)
            .ok_or_else(|| SchedulerError::InvalidInterval(self.to_string()))
    }

    /// First occurrence strictly after `reference`, stepping from `start`.
    ///
    /// Missed occurrences collapse into one: the result is never more than
    /// one interval past `reference`. A `start` already after `reference`
    /// is returned unchanged.
    pub fn advance_past(&self, start: i64, reference: i64) -> Result<i64, SchedulerError> {
        if start > reference {
            return Ok(start);
        }
        if self.months == 0 {
            let steps = (reference - start) / self.seconds + 1;
            return steps
                .checked_mul(self.seconds)
                .and_then(|delta| start.checked_add(delta))
                .ok_or_else(|| SchedulerError::InvalidInterval(self.to_string()));
        }
        let mut next = start;
        while next <= reference {
            next = self.add_to(next)?;
        }
        Ok(next)
    }
}

impl FromStr for RecurrenceInterval {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SchedulerError::InvalidInterval(s.to_string());
        let caps = duration_pattern()
            .and_then(|re| re.captures(s))
            .ok_or_else(invalid)?;

        let part = |i: usize| -> Result<i64, SchedulerError> {
            match caps.get(i) {
                Some(m) => m.as_str().parse::<i64>().map_err(|_| invalid()),
                None => Ok(0),
            }
        };

        let months = part(1)?
            .checked_mul(12)
            .and_then(|m| m.checked_add(part(2).ok()?))
            .ok_or_else(invalid)?;
        let seconds = [(3, 604_800), (4, 86_400), (5, 3_600), (6, 60), (7, 1)]
            .iter()
            .try_fold(0i64, |acc, (i, unit)| {
                part(*i)?
                    .checked_mul(*unit)
                    .and_then(|v| acc.checked_add(v))
                    .ok_or_else(invalid)
            })?;

        if months == 0 && seconds == 0 {
            return Err(invalid());
        }
        Ok(Self {
            months: u32::try_from(months).map_err(|_| invalid())?,
            seconds,
        })
    }
}

impl fmt::Display for RecurrenceInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P")?;
        if self.months > 0 {
            write!(f, "{}M", self.months)?;
        }
        if self.seconds > 0 {
            write!(f, "T{}S", self.seconds)?;
        }
        Ok(())
    }
}
