//! Weekly schedules that gate when a rule is active.
//!
//! A [`Schedule`] is a set of weekdays plus one or more `[start, end)`
//! time-of-day ranges. Schedules are evaluated against the host's local
//! wall-clock time; callers pass a [`NaiveDateTime`] already expressed in
//! that zone.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{Datelike, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RuleError};

/// Days of the week for schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Sunday,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
}

impl Weekday {
    /// Returns Monday through Friday.
    pub fn weekdays() -> Vec<Weekday> {
        vec![
            Weekday::Monday,
            Weekday::Tuesday,
            Weekday::Wednesday,
            Weekday::Thursday,
            Weekday::Friday,
        ]
    }

    /// Returns Saturday and Sunday.
    pub fn weekends() -> Vec<Weekday> {
        vec![Weekday::Saturday, Weekday::Sunday]
    }

    /// Returns all days of the week, Sunday first.
    pub fn all() -> Vec<Weekday> {
        (0..7).filter_map(Weekday::from_index).collect()
    }

    /// Converts a day index (0 = Sunday .. 6 = Saturday).
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Weekday::Sunday),
            1 => Some(Weekday::Monday),
            2 => Some(Weekday::Tuesday),
            3 => Some(Weekday::Wednesday),
            4 => Some(Weekday::Thursday),
            5 => Some(Weekday::Friday),
            6 => Some(Weekday::Saturday),
            _ => None,
        }
    }

    /// Returns the day index (0 = Sunday .. 6 = Saturday).
    pub fn index(&self) -> u8 {
        *self as u8
    }

    /// Converts from chrono's Weekday.
    pub fn from_chrono(weekday: chrono::Weekday) -> Self {
        match weekday {
            chrono::Weekday::Mon => Weekday::Monday,
            chrono::Weekday::Tue => Weekday::Tuesday,
            chrono::Weekday::Wed => Weekday::Wednesday,
            chrono::Weekday::Thu => Weekday::Thursday,
            chrono::Weekday::Fri => Weekday::Friday,
            chrono::Weekday::Sat => Weekday::Saturday,
            chrono::Weekday::Sun => Weekday::Sunday,
        }
    }
}

/// Time of day with minute granularity, written as `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    /// Hour (0-23).
    pub hour: u8,
    /// Minute (0-59).
    pub minute: u8,
}

impl TimeOfDay {
    /// Creates a new TimeOfDay.
    ///
    /// # Panics
    /// Panics if hour >= 24 or minute >= 60. Use [`TimeOfDay::parse`] for
    /// untrusted input.
    pub fn new(hour: u8, minute: u8) -> Self {
        assert!(hour < 24, "hour must be 0-23");
        assert!(minute < 60, "minute must be 0-59");
        Self { hour, minute }
    }

    /// Parses a strict `HH:MM` string.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || RuleError::invalid("time", format!("'{}' is not a valid HH:MM time", s));

        let (h, m) = s.split_once(':').ok_or_else(invalid)?;
        if h.len() != 2 || m.len() != 2 {
            return Err(invalid());
        }
        let hour: u8 = h.parse().map_err(|_| invalid())?;
        let minute: u8 = m.parse().map_err(|_| invalid())?;
        if hour >= 24 || minute >= 60 {
            return Err(invalid());
        }

        Ok(Self { hour, minute })
    }

    /// Converts to minutes since midnight for comparison.
    pub fn to_minutes(&self) -> u16 {
        self.hour as u16 * 60 + self.minute as u16
    }

    /// Creates from a chrono NaiveTime, dropping seconds.
    pub fn from_naive_time(time: NaiveTime) -> Self {
        Self {
            hour: time.hour() as u8,
            minute: time.minute() as u8,
        }
    }
}

impl PartialOrd for TimeOfDay {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeOfDay {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_minutes().cmp(&other.to_minutes())
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = RuleError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

/// A `[start, end)` range within a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start.
    pub start: TimeOfDay,
    /// Exclusive end.
    pub end: TimeOfDay,
}

impl TimeRange {
    /// Creates a new time range without validating it.
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        Self { start, end }
    }

    /// Parses a range from two `HH:MM` strings, requiring start < end.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let range = Self::new(TimeOfDay::parse(start)?, TimeOfDay::parse(end)?);
        range.validate()?;
        Ok(range)
    }

    /// Creates a time range from whole hours.
    pub fn from_hours(start_hour: u8, end_hour: u8) -> Self {
        Self::new(TimeOfDay::new(start_hour, 0), TimeOfDay::new(end_hour, 0))
    }

    /// Checks that the range is non-empty and does not wrap midnight.
    pub fn validate(&self) -> Result<()> {
        if self.start >= self.end {
            return Err(RuleError::invalid(
                "ranges",
                format!("start {} must be before end {}", self.start, self.end),
            ));
        }
        Ok(())
    }

    /// Checks if a time falls within `[start, end)`.
    pub fn contains(&self, time: TimeOfDay) -> bool {
        time >= self.start && time < self.end
    }
}

/// A recurring weekly window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Unique identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Days the schedule is active.
    pub days: BTreeSet<Weekday>,
    /// Active time ranges on those days.
    pub ranges: Vec<TimeRange>,
}

impl Schedule {
    /// Creates a new schedule.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        days: impl IntoIterator<Item = Weekday>,
        ranges: Vec<TimeRange>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            days: days.into_iter().collect(),
            ranges,
        }
    }

    /// Validates id, name, days and every range.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(RuleError::invalid("id", "must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(RuleError::invalid("name", "must not be empty"));
        }
        if self.days.is_empty() {
            return Err(RuleError::invalid("days", "at least one weekday is required"));
        }
        if self.ranges.is_empty() {
            return Err(RuleError::invalid("ranges", "at least one time range is required"));
        }
        for range in &self.ranges {
            range.validate()?;
        }
        Ok(())
    }

    /// Returns true if the local wall-clock time falls inside the schedule.
    pub fn is_active(&self, at: NaiveDateTime) -> bool {
        let day = Weekday::from_chrono(at.weekday());
        if !self.days.contains(&day) {
            return false;
        }
        let time = TimeOfDay::from_naive_time(at.time());
        self.ranges.iter().any(|range| range.contains(time))
    }
}
