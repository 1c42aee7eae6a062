//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MINUTES_PER_DAY: u16 = 24 * 60;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WindowParseError {
    #[error("expected a window formatted as HH:MM-HH:MM, got '{0}'")]
    Malformed(String),
    #[error("invalid time of day '{0}'")]
    InvalidTime(String),
    #[error("minute of day {0} is out of range (0..1440)")]
    OutOfRange(u16),
}

/// Minute of the day (0..1440) for a wall-clock time.
pub fn minute_of_day(time: NaiveTime) -> u16 {
    (time.hour() * 60 + time.minute()) as u16
}

/// Half-open `[start, end)` window over minutes of the day.
///
/// A window whose end precedes its start wraps past midnight, so
/// `22:00-06:00` covers the night. A window with `start == end` is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MinuteWindow {
    start: u16,
    end: u16,
}

impl MinuteWindow {
    pub fn new(start: u16, end: u16) -> Result<Self, WindowParseError> {
        for minute in [start, end] {
            if minute >= MINUTES_PER_DAY {
                return Err(WindowParseError::OutOfRange(minute));
            }
        }
        Ok(Self { start, end })
    }

    pub(crate) const fn from_minutes_unchecked(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn start_minute(&self) -> u16 {
        self.start
    }

    pub fn end_minute(&self) -> u16 {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains_minute(&self, minute: u16) -> bool {
        if self.start <= self.end {
            minute >= self.start && minute < self.end
        } else {
            minute >= self.start || minute < self.end
        }
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        self.contains_minute(minute_of_day(time))
    }
}

fn parse_time_of_day(raw: &str) -> Result<u16, WindowParseError> {
    let trimmed = raw.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .map(minute_of_day)
        .map_err(|_| WindowParseError::InvalidTime(trimmed.to_owned()))
}

impl FromStr for MinuteWindow {
    type Err = WindowParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| WindowParseError::Malformed(s.to_owned()))?;
        Self::new(parse_time_of_day(start)?, parse_time_of_day(end)?)
    }
}

impl fmt::Display for MinuteWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02}",
            self.start / 60,
            self.start % 60,
            self.end / 60,
            self.end % 60
        )
    }
}

impl TryFrom<String> for MinuteWindow {
    type Error = WindowParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MinuteWindow> for String {
    fn from(value: MinuteWindow) -> Self {
        value.to_string()
    }
}
