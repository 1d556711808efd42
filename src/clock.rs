//! Time source for TTL decisions.
//!
//! Both clocks are monotonic. The event-time clock is the high-water mark of
//! record timestamps, which makes expiry a pure function of the log and keeps
//! replays byte-for-byte identical. The wall clock anchors `Instant` to the
//! moment the engine started, for tailing a log that is still being written.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockKind {
    EventTime,
    Wall,
}

impl fmt::Display for ClockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockKind::EventTime => f.write_str("event_time"),
            ClockKind::Wall => f.write_str("wall"),
        }
    }
}

impl FromStr for ClockKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "event_time" | "event-time" => Ok(ClockKind::EventTime),
            "wall" => Ok(ClockKind::Wall),
            other => Err(format!(
                "unknown clock '{other}', valid values: event_time, wall"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub enum JoinClock {
    EventTime { watermark: Option<DateTime<Utc>> },
    Wall { started_at: DateTime<Utc>, origin: Instant },
}

impl JoinClock {
    pub fn new(kind: ClockKind) -> Self {
        match kind {
            ClockKind::EventTime => JoinClock::EventTime { watermark: None },
            ClockKind::Wall => JoinClock::Wall {
                started_at: Utc::now(),
                origin: Instant::now(),
            },
        }
    }

    /// Feed the timestamp of a record that was just read.
    pub fn observe(&mut self, timestamp: DateTime<Utc>) {
        if let JoinClock::EventTime { watermark } = self {
            match watermark {
                Some(current) if *current >= timestamp => {}
                _ => *watermark = Some(timestamp),
            }
        }
    }

    /// Current time, or `None` before the event clock has seen any record.
    pub fn now(&self) -> Option<DateTime<Utc>> {
        match self {
            JoinClock::EventTime { watermark } => *watermark,
            JoinClock::Wall { started_at, origin } => {
                let elapsed = TimeDelta::from_std(origin.elapsed()).ok()?;
                started_at.checked_add_signed(elapsed)
            }
        }
    }

    /// Time stamped on entries created right now.
    pub fn stamp(&self, record_timestamp: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            JoinClock::EventTime { .. } => record_timestamp,
            JoinClock::Wall { .. } => self.now().unwrap_or(record_timestamp),
        }
    }
}
