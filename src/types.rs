//! Core types for Kairo

use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp in seconds since Unix epoch
pub type Timestamp = i64;

/// A single in-memory data point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Timestamp in unix seconds
    pub date: Timestamp,
    /// Sample value
    pub value: f32,
}

impl Point {
    /// Create a new point
    pub fn new(date: Timestamp, value: f32) -> Self {
        Self { date, value }
    }
}

/// Identity of one series: keyset plus series id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesId {
    /// Keyset id
    pub ksid: String,
    /// Time-series id
    pub tsid: String,
}

impl SeriesId {
    /// Create a new series id
    pub fn new(ksid: impl Into<String>, tsid: impl Into<String>) -> Self {
        Self {
            ksid: ksid.into(),
            tsid: tsid.into(),
        }
    }

    /// Canonical composite key, used to group points in the WAL
    pub fn ksts(&self) -> String {
        format!("{}|{}", self.ksid, self.tsid)
    }

    /// Parse a composite key back into its parts
    pub fn from_ksts(s: &str) -> Option<Self> {
        let (ksid, tsid) = s.split_once('|')?;
        if ksid.is_empty() || tsid.is_empty() {
            return None;
        }
        Some(Self::new(ksid, tsid))
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ksts())
    }
}

/// Closed time range `[start, end]` in unix seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }
}
