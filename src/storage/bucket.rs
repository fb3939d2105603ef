//! Hot write window
//!
//! One mutable two-hour slab per serie. Points land in a dense array indexed
//! by their offset from the window start, so duplicate seconds overwrite and
//! scans come out in timestamp order for free.

use thiserror::Error;

use crate::config::{BUCKET_DURATION, COLD_HORIZON};
use crate::{Point, TimeRange, Timestamp};

/// Routing signal for a point that falls outside the bucket window.
///
/// Not a failure: `Future` asks the caller to roll the bucket over,
/// `RecentPast` marks a point the caller may route to the cold path, and
/// `TooOld` marks a point the engine drops.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// Point lies at or past the end of the window
    #[error("point is {delta}s ahead of the bucket start")]
    Future {
        /// Offset from the bucket start
        delta: i64,
    },

    /// Point predates the window but is within the cold horizon
    #[error("point is {delta}s behind the bucket start")]
    RecentPast {
        /// Offset from the bucket start
        delta: i64,
    },

    /// Point predates the window by more than the cold horizon
    #[error("point is {delta}s behind the bucket start, past the cold horizon")]
    TooOld {
        /// Offset from the bucket start
        delta: i64,
    },
}

impl RangeError {
    /// Offset of the rejected point from the bucket start
    pub fn delta(&self) -> i64 {
        match self {
            RangeError::Future { delta }
            | RangeError::RecentPast { delta }
            | RangeError::TooOld { delta } => *delta,
        }
    }
}

/// Mutable, append-only window for the current two hours
pub struct Bucket {
    start: Timestamp,
    created: Timestamp,
    count: usize,
    slots: Box<[Option<f32>]>,
}

impl Bucket {
    /// Open a bucket starting at `start` (an even-hour boundary),
    /// recording `created` as the wall time at open
    pub fn new(start: Timestamp, created: Timestamp) -> Self {
        Self {
            start,
            created,
            count: 0,
            slots: vec![None; BUCKET_DURATION as usize].into_boxed_slice(),
        }
    }

    /// Window start in unix seconds
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Last second covered by the window
    pub fn end(&self) -> Timestamp {
        self.start + BUCKET_DURATION - 1
    }

    /// Wall time when the bucket was opened
    pub fn created(&self) -> Timestamp {
        self.created
    }

    /// Number of distinct seconds holding a point
    pub fn count(&self) -> usize {
        self.count
    }

    /// Record a point, returning its offset from the window start.
    ///
    /// A duplicate second overwrites the previous value without growing
    /// `count`.
    pub fn add(&mut self, date: Timestamp, value: f32) -> std::result::Result<i64, RangeError> {
        let delta = date - self.start;

        if delta >= BUCKET_DURATION {
            return Err(RangeError::Future { delta });
        }
        if delta < 0 {
            if delta > -COLD_HORIZON {
                return Err(RangeError::RecentPast { delta });
            }
            return Err(RangeError::TooOld { delta });
        }

        let slot = &mut self.slots[delta as usize];
        if slot.is_none() {
            self.count += 1;
        }
        *slot = Some(value);

        Ok(delta)
    }

    /// Ordered snapshot of the points whose timestamp lies in `[start, end]`
    pub fn range_points(&self, start: Timestamp, end: Timestamp) -> Vec<Point> {
        let range = TimeRange::new(start, end);
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let date = self.start + i as i64;
                slot.and_then(|value| range.contains(date).then_some(Point::new(date, value)))
            })
            .collect()
    }

    /// Full ordered snapshot, used at seal time
    pub fn dump_points(&self) -> Vec<Point> {
        self.range_points(self.start, self.end())
    }
}
