//! Sealed two-hour window

use bytes::Bytes;
use tracing::warn;

use crate::compression::Decoder;
use crate::{Point, TimeRange, Timestamp};

/// Immutable compressed two-hour payload in the ring.
///
/// An empty payload marks an unpopulated slot. Overwriting a ring slot
/// replaces the whole `Block` value; the payload itself is never mutated, so
/// a reader holding a clone keeps decoding valid bytes.
#[derive(Debug, Clone, Default)]
pub struct Block {
    start: Timestamp,
    end: Timestamp,
    count: usize,
    payload: Bytes,
}

impl Block {
    /// Create a populated block
    pub fn new(start: Timestamp, end: Timestamp, count: usize, payload: Bytes) -> Self {
        Self {
            start,
            end,
            count,
            payload,
        }
    }

    /// Window start in unix seconds
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Last second covered by the window
    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// Number of points recorded at seal time
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether this slot is unpopulated
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Decode the payload and return the points whose timestamp lies in
    /// `[start, end]`, oldest first.
    ///
    /// An empty or non-overlapping block yields no points. A decode error
    /// mid-payload is logged and yields the prefix decoded so far.
    pub fn range_points(&self, start: Timestamp, end: Timestamp) -> Vec<Point> {
        let range = TimeRange::new(start, end);
        if self.is_empty() || !TimeRange::new(self.start, self.end).overlaps(&range) {
            return Vec::new();
        }

        let mut dec = match Decoder::new(&self.payload) {
            Ok(dec) => dec,
            Err(e) => {
                warn!("block {}..{} - unreadable payload: {}", self.start, self.end, e);
                return Vec::new();
            }
        };

        let mut points = Vec::new();
        loop {
            match dec.next_point() {
                Ok(Some((date, value))) => {
                    if range.contains(date) {
                        points.push(Point::new(date, value));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("block {}..{} - decode stopped early: {}", self.start, self.end, e);
                    break;
                }
            }
        }
        points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Encoder;

    fn sealed(start: Timestamp, points: &[(i64, f32)]) -> Block {
        let mut enc = Encoder::new(start);
        for (ts, val) in points {
            enc.encode(*ts, *val);
        }
        let count = enc.count();
        Block::new(start, start + 7199, count, enc.close())
    }

    #[test]
    fn test_empty_slot_yields_nothing() {
        let block = Block::default();
        assert!(block.is_empty());
        assert_eq!(block.range_points(i64::MIN, i64::MAX), vec![]);
    }

    #[test]
    fn test_non_overlapping_range_yields_nothing() {
        let block = sealed(7200, &[(7200, 1.0), (7300, 2.0)]);
        assert_eq!(block.range_points(20_000, 30_000), vec![]);
    }

    #[test]
    fn test_range_filters_inside_window() {
        let block = sealed(7200, &[(7200, 1.0), (7300, 2.0), (14_000, 3.0)]);
        assert_eq!(
            block.range_points(7250, 13_000),
            vec![Point::new(7300, 2.0)]
        );
        assert_eq!(block.range_points(i64::MIN, i64::MAX).len(), 3);
    }

    #[test]
    fn test_corrupt_payload_yields_partial_prefix() {
        let block = sealed(0, &[(0, 1.0), (10, 2.0), (20, 3.0)]);
        // Chop off the closing marker and the tail of the last point.
        let truncated = Block::new(
            block.start(),
            block.end(),
            block.count(),
            block.payload.slice(..block.payload.len() - 12),
        );
        let pts = truncated.range_points(i64::MIN, i64::MAX);
        assert!(pts.len() < 3);
        for (pt, (ts, val)) in pts.iter().zip([(0i64, 1.0f32), (10, 2.0)]) {
            assert_eq!(pt.date, ts);
            assert_eq!(pt.value, val);
        }
    }
}
