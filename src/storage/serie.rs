//! Per-series coordinator: one live bucket plus a ring of sealed blocks
//!
//! The ring is indexed by `hour-of-day / 2`, so twelve slots cover the 24
//! hours behind the live window. Adds and seals take the write lock; reads
//! snapshot the state under the read lock and decode outside it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::block::Block;
use super::bucket::{Bucket, RangeError};
use super::Persistence;
use crate::clock::Clock;
use crate::compression::{Decoder, Encoder, HEADER_LEN};
use crate::config::{BUCKET_DURATION, RING_SLOTS, SEC_DAY, SEC_HOUR};
use crate::{Point, SeriesId, Timestamp};

struct SerieState {
    bucket: Bucket,
    blocks: [Block; RING_SLOTS],
    index: usize,
}

/// One `(keyset, series)` pair: the live bucket, the block ring, and the
/// persistence boundary behind them
pub struct Serie {
    id: SeriesId,
    state: RwLock<SerieState>,
    persist: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
}

impl Serie {
    /// Create a serie and spawn its background initialization.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(id: SeriesId, persist: Arc<dyn Persistence>, clock: Arc<dyn Clock>) -> Arc<Self> {
        let now = clock.now();
        let serie = Arc::new(Self {
            id,
            state: RwLock::new(SerieState {
                bucket: Bucket::new(bucket_key(now), now),
                blocks: std::array::from_fn(|_| Block::default()),
                index: 0,
            }),
            persist,
            clock,
        });

        let init = serie.clone();
        tokio::spawn(async move { init.init().await });

        serie
    }

    /// Series identity
    pub fn id(&self) -> &SeriesId {
        &self.id
    }

    /// Warm the serie from the cold store: replay the current window into the
    /// live bucket, then populate the ring with the twelve preceding windows.
    async fn init(&self) {
        info!("initializing serie {}", self.id);

        let now = self.clock.now();
        let bktid = bucket_key(now);

        // Nothing can be served until the current window is known, so read
        // failures here retry forever.
        let payload = loop {
            match self.persist.read(&self.id.ksid, &self.id.tsid, bktid).await {
                Ok(payload) => break payload,
                Err(e) => {
                    warn!("serie {} - reading current bucket, will retry: {}", self.id, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };

        if payload.len() > HEADER_LEN {
            match Decoder::new(&payload) {
                Ok(mut dec) => {
                    let mut state = self.state.write();
                    loop {
                        match dec.next_point() {
                            Ok(Some((date, value))) => {
                                let _ = state.bucket.add(date, value);
                            }
                            Ok(None) => break,
                            Err(e) => {
                                error!("serie {} - unable to replay current bucket: {}", self.id, e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => error!("serie {} - unable to replay current bucket: {}", self.id, e),
            }
        }

        let mut ct = bktid - SEC_DAY;
        while ct < bktid {
            let i = slot_index(ct);
            match self.persist.read(&self.id.ksid, &self.id.tsid, ct).await {
                Ok(payload) if payload.len() > HEADER_LEN => {
                    debug!(
                        "serie {} - block {} initialized at index {} - size {}",
                        self.id,
                        ct,
                        i,
                        payload.len()
                    );
                    let mut state = self.state.write();
                    if state.blocks[i].is_empty() {
                        state.blocks[i] = Block::new(
                            ct,
                            ct + BUCKET_DURATION - 1,
                            BUCKET_DURATION as usize,
                            payload,
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => error!("serie {} - reading block {}: {}", self.id, ct, e),
            }
            ct += BUCKET_DURATION;
        }

        {
            // Point the merge walk at the newest prefilled window. The slot
            // for the current window is shared with the day-old block just
            // loaded; only a racing rollover puts a start at or past `bktid`
            // there, and then its seal already set the index.
            let mut state = self.state.write();
            let head = slot_index(bktid);
            let raced = !state.blocks[head].is_empty() && state.blocks[head].start() >= bktid;
            if !raced {
                state.index = slot_index(bktid - BUCKET_DURATION);
            }
        }

        info!("serie {} initialized", self.id);
    }

    /// Record one point.
    ///
    /// A point past the window seals the bucket and opens a fresh one keyed
    /// to the point. `RecentPast` is surfaced so the caller can route the
    /// point to the cold path; older points are dropped.
    pub fn add_point(&self, date: Timestamp, value: f32) -> std::result::Result<(), RangeError> {
        let mut state = self.state.write();

        match state.bucket.add(date, value) {
            Ok(_) => Ok(()),
            Err(RangeError::Future { .. }) => {
                debug!("serie {} - sealing bucket {}", self.id, state.bucket.start());
                self.store(&mut state);
                state.bucket = Bucket::new(bucket_key(date), self.clock.now());
                state.bucket.add(date, value).map(|_| ())
            }
            Err(e @ RangeError::RecentPast { .. }) => Err(e),
            Err(RangeError::TooOld { .. }) => Ok(()),
        }
    }

    /// Read the points in `[start, end]`, oldest to newest.
    pub async fn read(&self, start: Timestamp, end: Timestamp) -> Vec<Point> {
        let (bucket_pts, blocks, index) = {
            let state = self.state.read();

            let oldest = (state.index + 1) % RING_SLOTS;
            let start_memory = state.blocks[oldest].start();
            if !state.blocks[oldest].is_empty() && start < start_memory {
                debug!(
                    "serie {} - read {}..{} starts before memory ({})",
                    self.id, start, end, start_memory
                );
            }

            (
                state.bucket.range_points(start, end),
                state.blocks.clone(),
                state.index,
            )
        };

        // Scatter: the bucket snapshot plus one decode task per ring slot,
        // answering on a channel sized to exactly the scatter width.
        let (tx, mut rx) = mpsc::channel(RING_SLOTS + 1);

        let bucket_tx = tx.clone();
        tokio::spawn(async move {
            let _ = bucket_tx.send((0, bucket_pts)).await;
        });

        for (x, block) in blocks.into_iter().enumerate() {
            let block_tx = tx.clone();
            tokio::spawn(async move {
                let _ = block_tx.send((x + 1, block.range_points(start, end))).await;
            });
        }
        drop(tx);

        let mut result: Vec<Vec<Point>> = vec![Vec::new(); RING_SLOTS + 1];
        let mut total = 0;
        while let Some((id, pts)) = rx.recv().await {
            total += pts.len();
            result[id] = pts;
        }

        // Merge oldest to newest: walk the ring forward from the slot after
        // the most recent seal, wrapping once, then append the live bucket.
        let mut points = Vec::with_capacity(total);
        for step in 0..RING_SLOTS {
            let slot = (index + 1 + step) % RING_SLOTS;
            points.extend_from_slice(&result[slot + 1]);
        }
        points.extend_from_slice(&result[0]);

        debug!("serie {} - points read: {}", self.id, points.len());
        points
    }

    /// Seal the live bucket into its ring slot and hand the payload to the
    /// cold store. Called under the write lock.
    fn store(&self, state: &mut SerieState) {
        let start = state.bucket.start();
        let end = state.bucket.end();
        let created = state.bucket.created();

        let mut enc = Encoder::new(start);
        for pt in state.bucket.dump_points() {
            enc.encode(pt.date, pt.value);
        }
        let count = enc.count();
        let payload = enc.close();

        let index = slot_index(start);
        state.blocks[index] = Block::new(start, end, count, payload.clone());
        state.index = index;

        let persist = self.persist.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            if let Err(e) = persist.write(&id.ksid, &id.tsid, created, payload).await {
                error!("serie {} - persisting sealed block: {}", id, e);
            }
        });
    }
}

/// Left edge of the two-hour window containing `ts`: floor to the hour, then
/// back one more hour when the hour-of-day is odd
pub(crate) fn bucket_key(ts: Timestamp) -> Timestamp {
    let hour_start = ts - ts.rem_euclid(SEC_HOUR);
    if hour_start.div_euclid(SEC_HOUR) % 2 == 0 {
        hour_start
    } else {
        hour_start - SEC_HOUR
    }
}

/// Ring slot for the window containing `ts`
pub(crate) fn slot_index(ts: Timestamp) -> usize {
    (ts.div_euclid(SEC_HOUR).rem_euclid(24) / 2) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testutil::MemPersistence;
    use crate::clock::ManualClock;

    fn serie_at(
        now: Timestamp,
        persist: Arc<MemPersistence>,
    ) -> (Arc<Serie>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        let serie = Serie::new(
            SeriesId::new("ks", "ts"),
            persist,
            clock.clone(),
        );
        (serie, clock)
    }

    fn sealed_payload(start: Timestamp, points: &[(i64, f32)]) -> bytes::Bytes {
        let mut enc = Encoder::new(start);
        for (ts, val) in points {
            enc.encode(*ts, *val);
        }
        enc.close()
    }

    /// Let spawned tasks (init, persistence writes) run to completion.
    async fn settle() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_bucket_key_alignment() {
        assert_eq!(bucket_key(7200), 7200);
        assert_eq!(bucket_key(7199), 0);
        assert_eq!(bucket_key(10_800), 7200);
        assert_eq!(bucket_key(14_399), 7200);
        assert_eq!(bucket_key(14_400), 14_400);
        // Negative timestamps stay two-hour aligned.
        assert_eq!(bucket_key(-1), -7200);
        assert_eq!(bucket_key(-7200), -7200);
    }

    #[test]
    fn test_slot_index_wraps_daily() {
        assert_eq!(slot_index(0), 0);
        assert_eq!(slot_index(7200), 1);
        assert_eq!(slot_index(23 * 3600), 11);
        assert_eq!(slot_index(24 * 3600), 0);
        assert_eq!(slot_index(SEC_DAY + 7200), 1);
    }

    // Cold start: one block behind the live window and one payload for the
    // live window itself are both served after init.
    #[tokio::test]
    async fn test_cold_start_replays_history() {
        let now = 993_700; // inside the window starting at 993_600
        let current = bucket_key(now);
        assert_eq!(current, 993_600);
        let previous = current - BUCKET_DURATION;

        let persist = Arc::new(MemPersistence::new());
        persist.put(
            "ks",
            "ts",
            current,
            sealed_payload(current, &[(current, 1.0), (current + 99, 2.0)]),
        );
        persist.put(
            "ks",
            "ts",
            previous,
            sealed_payload(previous, &[(previous + 10, -1.0)]),
        );

        let (serie, _clock) = serie_at(now, persist);
        settle().await;

        let pts = serie.read(0, 2_000_000_000).await;
        assert_eq!(
            pts,
            vec![
                Point::new(previous + 10, -1.0),
                Point::new(current, 1.0),
                Point::new(current + 99, 2.0),
            ]
        );
    }

    // Cold start with a full day of history: every one of the twelve
    // preceding windows is loaded into the ring, the day-old one included,
    // and the read walks them oldest first.
    #[tokio::test]
    async fn test_cold_start_loads_full_ring() {
        let now = 993_700;
        let current = bucket_key(now);

        let persist = Arc::new(MemPersistence::new());
        for back in 1..=RING_SLOTS as i64 {
            let start = current - back * BUCKET_DURATION;
            persist.put(
                "ks",
                "ts",
                start,
                sealed_payload(start, &[(start + 1, back as f32)]),
            );
        }

        let (serie, _clock) = serie_at(now, persist);
        settle().await;

        let pts = serie.read(0, now).await;
        let expected: Vec<_> = (1..=RING_SLOTS as i64)
            .rev()
            .map(|back| Point::new(current - back * BUCKET_DURATION + 1, back as f32))
            .collect();
        assert_eq!(pts, expected);
    }

    // Init keeps retrying the current-bucket read until it succeeds.
    #[tokio::test(start_paused = true)]
    async fn test_init_retries_current_bucket_read() {
        let now = 993_700;
        let current = bucket_key(now);

        let persist = Arc::new(MemPersistence::new());
        persist.put("ks", "ts", current, sealed_payload(current, &[(current + 5, 9.0)]));
        persist.fail_reads(3);

        let (serie, _clock) = serie_at(now, persist);
        // Paused clock: parking on this sleep fast-forwards the retry waits.
        tokio::time::sleep(Duration::from_secs(10)).await;

        let pts = serie.read(0, i64::MAX).await;
        assert_eq!(pts, vec![Point::new(current + 5, 9.0)]);
    }

    // Rollover: the third add seals the first window and opens the next.
    #[tokio::test]
    async fn test_rollover_seals_bucket() {
        let persist = Arc::new(MemPersistence::new());
        let (serie, _clock) = serie_at(7200, persist.clone());
        settle().await;

        serie.add_point(7200, 10.0).unwrap();
        serie.add_point(14_399, 11.0).unwrap();
        serie.add_point(14_400, 12.0).unwrap();

        {
            let state = serie.state.read();
            let sealed = &state.blocks[slot_index(7200)];
            assert!(!sealed.is_empty());
            assert_eq!(sealed.start(), 7200);
            assert_eq!(sealed.count(), 2);
            assert_eq!(state.bucket.start(), 14_400);
            assert_eq!(state.bucket.count(), 1);
            assert_eq!(state.index, slot_index(7200));
        }

        let pts = serie.read(i64::MIN, i64::MAX).await;
        assert_eq!(
            pts,
            vec![
                Point::new(7200, 10.0),
                Point::new(14_399, 11.0),
                Point::new(14_400, 12.0),
            ]
        );

        // The sealed payload reached the cold store under its window key.
        settle().await;
        assert!(persist.stored("ks", "ts", 7200));
    }

    // A point behind the cold horizon is silently dropped.
    #[tokio::test]
    async fn test_cold_tail_drop() {
        let persist = Arc::new(MemPersistence::new());
        let (serie, _clock) = serie_at(100_000, persist);
        settle().await;

        // Relative to the live window start (93_600) this lands 80_000s back,
        // inside the cold horizon, so it is surfaced and kept out of memory.
        let horizon_point = 100_000 - SEC_DAY;
        let res = serie.add_point(horizon_point, 5.0);
        assert_eq!(res, Err(RangeError::RecentPast { delta: -80_000 }));

        // A point a full day behind the window start is dropped without a signal.
        let ancient = bucket_key(100_000) - SEC_DAY;
        assert_eq!(serie.add_point(ancient, 6.0), Ok(()));

        let pts = serie.read(i64::MIN, i64::MAX).await;
        assert!(pts.iter().all(|p| p.date != horizon_point && p.date != ancient));
    }

    // A recent-past point is surfaced as the cold-write signal and kept out
    // of memory.
    #[tokio::test]
    async fn test_recent_past_is_surfaced() {
        let persist = Arc::new(MemPersistence::new());
        let (serie, _clock) = serie_at(100_000, persist);
        settle().await;

        let res = serie.add_point(bucket_key(100_000) - 100, 5.0);
        assert_eq!(res, Err(RangeError::RecentPast { delta: -100 }));
        assert!(serie.read(i64::MIN, i64::MAX).await.is_empty());
    }

    // Many rollovers: at most twelve blocks stay populated and their windows
    // tile the most recent 24 hours behind the live bucket.
    #[tokio::test]
    async fn test_ring_coverage_after_rollovers() {
        let persist = Arc::new(MemPersistence::new());
        let (serie, _clock) = serie_at(0, persist);
        settle().await;

        let rollovers = 20;
        for w in 0..=rollovers {
            let start = w as i64 * BUCKET_DURATION;
            serie.add_point(start, w as f32).unwrap();
        }

        let state = serie.state.read();
        let populated: Vec<_> = state.blocks.iter().filter(|b| !b.is_empty()).collect();
        assert_eq!(populated.len(), RING_SLOTS);

        let live_start = state.bucket.start();
        let mut starts: Vec<_> = populated.iter().map(|b| b.start()).collect();
        starts.sort_unstable();
        let expected: Vec<_> = (1..=RING_SLOTS as i64)
            .rev()
            .map(|back| live_start - back * BUCKET_DURATION)
            .collect();
        assert_eq!(starts, expected);
    }

    // Reads come out sorted whatever the add order inside each window.
    #[tokio::test]
    async fn test_read_is_sorted() {
        let persist = Arc::new(MemPersistence::new());
        let (serie, _clock) = serie_at(0, persist);
        settle().await;

        for w in 0..15i64 {
            let start = w * BUCKET_DURATION;
            serie.add_point(start + 100, 1.0).unwrap();
            serie.add_point(start + 10, 2.0).unwrap();
            serie.add_point(start + 7000, 3.0).unwrap();
        }

        let pts = serie.read(i64::MIN, i64::MAX).await;
        assert!(!pts.is_empty());
        assert!(pts.windows(2).all(|w| w[0].date < w[1].date));
    }

    // The range filter applies across the bucket and every block.
    #[tokio::test]
    async fn test_read_range_filter() {
        let persist = Arc::new(MemPersistence::new());
        let (serie, _clock) = serie_at(0, persist);
        settle().await;

        serie.add_point(100, 1.0).unwrap();
        serie.add_point(8000, 2.0).unwrap(); // rolls the first window
        serie.add_point(9000, 3.0).unwrap();

        let pts = serie.read(101, 8500).await;
        assert_eq!(pts, vec![Point::new(8000, 2.0)]);
    }
}
