//! In-memory time-series engine
//!
//! One [`Serie`] per `(keyset, series)` pair: a hot two-hour [`Bucket`], a
//! ring of twelve sealed [`Block`]s, and the narrow [`Persistence`] boundary
//! to the cold store. [`Storage`] is the front door that creates series on
//! first access.

mod block;
mod bucket;
mod serie;

pub use block::Block;
pub use bucket::{Bucket, RangeError};
pub use serie::Serie;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::info;

use crate::clock::Clock;
use crate::{Point, Result, SeriesId, Timestamp};

/// Cold-store capability consumed by the engine.
///
/// One compressed payload per `(ksid, tsid, bucket_start)`; implementations
/// derive `bucket_start` from `created_at` on write, which makes writes
/// idempotent per window.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Fetch the payload sealed for the window starting at `bucket_start`.
    /// Absent windows come back empty.
    async fn read(&self, ksid: &str, tsid: &str, bucket_start: Timestamp) -> Result<Bytes>;

    /// Store a sealed payload for the window containing `created_at`.
    async fn write(
        &self,
        ksid: &str,
        tsid: &str,
        created_at: Timestamp,
        payload: Bytes,
    ) -> Result<()>;
}

/// Engine front door: the series map
pub struct Storage {
    series: RwLock<HashMap<SeriesId, Arc<Serie>>>,
    persist: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
}

impl Storage {
    /// Create a new storage engine
    pub fn new(persist: Arc<dyn Persistence>, clock: Arc<dyn Clock>) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            persist,
            clock,
        }
    }

    /// Get a serie, creating it (and spawning its init) on first access
    pub fn get_serie(&self, ksid: &str, tsid: &str) -> Arc<Serie> {
        let id = SeriesId::new(ksid, tsid);

        if let Some(serie) = self.series.read().get(&id) {
            return serie.clone();
        }

        let mut series = self.series.write();
        series
            .entry(id.clone())
            .or_insert_with(|| {
                info!("creating serie {}", id);
                Serie::new(id.clone(), self.persist.clone(), self.clock.clone())
            })
            .clone()
    }

    /// Record one point into its serie
    pub fn add(
        &self,
        ksid: &str,
        tsid: &str,
        date: Timestamp,
        value: f32,
    ) -> std::result::Result<(), RangeError> {
        self.get_serie(ksid, tsid).add_point(date, value)
    }

    /// Read the points of one serie in `[start, end]`, oldest to newest
    pub async fn read(
        &self,
        ksid: &str,
        tsid: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Vec<Point> {
        self.get_serie(ksid, tsid).read(start, end).await
    }

    /// Number of series currently held in memory
    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory cold store for tests, keyed like the real one
    pub(crate) struct MemPersistence {
        blocks: Mutex<HashMap<(String, String, Timestamp), Bytes>>,
        failures: AtomicUsize,
    }

    impl MemPersistence {
        pub(crate) fn new() -> Self {
            Self {
                blocks: Mutex::new(HashMap::new()),
                failures: AtomicUsize::new(0),
            }
        }

        /// Seed a payload under its window key
        pub(crate) fn put(&self, ksid: &str, tsid: &str, bucket_start: Timestamp, payload: Bytes) {
            self.blocks
                .lock()
                .insert((ksid.into(), tsid.into(), bucket_start), payload);
        }

        /// Make the next `n` reads fail
        pub(crate) fn fail_reads(&self, n: usize) {
            self.failures.store(n, Ordering::SeqCst);
        }

        pub(crate) fn stored(&self, ksid: &str, tsid: &str, bucket_start: Timestamp) -> bool {
            self.blocks
                .lock()
                .contains_key(&(ksid.into(), tsid.into(), bucket_start))
        }
    }

    #[async_trait]
    impl Persistence for MemPersistence {
        async fn read(&self, ksid: &str, tsid: &str, bucket_start: Timestamp) -> Result<Bytes> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(crate::KairoError::Persistence("injected read failure".into()));
            }
            Ok(self
                .blocks
                .lock()
                .get(&(ksid.into(), tsid.into(), bucket_start))
                .cloned()
                .unwrap_or_default())
        }

        async fn write(
            &self,
            ksid: &str,
            tsid: &str,
            created_at: Timestamp,
            payload: Bytes,
        ) -> Result<()> {
            let bucket_start = super::serie::bucket_key(created_at);
            self.put(ksid, tsid, bucket_start, payload);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::MemPersistence;
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_storage_creates_series_on_demand() {
        let storage = Storage::new(
            Arc::new(MemPersistence::new()),
            Arc::new(ManualClock::new(7200)),
        );
        assert_eq!(storage.series_count(), 0);

        storage.add("ks", "a", 7300, 1.0).unwrap();
        storage.add("ks", "b", 7300, 2.0).unwrap();
        storage.add("ks", "a", 7400, 3.0).unwrap();
        assert_eq!(storage.series_count(), 2);

        let pts = storage.read("ks", "a", 0, i64::MAX).await;
        assert_eq!(pts.len(), 2);
        assert_eq!(pts[0].date, 7300);
        assert_eq!(pts[1].date, 7400);
    }

    #[tokio::test]
    async fn test_storage_returns_same_serie() {
        let storage = Storage::new(
            Arc::new(MemPersistence::new()),
            Arc::new(ManualClock::new(0)),
        );
        let a = storage.get_serie("ks", "ts");
        let b = storage.get_serie("ks", "ts");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
