//! Per-peer write-ahead log
//!
//! A segmented append-only log of point batches. Batches a peer could not
//! take are appended here and replayed in segment order by the owning
//! forwarder; a segment is only deleted once every point in it has been
//! forwarded, and the newest segment is never deleted at all since it may
//! still be the active write target.

mod entry;
mod reader;

pub use entry::{FloatValue, WalEntry};
pub use reader::segment_file_names;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::WAL_SEGMENT_SIZE;
use crate::proto;
use crate::Result;

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory for segment files
    pub dir: PathBuf,
    /// How often buffered appends are flushed to durable media
    pub sync_interval: Duration,
    /// How often a non-empty active segment is rolled
    pub checkpoint_interval: Duration,
    /// How often empty stale segments are pruned
    pub cleanup_interval: Duration,
    /// Size at which the active segment is rolled mid-write
    pub segment_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/wal"),
            sync_interval: Duration::from_secs(1),
            checkpoint_interval: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(60),
            segment_size: WAL_SEGMENT_SIZE,
        }
    }
}

struct WalInner {
    file: BufWriter<File>,
    segment_id: i64,
    bytes_written: usize,
    dirty: bool,
}

/// Segmented write-ahead log
pub struct Wal {
    config: WalConfig,
    inner: Mutex<WalInner>,
    /// Unix microseconds of the most recent append; 0 before the first
    last_write: AtomicI64,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Wal {
    /// Open the log in `config.dir`, continuing the highest existing segment
    pub fn open(config: WalConfig) -> Result<Arc<Self>> {
        fs::create_dir_all(&config.dir)?;

        let segment_id = segment_file_names(&config.dir)?
            .last()
            .and_then(|name| reader::parse_segment_id(name))
            .unwrap_or(0);

        let path = config.dir.join(reader::segment_file_name(segment_id));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let bytes_written = file.metadata()?.len() as usize;

        Ok(Arc::new(Self {
            config,
            inner: Mutex::new(WalInner {
                file: BufWriter::new(file),
                segment_id,
                bytes_written,
                dirty: false,
            }),
            last_write: AtomicI64::new(0),
            maintenance: Mutex::new(None),
        }))
    }

    /// Spawn the sync/checkpoint/cleanup maintenance task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let wal = self.clone();
        let handle = tokio::spawn(async move {
            let mut sync_tick = tokio::time::interval(wal.config.sync_interval);
            let mut checkpoint_tick = tokio::time::interval(wal.config.checkpoint_interval);
            let mut cleanup_tick = tokio::time::interval(wal.config.cleanup_interval);

            loop {
                tokio::select! {
                    _ = sync_tick.tick() => {
                        if let Err(e) = wal.sync() {
                            error!("wal {:?} - sync: {}", wal.config.dir, e);
                        }
                    }
                    _ = checkpoint_tick.tick() => {
                        if let Err(e) = wal.checkpoint() {
                            error!("wal {:?} - checkpoint: {}", wal.config.dir, e);
                        }
                    }
                    _ = cleanup_tick.tick() => {
                        if let Err(e) = wal.cleanup() {
                            error!("wal {:?} - cleanup: {}", wal.config.dir, e);
                        }
                    }
                }
            }
        });

        *self.maintenance.lock() = Some(handle);
    }

    /// Append one batch atomically and return the segment id it landed in
    pub fn write_multi(
        &self,
        values: HashMap<String, Vec<FloatValue>>,
    ) -> Result<i64> {
        let data = WalEntry::new(values).serialize_with_checksum()?;

        let mut inner = self.inner.lock();

        if inner.bytes_written > 0 && inner.bytes_written + data.len() > self.config.segment_size {
            self.roll(&mut inner)?;
        }

        inner.file.write_all(&data)?;
        inner.bytes_written += data.len();
        inner.dirty = true;

        self.last_write.store(now_micros(), Ordering::SeqCst);

        Ok(inner.segment_id)
    }

    /// Decode the named segment back into wire points
    pub fn replay(&self, name: &str) -> Result<Vec<proto::Point>> {
        reader::replay_segment(&self.config.dir.join(name))
    }

    /// Delete the listed segments, never the active one
    pub fn remove(&self, names: &[String]) -> Result<()> {
        let active = reader::segment_file_name(self.inner.lock().segment_id);

        for name in names {
            if *name == active {
                warn!("wal {:?} - refusing to remove active segment {}", self.config.dir, name);
                continue;
            }
            fs::remove_file(self.config.dir.join(name))?;
            debug!("wal {:?} - removed segment {}", self.config.dir, name);
        }
        Ok(())
    }

    /// Flush buffered appends to durable media
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.dirty {
            inner.file.flush()?;
            inner.file.get_ref().sync_all()?;
            inner.dirty = false;
        }
        Ok(())
    }

    /// Roll the active segment if it holds data
    pub fn checkpoint(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.bytes_written > 0 {
            self.roll(&mut inner)?;
        }
        Ok(())
    }

    /// Prune empty non-active segments
    pub fn cleanup(&self) -> Result<()> {
        let active_id = self.inner.lock().segment_id;

        for name in segment_file_names(&self.config.dir)? {
            if reader::parse_segment_id(&name) == Some(active_id) {
                continue;
            }
            let path = self.config.dir.join(&name);
            if path.metadata().map(|m| m.len() == 0).unwrap_or(false) {
                fs::remove_file(&path)?;
                debug!("wal {:?} - pruned empty segment {}", self.config.dir, name);
            }
        }
        Ok(())
    }

    /// Unix microseconds of the most recent append
    pub fn last_write_time(&self) -> i64 {
        self.last_write.load(Ordering::SeqCst)
    }

    /// Id of the active segment
    pub fn current_segment(&self) -> i64 {
        self.inner.lock().segment_id
    }

    /// Segment directory
    pub fn path(&self) -> &Path {
        &self.config.dir
    }

    /// Stop maintenance and flush
    pub fn close(&self) {
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
        if let Err(e) = self.sync() {
            error!("wal {:?} - final sync: {}", self.config.dir, e);
        }
    }

    fn roll(&self, inner: &mut WalInner) -> Result<()> {
        inner.file.flush()?;
        inner.file.get_ref().sync_all()?;

        inner.segment_id += 1;
        let path = self
            .config
            .dir
            .join(reader::segment_file_name(inner.segment_id));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        inner.file = BufWriter::new(file);
        inner.bytes_written = 0;
        inner.dirty = false;

        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
    }
}

pub(crate) fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or_default()
}
