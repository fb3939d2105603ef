//! Kairo - Distributed Time-Series Front-End Core
//!
//! An in-memory compressed time-series engine fronted by a cluster write
//! pipeline:
//!
//! - **Compression**: streaming delta-of-delta timestamps + XOR floats,
//!   one opaque payload per two-hour window
//! - **Storage**: per-series hot bucket plus a ring of 12 sealed blocks,
//!   giving 24 hours of queryable history in memory
//! - **WAL**: segmented write-ahead log that absorbs batches a downstream
//!   peer could not take
//! - **Cluster**: one rate-limited streaming forwarder per peer, with
//!   background replay of logged segments
//!
//! The cold store behind the ring and the REST surface in front of the
//! cluster are external: the engine consumes only the narrow
//! [`storage::Persistence`] and [`clock::Clock`] capabilities.

pub mod clock;
pub mod cluster;
pub mod compression;
pub mod proto;
pub mod storage;
pub mod wal;

mod error;
mod types;

pub use error::{KairoError, Result};
pub use types::*;

/// Kairo version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tuning values
pub mod config {
    /// Seconds per hour
    pub const SEC_HOUR: i64 = 3600;

    /// Seconds per day
    pub const SEC_DAY: i64 = 24 * SEC_HOUR;

    /// Width of one bucket window in seconds (two hours)
    pub const BUCKET_DURATION: i64 = 2 * SEC_HOUR;

    /// Number of sealed blocks kept in memory (24 hours of history)
    pub const RING_SLOTS: usize = 12;

    /// Points older than this are dropped by the in-memory engine
    pub const COLD_HORIZON: i64 = SEC_DAY;

    /// Attempts per point on a write stream before the batch is aborted
    pub const MAX_SEND_ATTEMPTS: usize = 5;

    /// Depth of the bounded per-node ingress channels
    pub const INGRESS_DEPTH: usize = 5;

    /// WAL segment size before rotation (16MB)
    pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;
}
