//! Block codec for time-series payloads
//!
//! Streaming compression in the Gorilla family: timestamps as delta-of-delta
//! in variable-width bit fields, values XOR-folded against their predecessor.
//! One payload covers one two-hour window; the format is a 64-bit start
//! header, the point stream, and a closing marker, so a sealed payload can be
//! decoded without any out-of-band point count.

mod bitstream;
mod decoder;
mod encoder;

pub use bitstream::{BitReader, BitWriter};
pub use decoder::Decoder;
pub use encoder::Encoder;

/// Sentinel in the widest delta-of-delta escape that terminates a payload.
/// No timestamp sequence confined to a block window can produce it.
const END_MARKER: u64 = i64::MIN as u64;

/// Byte length of the payload header (the block start timestamp)
pub const HEADER_LEN: usize = 8;
