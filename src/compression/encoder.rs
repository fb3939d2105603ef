//! Streaming encoder for two-hour block payloads

use bytes::Bytes;

use super::bitstream::BitWriter;
use super::END_MARKER;
use crate::Timestamp;

/// Streaming block encoder over `(timestamp, value)` pairs
///
/// A payload begins with the block start timestamp as a 64-bit header.
/// Timestamps are stored as delta-of-delta against the header, values as
/// XOR against the previous value. Input timestamps must be monotonically
/// non-decreasing; encoding itself never fails.
pub struct Encoder {
    writer: BitWriter,
    start: Timestamp,
    count: usize,

    // Timestamp state
    prev_timestamp: i64,
    prev_delta: i64,

    // Value state
    prev_value_bits: u32,
    prev_leading: u32,
    prev_trailing: u32,
}

impl Encoder {
    /// Begin a block at `start`
    pub fn new(start: Timestamp) -> Self {
        let mut writer = BitWriter::with_capacity(1024);
        writer.write_bits(start as u64, 64);

        Self {
            writer,
            start,
            count: 0,
            prev_timestamp: start,
            prev_delta: 0,
            prev_value_bits: 0,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    /// Block start timestamp
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Number of points encoded so far
    pub fn count(&self) -> usize {
        self.count
    }

    /// Encode one point
    pub fn encode(&mut self, timestamp: Timestamp, value: f32) {
        debug_assert!(timestamp >= self.prev_timestamp);

        self.encode_timestamp(timestamp);

        if self.count == 0 {
            // First value travels uncompressed
            let bits = value.to_bits();
            self.writer.write_bits(bits as u64, 32);
            self.prev_value_bits = bits;
        } else {
            self.encode_value(value);
        }

        self.count += 1;
    }

    /// Seal the block and return the payload
    pub fn close(mut self) -> Bytes {
        // Closing marker in the widest delta-of-delta escape; the value is
        // unreachable for timestamps inside one block window.
        self.writer.write_bits(0b1111, 4);
        self.writer.write_bits(END_MARKER, 64);
        Bytes::from(self.writer.into_bytes())
    }

    fn encode_timestamp(&mut self, timestamp: i64) {
        let delta = timestamp - self.prev_timestamp;
        let dod = delta - self.prev_delta;

        // Steady sampling intervals make the delta-of-delta zero, a single bit
        if dod == 0 {
            self.writer.write_bit(false);
        } else if (-63..=64).contains(&dod) {
            self.writer.write_bits(0b10, 2);
            self.writer.write_bits((dod + 63) as u64, 7);
        } else if (-255..=256).contains(&dod) {
            self.writer.write_bits(0b110, 3);
            self.writer.write_bits((dod + 255) as u64, 9);
        } else if (-2047..=2048).contains(&dod) {
            self.writer.write_bits(0b1110, 4);
            self.writer.write_bits((dod + 2047) as u64, 12);
        } else {
            self.writer.write_bits(0b1111, 4);
            self.writer.write_bits(dod as u64, 64);
        }

        self.prev_delta = delta;
        self.prev_timestamp = timestamp;
    }

    fn encode_value(&mut self, value: f32) {
        let bits = value.to_bits();
        let xor = bits ^ self.prev_value_bits;

        if xor == 0 {
            self.writer.write_bit(false);
        } else {
            self.writer.write_bit(true);

            let leading = xor.leading_zeros();
            let trailing = xor.trailing_zeros();

            if leading >= self.prev_leading && trailing >= self.prev_trailing {
                // Meaningful bits fit the previous window
                self.writer.write_bit(false);
                let meaningful = 32 - self.prev_leading - self.prev_trailing;
                self.writer
                    .write_bits((xor >> self.prev_trailing) as u64, meaningful as usize);
            } else {
                // New window: 5 bits of leading zeros, 6 bits of length
                self.writer.write_bit(true);
                let meaningful = 32 - leading - trailing;
                self.writer.write_bits(leading as u64, 5);
                self.writer.write_bits(meaningful as u64, 6);
                self.writer
                    .write_bits((xor >> trailing) as u64, meaningful as usize);

                self.prev_leading = leading;
                self.prev_trailing = trailing;
            }
        }

        self.prev_value_bits = bits;
    }
}
