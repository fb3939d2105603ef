//! Streaming decoder for two-hour block payloads

use super::bitstream::BitReader;
use super::END_MARKER;
use crate::{KairoError, Result, Timestamp};

/// Streaming block decoder
///
/// Mirrors [`super::Encoder`]: reads the 64-bit start header, then yields
/// points until the closing marker. A payload that runs out of bits before
/// the marker surfaces [`KairoError::Truncated`].
pub struct Decoder<'a> {
    reader: BitReader<'a>,
    start: Timestamp,
    count: usize,
    done: bool,

    // Timestamp state
    prev_timestamp: i64,
    prev_delta: i64,

    // Value state
    prev_value_bits: u32,
    prev_leading: u32,
    prev_trailing: u32,
}

impl<'a> Decoder<'a> {
    /// Create a decoder over a sealed payload
    pub fn new(payload: &'a [u8]) -> Result<Self> {
        if payload.len() < 8 {
            return Err(KairoError::BadHeader);
        }

        let mut reader = BitReader::new(payload);
        let start = reader.read_bits(64)? as i64;

        Ok(Self {
            reader,
            start,
            count: 0,
            done: false,
            prev_timestamp: start,
            prev_delta: 0,
            prev_value_bits: 0,
            prev_leading: 0,
            prev_trailing: 0,
        })
    }

    /// Block start timestamp from the header
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Decode the next point, or `None` after the closing marker
    pub fn next_point(&mut self) -> Result<Option<(Timestamp, f32)>> {
        if self.done {
            return Ok(None);
        }

        let timestamp = match self.decode_timestamp()? {
            Some(ts) => ts,
            None => {
                self.done = true;
                return Ok(None);
            }
        };

        let value = if self.count == 0 {
            let bits = self.reader.read_bits(32)? as u32;
            self.prev_value_bits = bits;
            f32::from_bits(bits)
        } else {
            self.decode_value()?
        };

        self.count += 1;
        Ok(Some((timestamp, value)))
    }

    /// Decode every remaining point
    pub fn decode_all(&mut self) -> Result<Vec<(Timestamp, f32)>> {
        let mut points = Vec::new();
        while let Some(pt) = self.next_point()? {
            points.push(pt);
        }
        Ok(points)
    }

    fn decode_timestamp(&mut self) -> Result<Option<i64>> {
        let dod = if !self.reader.read_bit()? {
            0
        } else if !self.reader.read_bit()? {
            self.reader.read_bits(7)? as i64 - 63
        } else if !self.reader.read_bit()? {
            self.reader.read_bits(9)? as i64 - 255
        } else if !self.reader.read_bit()? {
            self.reader.read_bits(12)? as i64 - 2047
        } else {
            let raw = self.reader.read_bits(64)?;
            if raw == END_MARKER {
                return Ok(None);
            }
            raw as i64
        };

        let delta = self.prev_delta + dod;
        let timestamp = self.prev_timestamp + delta;

        self.prev_delta = delta;
        self.prev_timestamp = timestamp;

        Ok(Some(timestamp))
    }

    fn decode_value(&mut self) -> Result<f32> {
        if !self.reader.read_bit()? {
            return Ok(f32::from_bits(self.prev_value_bits));
        }

        let (leading, meaningful) = if !self.reader.read_bit()? {
            // Previous window
            let meaningful = 32 - self.prev_leading - self.prev_trailing;
            (self.prev_leading, meaningful)
        } else {
            let leading = self.reader.read_bits(5)? as u32;
            let meaningful = self.reader.read_bits(6)? as u32;
            self.prev_leading = leading;
            self.prev_trailing = 32 - leading - meaningful;
            (leading, meaningful)
        };

        let trailing = 32 - leading - meaningful;
        let xor = (self.reader.read_bits(meaningful as usize)? as u32) << trailing;
        let bits = self.prev_value_bits ^ xor;

        self.prev_value_bits = bits;
        Ok(f32::from_bits(bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Encoder;

    fn roundtrip(points: &[(i64, f32)], start: i64) -> Vec<(i64, f32)> {
        let mut enc = Encoder::new(start);
        for (ts, val) in points {
            enc.encode(*ts, *val);
        }
        let payload = enc.close();

        let mut dec = Decoder::new(&payload).unwrap();
        assert_eq!(dec.start(), start);
        dec.decode_all().unwrap()
    }

    #[test]
    fn test_roundtrip_regular_series() {
        let points: Vec<(i64, f32)> = (0..500)
            .map(|i| (1_000_000 + i * 10, 20.0 + (i as f32) * 0.5))
            .collect();
        assert_eq!(roundtrip(&points, 1_000_000), points);
    }

    #[test]
    fn test_roundtrip_is_bit_exact_on_special_values() {
        let values = [
            f32::NAN,
            f32::INFINITY,
            f32::NEG_INFINITY,
            f32::MIN_POSITIVE,
            1.0e-41, // subnormal
            -0.0,
            0.0,
            f32::MAX,
        ];
        let points: Vec<(i64, f32)> = values
            .iter()
            .enumerate()
            .map(|(i, v)| (100 + i as i64 * 7, *v))
            .collect();

        let decoded = roundtrip(&points, 100);
        assert_eq!(decoded.len(), points.len());
        for ((ts, val), (dts, dval)) in points.iter().zip(decoded.iter()) {
            assert_eq!(ts, dts);
            assert_eq!(val.to_bits(), dval.to_bits());
        }
    }

    #[test]
    fn test_roundtrip_irregular_deltas() {
        let points = vec![
            (0, 1.5),
            (1, 1.5),
            (2, -7.25),
            (300, 0.0),
            (301, f32::NAN),
            (6000, 1.0e-30),
            (7199, 42.0),
        ];
        assert_eq!(
            roundtrip(&points, 0).len(),
            points.len()
        );
        let decoded = roundtrip(&points, 0);
        for ((ts, val), (dts, dval)) in points.iter().zip(decoded.iter()) {
            assert_eq!(ts, dts);
            assert_eq!(val.to_bits(), dval.to_bits());
        }
    }

    #[test]
    fn test_empty_payload_decodes_to_nothing() {
        let payload = Encoder::new(7200).close();
        let mut dec = Decoder::new(&payload).unwrap();
        assert_eq!(dec.decode_all().unwrap(), vec![]);
        // Repeated polls stay at the end.
        assert_eq!(dec.next_point().unwrap(), None);
    }

    #[test]
    fn test_short_payload_is_bad_header() {
        assert!(matches!(
            Decoder::new(&[0u8; 4]),
            Err(KairoError::BadHeader)
        ));
    }

    #[test]
    fn test_truncated_payload_is_detected() {
        let mut enc = Encoder::new(0);
        for i in 0..100 {
            enc.encode(i * 3, i as f32 * 0.1);
        }
        let payload = enc.close();

        // Chop off the tail, losing the closing marker.
        let mut dec = Decoder::new(&payload[..payload.len() - 9]).unwrap();
        let err = loop {
            match dec.next_point() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("truncated payload decoded cleanly"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, KairoError::Truncated));
    }
}
