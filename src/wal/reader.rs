//! WAL segment scanning and replay

use std::fs;
use std::path::Path;

use tracing::warn;

use super::entry::WalEntry;
use crate::{KairoError, Result, SeriesId};
use crate::proto;

pub(crate) const SEGMENT_PREFIX: &str = "wal_";
pub(crate) const SEGMENT_SUFFIX: &str = ".log";

/// File name for a segment id; zero-padded so lexical order is id order
pub(crate) fn segment_file_name(id: i64) -> String {
    format!("{}{:020}{}", SEGMENT_PREFIX, id, SEGMENT_SUFFIX)
}

/// Parse a segment file name back into its id
pub(crate) fn parse_segment_id(name: &str) -> Option<i64> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// Segment file names in `dir`, sorted ascending by id
pub fn segment_file_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();

    if !dir.exists() {
        return Ok(names);
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if parse_segment_id(name).is_some() {
                names.push(name.to_string());
            }
        }
    }

    names.sort_by_key(|name| parse_segment_id(name).unwrap_or(0));
    Ok(names)
}

/// Decode one segment back into wire points.
///
/// A torn tail (crash mid-append) or a checksum mismatch ends the scan with
/// whatever decoded cleanly before it.
pub(crate) fn replay_segment(path: &Path) -> Result<Vec<proto::Point>> {
    let data = fs::read(path)?;

    let mut points = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        match WalEntry::deserialize_with_checksum(&data[offset..]) {
            Ok(Some((entry, read))) => {
                offset += read;
                for (ksts, values) in entry.values {
                    let id = match SeriesId::from_ksts(&ksts) {
                        Some(id) => id,
                        None => {
                            warn!("segment {:?} - skipping malformed series key {:?}", path, ksts);
                            continue;
                        }
                    };
                    for v in values {
                        points.push(proto::Point {
                            ksid: id.ksid.clone(),
                            tsid: id.tsid.clone(),
                            date: v.unix,
                            value: v.value as f32,
                        });
                    }
                }
            }
            Ok(None) => break,
            Err(KairoError::ChecksumMismatch { .. }) => {
                warn!("segment {:?} - checksum mismatch at offset {}, truncating", path, offset);
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(points)
}
