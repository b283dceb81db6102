//! `Range` header parsing

use crate::error::StreamError;

/// An inclusive, satisfiable byte range within an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered, always at least one
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for the `Content-Range` header
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

/// Parse a single-range `Range` header against an artifact of `size` bytes.
///
/// Accepts `bytes=start-end`, `bytes=start-` and `bytes=-suffix`. An end past
/// the artifact is clamped to the last byte. Everything else, including
/// multiple ranges, is rejected.
pub fn parse_range(header: &str, size: u64) -> Result<ByteRange, StreamError> {
    let unsatisfiable = || StreamError::RangeNotSatisfiable { size };

    let (unit, set) = header.trim().split_once('=').ok_or_else(unsatisfiable)?;
    if !unit.trim().eq_ignore_ascii_case("bytes") || set.contains(',') {
        return Err(unsatisfiable());
    }
    let (first, last) = set.trim().split_once('-').ok_or_else(unsatisfiable)?;
    let (first, last) = (first.trim(), last.trim());

    if size == 0 {
        return Err(unsatisfiable());
    }

    if first.is_empty() {
        let suffix = parse_position(last).ok_or_else(unsatisfiable)?;
        if suffix == 0 {
            return Err(unsatisfiable());
        }
        return Ok(ByteRange {
            start: size.saturating_sub(suffix),
            end: size - 1,
        });
    }

    let start = parse_position(first).ok_or_else(unsatisfiable)?;
    let end = if last.is_empty() {
        size - 1
    } else {
        let end = parse_position(last).ok_or_else(unsatisfiable)?;
        if start > end {
            return Err(unsatisfiable());
        }
        end.min(size - 1)
    };

    if start >= size {
        return Err(unsatisfiable());
    }

    Ok(ByteRange { start, end })
}

fn parse_position(raw: &str) -> Option<u64> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}
