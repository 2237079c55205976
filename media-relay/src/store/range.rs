//! `Range: bytes=...` handling for artifact reads.

use crate::error::{Error, Result};

/// Inclusive byte range inside a file of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Build a range, requiring `start <= end < size`. Never clamps.
    pub fn new(start: u64, end: u64, size: u64) -> Result<Self> {
        if start > end || end >= size {
            return Err(Error::RangeNotSatisfiable { size });
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value of the `Content-Range` header for this range.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

/// What a range header asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// No usable range: serve the whole file.
    Full,
    Partial(ByteRange),
    Unsatisfiable,
}

/// Interpret a `Range` header against a file of `size` bytes.
///
/// Supports a single `start-end`, `start-` or `-suffix` range. A range that
/// does not fit `start <= end < size` is unsatisfiable, never clamped.
/// Headers that are not a single byte range (other units, multiple ranges,
/// garbage) are ignored and the full file is served.
pub fn parse_range(header: Option<&str>, size: u64) -> RangeRequest {
    let Some(spec) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return RangeRequest::Full;
    };
    let spec = spec.trim();
    if spec.contains(',') {
        return RangeRequest::Full;
    }
    let Some((start, end)) = spec.split_once('-') else {
        return RangeRequest::Full;
    };
    let (start, end) = (start.trim(), end.trim());

    let range = match (start.is_empty(), end.is_empty()) {
        (true, true) => return RangeRequest::Full,
        // Suffix: the last `n` bytes.
        (true, false) => {
            let Ok(n) = end.parse::<u64>() else {
                return RangeRequest::Full;
            };
            if n == 0 || size == 0 {
                return RangeRequest::Unsatisfiable;
            }
            ByteRange::new(size.saturating_sub(n), size - 1, size)
        }
        (false, true) => {
            let Ok(start) = start.parse::<u64>() else {
                return RangeRequest::Full;
            };
            if size == 0 {
                return RangeRequest::Unsatisfiable;
            }
            ByteRange::new(start, size - 1, size)
        }
        (false, false) => {
            let (Ok(start), Ok(end)) = (start.parse::<u64>(), end.parse::<u64>()) else {
                return RangeRequest::Full;
            };
            ByteRange::new(start, end, size)
        }
    };

    match range {
        Ok(range) => RangeRequest::Partial(range),
        Err(_) => RangeRequest::Unsatisfiable,
    }
}
