//! `Range` header handling for media playback.
//!
//! Only a single `bytes` range is understood. Anything else is ignored so the
//! caller serves the full resource, which HTTP allows for unparseable ranges.

/// Most bytes served for an open-ended `bytes=<start>-` request. Keeps
/// seek-heavy players responsive and bounds the IO of a single request.
pub const DEFAULT_CHUNK_BYTES: u64 = 2 * 1024 * 1024;

/// Inclusive byte interval of a resource plus the resource's total size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeWindow {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl RangeWindow {
    /// Number of bytes in the window; never zero.
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value of the `Content-Range` header for a 206 response.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Outcome of matching a `Range` header against a resource of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// No usable range; serve everything with 200.
    Full,
    /// Serve this window with 206.
    Partial(RangeWindow),
    /// The requested start lies beyond the resource; answer 416.
    Unsatisfiable { total: u64 },
}

/// Parses `header` (if any) for a resource of `total` bytes.
pub fn resolve_range(header: Option<&str>, total: u64) -> RangeRequest {
    let Some(spec) = header.and_then(parse_range_spec) else {
        return RangeRequest::Full;
    };

    match spec {
        RangeSpec::Suffix(len) => {
            if total == 0 {
                return RangeRequest::Unsatisfiable { total };
            }
            let start = total.saturating_sub(len);
            RangeRequest::Partial(RangeWindow {
                start,
                end: total - 1,
                total,
            })
        }
        RangeSpec::From { start, end } => {
            if start >= total {
                return RangeRequest::Unsatisfiable { total };
            }
            let last = total - 1;
            let end = match end {
                Some(end) => end.min(last),
                None => start.saturating_add(DEFAULT_CHUNK_BYTES - 1).min(last),
            };
            RangeRequest::Partial(RangeWindow { start, end, total })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeSpec {
    From { start: u64, end: Option<u64> },
    Suffix(u64),
}

fn parse_range_spec(value: &str) -> Option<RangeSpec> {
    let (unit, range) = value.trim().split_once('=')?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return None;
    }
    let range = range.trim();
    if range.is_empty() || range.contains(',') {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;
    let (start_str, end_str) = (start_str.trim(), end_str.trim());

    if start_str.is_empty() {
        // "-N" asks for the last N bytes.
        let suffix_len = parse_offset(end_str)?;
        if suffix_len == 0 {
            return None;
        }
        return Some(RangeSpec::Suffix(suffix_len));
    }

    let start = parse_offset(start_str)?;
    let end = if end_str.is_empty() {
        None
    } else {
        Some(parse_offset(end_str)?)
    };
    if let Some(end) = end
        && end < start
    {
        return None;
    }
    Some(RangeSpec::From { start, end })
}

fn parse_offset(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}
