//! `Range` / `Content-Range` header syntax.

use crate::ProtocolError;

/// Formats a half-open `[start, end)` interval as an HTTP range header value.
///
/// `end` must be greater than `start`; HTTP ranges are inclusive on both ends.
pub fn format_range(start: u64, end: u64) -> String {
    debug_assert!(end > start, "empty range {start}..{end}");
    format!("bytes={}-{}", start, end.saturating_sub(1))
}

/// Parsed `Content-Range` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    /// Exclusive end.
    pub end: u64,
    /// Full size of the resource, `None` when the server sent `*`.
    pub total: Option<u64>,
}

/// Parses a header like `bytes 0-99/1000`.
pub fn parse_content_range(value: &str) -> Result<ContentRange, ProtocolError> {
    let err = || ProtocolError::ContentRange(value.to_string());

    let rest = value.trim().strip_prefix("bytes").ok_or_else(err)?.trim_start();
    let (span, total) = rest.split_once('/').ok_or_else(err)?;
    let (start, end) = span.split_once('-').ok_or_else(err)?;

    let start: u64 = start.trim().parse().map_err(|_| err())?;
    let end_inclusive: u64 = end.trim().parse().map_err(|_| err())?;
    if end_inclusive < start {
        return Err(err());
    }
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse::<u64>().map_err(|_| err())?),
    };

    Ok(ContentRange {
        start,
        end: end_inclusive + 1,
        total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_is_inclusive() {
        assert_eq!(format_range(0, 4_000_000), "bytes=0-3999999");
        assert_eq!(format_range(8_000_000, 10_000_000), "bytes=8000000-9999999");
    }

    #[test]
    fn parse_full_header() {
        let cr = parse_content_range("bytes 0-3999999/10000000").unwrap();
        assert_eq!(
            cr,
            ContentRange {
                start: 0,
                end: 4_000_000,
                total: Some(10_000_000),
            }
        );
    }

    #[test]
    fn parse_unknown_total() {
        let cr = parse_content_range("bytes 10-19/*").unwrap();
        assert_eq!(cr.total, None);
        assert_eq!(cr.end, 20);
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in ["", "bytes", "bytes 5-1/10", "items 0-1/2", "bytes a-b/c", "bytes 0-1"] {
            assert!(parse_content_range(bad).is_err(), "{bad:?} should fail");
        }
    }
}
