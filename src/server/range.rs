//! Hand-written parser for the HTTP `Range` header.
//!
//! Only single-range `bytes=` requests are supported, which is what every
//! real client actually sends; multi-range (`bytes=0-10,20-30`) falls back
//! to a full 200 response rather than reaching for a parser-combinator
//! crate over a handful of cases.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive end offset.
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// No `Range` header, or one this parser doesn't understand — serve
    /// the whole resource.
    Full,
    Satisfiable(ByteRange),
    NotSatisfiable,
}

/// Parses a `Range` header value against a resource of `total_size` bytes.
/// Supports `bytes=a-b`, `bytes=a-` (to end) and `bytes=-n` (last n bytes).
pub fn parse_range(header_value: &str, total_size: u64) -> RangeOutcome {
    let Some(spec) = header_value.strip_prefix("bytes=") else {
        return RangeOutcome::Full;
    };
    if spec.contains(',') {
        return RangeOutcome::Full;
    }
    let spec = spec.trim();
    let Some((start_str, end_str)) = spec.split_once('-') else {
        return RangeOutcome::Full;
    };

    if total_size == 0 {
        return RangeOutcome::NotSatisfiable;
    }

    if start_str.is_empty() {
        // Suffix range: last `n` bytes.
        let Ok(n) = end_str.parse::<u64>() else {
            return RangeOutcome::Full;
        };
        if n == 0 {
            return RangeOutcome::NotSatisfiable;
        }
        let n = n.min(total_size);
        return RangeOutcome::Satisfiable(ByteRange {
            start: total_size - n,
            end: total_size - 1,
        });
    }

    let Ok(start) = start_str.parse::<u64>() else {
        return RangeOutcome::Full;
    };
    if start >= total_size {
        return RangeOutcome::NotSatisfiable;
    }
    let end = if end_str.is_empty() {
        total_size - 1
    } else {
        match end_str.parse::<u64>() {
            Ok(e) if e >= total_size => return RangeOutcome::NotSatisfiable,
            Ok(e) => e,
            Err(_) => return RangeOutcome::Full,
        }
    };
    if end < start {
        return RangeOutcome::NotSatisfiable;
    }
    RangeOutcome::Satisfiable(ByteRange { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_range() {
        assert_eq!(
            parse_range("bytes=0-99", 1000),
            RangeOutcome::Satisfiable(ByteRange { start: 0, end: 99 })
        );
    }

    #[test]
    fn open_ended_range() {
        assert_eq!(
            parse_range("bytes=900-", 1000),
            RangeOutcome::Satisfiable(ByteRange { start: 900, end: 999 })
        );
    }

    #[test]
    fn suffix_range() {
        assert_eq!(
            parse_range("bytes=-100", 1000),
            RangeOutcome::Satisfiable(ByteRange { start: 900, end: 999 })
        );
    }

    #[test]
    fn suffix_range_larger_than_resource_clamps() {
        assert_eq!(
            parse_range("bytes=-5000", 1000),
            RangeOutcome::Satisfiable(ByteRange { start: 0, end: 999 })
        );
    }

    #[test]
    fn start_beyond_end_is_not_satisfiable() {
        assert_eq!(parse_range("bytes=5000-", 1000), RangeOutcome::NotSatisfiable);
    }

    #[test]
    fn missing_header_is_full() {
        assert_eq!(parse_range("", 1000), RangeOutcome::Full);
    }

    #[test]
    fn multi_range_falls_back_to_full() {
        assert_eq!(parse_range("bytes=0-10,20-30", 1000), RangeOutcome::Full);
    }

    #[test]
    fn explicit_end_beyond_resource_size_is_not_satisfiable() {
        assert_eq!(parse_range("bytes=0-99999", 1000), RangeOutcome::NotSatisfiable);
        assert_eq!(parse_range("bytes=2-10", 5), RangeOutcome::NotSatisfiable);
    }

    #[test]
    fn explicit_end_at_last_valid_byte_is_satisfiable() {
        assert_eq!(
            parse_range("bytes=0-999", 1000),
            RangeOutcome::Satisfiable(ByteRange { start: 0, end: 999 })
        );
    }
}
