//! `Content-Range` header parsing
//!
//! Accepts the two forms a server may send for a byte range:
//! `bytes <first>-<last>/<complete-length | *>` for a satisfied range and
//! `bytes */<complete-length>` for an unsatisfied one.

use crate::error::TransferError;
use resumable_types::ByteRange;

/// A parsed `Content-Range` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// Range actually returned, `None` when the request was not satisfiable
    pub range: Option<ByteRange>,
    /// Complete length of the representation, `None` when reported as `*`
    pub size: Option<u64>,
}

impl ContentRange {
    pub fn parse(value: &str) -> Result<Self, TransferError> {
        let malformed = || TransferError::MalformedContentRange(value.to_string());

        let rest = value
            .trim()
            .strip_prefix("bytes")
            .filter(|r| r.starts_with(' '))
            .ok_or_else(malformed)?
            .trim_start();

        let (range_part, size_part) = rest.split_once('/').ok_or_else(malformed)?;

        let size = match size_part.trim() {
            "*" => None,
            digits => Some(parse_u64(digits).ok_or_else(malformed)?),
        };

        let range = match range_part.trim() {
            "*" => None,
            bounds => {
                let (first, last) = bounds.split_once('-').ok_or_else(malformed)?;
                let first = parse_u64(first).ok_or_else(malformed)?;
                let last = parse_u64(last).ok_or_else(malformed)?;
                let range = ByteRange::new(first, last).ok_or_else(malformed)?;
                if size.is_some_and(|size| range.end >= size) {
                    return Err(malformed());
                }
                Some(range)
            }
        };

        // `bytes */*` carries no information at all
        if range.is_none() && size.is_none() {
            return Err(malformed());
        }

        Ok(Self { range, size })
    }

    pub fn is_satisfied(&self) -> bool {
        self.range.is_some()
    }

    pub fn is_size_known(&self) -> bool {
        self.size.is_some()
    }

    /// Whether the returned range is the entire representation
    pub fn covers_whole(&self) -> bool {
        match (self.range, self.size) {
            (Some(range), Some(size)) => range.start == 0 && range.next_start() == size,
            _ => false,
        }
    }
}

fn parse_u64(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_satisfied_range() {
        let parsed = ContentRange::parse("bytes 0-999/100000").unwrap();
        assert_eq!(parsed.range, Some(ByteRange { start: 0, end: 999 }));
        assert_eq!(parsed.size, Some(100000));
        assert!(parsed.is_satisfied());
        assert!(parsed.is_size_known());
        assert!(!parsed.covers_whole());
    }

    #[test]
    fn test_parse_unknown_size() {
        let parsed = ContentRange::parse("bytes 42-1233/*").unwrap();
        assert_eq!(parsed.range, Some(ByteRange { start: 42, end: 1233 }));
        assert!(!parsed.is_size_known());
    }

    #[test]
    fn test_parse_unsatisfied() {
        let parsed = ContentRange::parse("bytes */1234").unwrap();
        assert!(!parsed.is_satisfied());
        assert_eq!(parsed.size, Some(1234));
    }

    #[test]
    fn test_covers_whole() {
        assert!(ContentRange::parse("bytes 0-9/10").unwrap().covers_whole());
        assert!(!ContentRange::parse("bytes 1-9/10").unwrap().covers_whole());
    }

    #[test]
    fn test_rejects_malformed() {
        for value in [
            "",
            "bytes",
            "items 0-9/10",
            "bytes0-9/10",
            "bytes 0-9",
            "bytes 9-0/10",
            "bytes 0-10/10",
            "bytes -5/10",
            "bytes 0-+5/10",
            "bytes */*",
        ] {
            assert!(
                matches!(
                    ContentRange::parse(value),
                    Err(TransferError::MalformedContentRange(_))
                ),
                "{value:?} should be rejected"
            );
        }
    }
}
