//! Content identity and timestamp handling.
//!
//! A memory's identity is the SHA-256 of its content bytes, hex-lowercased.
//! Metadata is deliberately excluded so that retagging or annotating a
//! memory never changes its identity. Timestamps are stored as fractional
//! epoch seconds (UTC) with derived RFC 3339 representations on the wire.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use sha2::{Digest, Sha256};

use crate::error::{MnemoError, Result};

/// Epoch-millisecond values start around 10^12; anything smaller is seconds.
const EPOCH_MILLIS_CUTOVER: f64 = 1e12;

/// Compute the content hash for a memory: lowercase hex SHA-256 of the
/// exact content bytes.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Current time as fractional epoch seconds (UTC, microsecond resolution).
pub fn now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Render fractional epoch seconds as RFC 3339 with a `Z` suffix.
pub fn timestamp_to_iso(ts: f64) -> String {
    let micros = (ts * 1_000_000.0).round() as i64;
    match Utc.timestamp_micros(micros) {
        chrono::LocalResult::Single(dt) => dt.to_rfc3339_opts(SecondsFormat::Micros, true),
        _ => Utc
            .timestamp_micros(0)
            .unwrap()
            .to_rfc3339_opts(SecondsFormat::Micros, true),
    }
}

/// Parse an RFC 3339 timestamp (any offset) into fractional epoch seconds.
pub fn iso_to_timestamp(iso: &str) -> Result<f64> {
    let dt = DateTime::parse_from_rfc3339(iso)
        .map_err(|e| MnemoError::InvalidInput(format!("invalid timestamp '{iso}': {e}")))?;
    Ok(dt.timestamp_micros() as f64 / 1_000_000.0)
}

/// Parse a wire timestamp: RFC 3339, epoch seconds, or epoch milliseconds
/// (auto-detected by magnitude).
pub fn parse_timestamp(value: &str) -> Result<f64> {
    let trimmed = value.trim();
    if let Ok(numeric) = trimmed.parse::<f64>() {
        if numeric.abs() >= EPOCH_MILLIS_CUTOVER {
            return Ok(numeric / 1000.0);
        }
        return Ok(numeric);
    }
    iso_to_timestamp(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_lowercase_hex_sha256() {
        let hash = content_hash("hello world");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash.to_lowercase());
        // Known SHA-256 of "hello world"
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn hash_depends_on_content_only() {
        assert_eq!(content_hash("same text"), content_hash("same text"));
        assert_ne!(content_hash("one"), content_hash("two"));
    }

    #[test]
    fn hash_preserves_unicode_bytes() {
        let a = content_hash("emoji: \u{1f980} crab");
        let b = content_hash("emoji: \u{1f980} crab");
        assert_eq!(a, b);
        assert_ne!(a, content_hash("emoji: crab"));
    }

    #[test]
    fn iso_round_trip() {
        let ts = 1_700_000_000.123456;
        let iso = timestamp_to_iso(ts);
        assert!(iso.ends_with('Z'));
        let back = iso_to_timestamp(&iso).unwrap();
        assert!((back - ts).abs() < 1e-6);
    }

    #[test]
    fn parse_epoch_seconds_and_millis() {
        assert_eq!(parse_timestamp("1700000000").unwrap(), 1_700_000_000.0);
        assert_eq!(parse_timestamp("1700000000000").unwrap(), 1_700_000_000.0);
        assert_eq!(parse_timestamp("1700000000.5").unwrap(), 1_700_000_000.5);
    }

    #[test]
    fn parse_rfc3339_with_offset() {
        let ts = parse_timestamp("2024-01-01T12:00:00+02:00").unwrap();
        assert_eq!(ts, iso_to_timestamp("2024-01-01T10:00:00Z").unwrap());
    }

    #[test]
    fn parse_garbage_fails() {
        assert!(parse_timestamp("not a time").is_err());
    }

    #[test]
    fn now_is_recent() {
        let ts = now();
        // Sanity bound: after 2023, before 2100.
        assert!(ts > 1_672_531_200.0);
        assert!(ts < 4_102_444_800.0);
    }
}
