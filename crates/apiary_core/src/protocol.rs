//! Protocol constants and canonical signing payloads.
//!
//! Every server and client speaking this protocol must agree on the exact
//! byte sequence that gets signed during a join, so the payload builders
//! here are the single source of truth for field order.

use chrono::{DateTime, Utc};

/// Wire protocol version, included in the canonical join payload and
/// reported by `/health` and `/protocol`.
pub const PROTOCOL_VERSION: &str = "1.0";

// ---------------------------------------------------------------------------
// Default timing constants (all overridable through the config file)
// ---------------------------------------------------------------------------

/// How long an issued challenge stays valid.
pub const CHALLENGE_TTL_MS: i64 = 2 * 60 * 1000;

/// How long a minted session stays valid. No renewal; expiry means re-join.
pub const SESSION_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// Maximum tolerated difference between a join request's timestamp and the
/// server clock.
pub const MAX_CLOCK_SKEW_MS: i64 = 2 * 60 * 1000;

/// Maximum age of a device-proof `signed_at` before the proof is rejected.
pub const DEVICE_PROOF_MAX_AGE_MS: i64 = 5 * 60 * 1000;

/// Default gossip poll interval in seconds.
pub const GOSSIP_INTERVAL_SECS: u64 = 5;

/// Enforced floor for the gossip poll interval.
pub const GOSSIP_MIN_INTERVAL_SECS: u64 = 1;

/// Default timeout for a single peer HTTP call during gossip.
pub const GOSSIP_HTTP_TIMEOUT_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// Read and input limits
// ---------------------------------------------------------------------------

/// Page size used when a read request does not specify a limit.
pub const READ_LIMIT_DEFAULT: usize = 50;

/// Hard ceiling on any single read, independent of what the caller asks for.
pub const READ_LIMIT_CAP: usize = 200;

/// Maximum accepted message content size in bytes.
pub const MAX_CONTENT_BYTES: usize = 16 * 1024;

/// Maximum length for agent ids, hive ids, channels, and uids.
pub const MAX_IDENT_CHARS: usize = 128;

// ---------------------------------------------------------------------------
// Canonical payloads
// ---------------------------------------------------------------------------

/// Builds the canonical join payload: the exact newline-joined byte sequence
/// an agent signs to consume a challenge. Field order is fixed by the
/// protocol and must never change within a protocol version.
pub fn join_payload(
    agent_id: &str,
    pubkey_b58: &str,
    nonce: &str,
    hive_id: &str,
    challenge_expires_at_ms: i64,
    timestamp: &str,
) -> String {
    [
        PROTOCOL_VERSION,
        agent_id,
        pubkey_b58,
        nonce,
        hive_id,
        &challenge_expires_at_ms.to_string(),
        timestamp,
    ]
    .join("\n")
}

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Current time as Unix epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current time as an RFC 3339 string.
pub fn iso_now() -> String {
    Utc::now().to_rfc3339()
}

/// Parses an RFC 3339 timestamp into epoch milliseconds. Returns `None` for
/// anything that does not parse; callers turn that into a typed rejection.
pub fn parse_rfc3339_ms(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Formats epoch milliseconds as an RFC 3339 string (UTC). Falls back to the
/// epoch itself for values outside chrono's representable range.
pub fn ms_to_rfc3339(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_default()
        .to_rfc3339()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_payload_field_order_is_fixed() {
        let payload = join_payload("agent-1", "PubKey58", "abc123", "h1", 1700000000000, "2024-01-01T00:00:00Z");
        let lines: Vec<&str> = payload.split('\n').collect();
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[0], PROTOCOL_VERSION);
        assert_eq!(lines[1], "agent-1");
        assert_eq!(lines[2], "PubKey58");
        assert_eq!(lines[3], "abc123");
        assert_eq!(lines[4], "h1");
        assert_eq!(lines[5], "1700000000000");
        assert_eq!(lines[6], "2024-01-01T00:00:00Z");
    }

    #[test]
    fn join_payload_differs_per_field() {
        let base = join_payload("a", "k", "n", "h", 1, "t");
        assert_ne!(base, join_payload("b", "k", "n", "h", 1, "t"));
        assert_ne!(base, join_payload("a", "k", "n2", "h", 1, "t"));
        assert_ne!(base, join_payload("a", "k", "n", "h", 2, "t"));
    }

    #[test]
    fn parse_rfc3339_accepts_z_and_offset() {
        assert!(parse_rfc3339_ms("2024-06-01T12:00:00Z").is_some());
        assert!(parse_rfc3339_ms("2024-06-01T12:00:00.123+02:00").is_some());
    }

    #[test]
    fn parse_rfc3339_rejects_garbage() {
        assert!(parse_rfc3339_ms("").is_none());
        assert!(parse_rfc3339_ms("yesterday").is_none());
        assert!(parse_rfc3339_ms("2024-13-99T99:99:99Z").is_none());
        assert!(parse_rfc3339_ms("1718000000000").is_none());
    }

    #[test]
    fn ms_round_trips_through_rfc3339() {
        let ms = 1_700_000_000_123;
        let parsed = parse_rfc3339_ms(&ms_to_rfc3339(ms)).unwrap();
        assert_eq!(parsed, ms);
    }

    #[test]
    fn now_helpers_are_consistent() {
        let ms = now_ms();
        let parsed = parse_rfc3339_ms(&iso_now()).unwrap();
        assert!((parsed - ms).abs() < 5000);
    }
}
