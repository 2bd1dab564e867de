//! Request and response bodies for the HTTP surface.

use serde::{Deserialize, Serialize};

use apiary_hive::message::{DEFAULT_CHANNEL, MessageCandidate, MessageSource};
use apiary_hive::{HiveMessage, Session};

use apiary_core::protocol;

// ---------------------------------------------------------------------------
// Client-facing bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeRequest {
    pub agent_id: String,
    pub pubkey: String,
    pub hive_id: String,
}

/// Minted by a successful join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub token: String,
    pub agent_id: String,
    pub hive_id: String,
    /// Session expiry, epoch milliseconds.
    pub expires_at: i64,
}

impl JoinResponse {
    pub fn new(token: String, session: &Session) -> Self {
        Self {
            token,
            agent_id: session.agent_id.clone(),
            hive_id: session.hive_id.clone(),
            expires_at: session.expires_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostMessageRequest {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// `duplicate` means the uid was already present; the post is then a no-op
/// and `message` is null.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostMessageResponse {
    pub message: Option<HiveMessage>,
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<HiveMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub protocol_version: String,
}

/// Stable error body for every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

// ---------------------------------------------------------------------------
// Gossip bodies
// ---------------------------------------------------------------------------

/// Pull feed: everything a peer stored for the hive after the caller's
/// cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipFeed {
    pub hive_id: String,
    pub messages: Vec<HiveMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipPush {
    pub hive_id: String,
    pub messages: Vec<GossipRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipPushOutcome {
    pub accepted: usize,
    pub skipped: usize,
}

/// One record as a peer sends it. Everything is optional at the wire level;
/// [`GossipRecord::into_candidate`] decides what is actually acceptable, so
/// a single malformed record never poisons its batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GossipRecord {
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
    #[serde(default)]
    pub created_at_ms: Option<i64>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub hive_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
}

impl GossipRecord {
    /// A stored message as this server would relay it.
    pub fn from_message(message: &HiveMessage) -> Self {
        Self {
            uid: Some(message.uid.clone()),
            ts: Some(message.ts.clone()),
            created_at_ms: Some(message.created_at_ms),
            agent_id: Some(message.agent_id.clone()),
            hive_id: Some(message.hive_id.clone()),
            content: Some(message.content.clone()),
            channel: Some(message.channel.clone()),
        }
    }

    /// Turns a remote record into an append candidate for `hive_id`.
    /// Requires `uid`, `agent_id`, `content`, and a positive
    /// `created_at_ms`; derives `ts` from `created_at_ms` when absent. A
    /// record whose embedded hive id contradicts the batch's is rejected.
    /// Every relayed copy is recorded as gossip-sourced.
    pub fn into_candidate(self, hive_id: &str) -> Result<MessageCandidate, String> {
        if let Some(embedded) = &self.hive_id {
            if embedded != hive_id {
                return Err(format!(
                    "record hive_id '{embedded}' contradicts batch hive_id '{hive_id}'"
                ));
            }
        }
        let uid = self.uid.ok_or("record missing uid")?;
        let agent_id = self.agent_id.ok_or("record missing agent_id")?;
        let content = self.content.ok_or("record missing content")?;
        let created_at_ms = match self.created_at_ms {
            Some(ms) if ms > 0 => ms,
            _ => return Err("record missing or non-positive created_at_ms".to_string()),
        };

        let candidate = MessageCandidate {
            uid,
            ts: self
                .ts
                .unwrap_or_else(|| protocol::ms_to_rfc3339(created_at_ms)),
            created_at_ms,
            agent_id,
            hive_id: hive_id.to_string(),
            content,
            channel: self.channel.unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
            source: MessageSource::Gossip,
        };
        candidate.validate()?;
        Ok(candidate)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn full_record() -> GossipRecord {
        GossipRecord {
            uid: Some("u1".to_string()),
            ts: Some("2026-01-01T00:00:00+00:00".to_string()),
            created_at_ms: Some(1_767_225_600_000),
            agent_id: Some("agent-1".to_string()),
            hive_id: Some("h1".to_string()),
            content: Some("hello".to_string()),
            channel: Some("ops".to_string()),
        }
    }

    #[test]
    fn complete_record_becomes_a_gossip_candidate() {
        let candidate = full_record().into_candidate("h1").unwrap();
        assert_eq!(candidate.uid, "u1");
        assert_eq!(candidate.hive_id, "h1");
        assert_eq!(candidate.channel, "ops");
        assert_eq!(candidate.source, MessageSource::Gossip);
    }

    #[test]
    fn missing_required_fields_are_rejected() {
        for strip in [
            |r: &mut GossipRecord| r.uid = None,
            |r: &mut GossipRecord| r.agent_id = None,
            |r: &mut GossipRecord| r.content = None,
            |r: &mut GossipRecord| r.created_at_ms = None,
            |r: &mut GossipRecord| r.created_at_ms = Some(0),
        ] {
            let mut record = full_record();
            strip(&mut record);
            assert!(record.into_candidate("h1").is_err());
        }
    }

    #[test]
    fn contradicting_hive_id_is_rejected() {
        let err = full_record().into_candidate("h2").unwrap_err();
        assert!(err.contains("contradicts"));
    }

    #[test]
    fn absent_hive_id_and_channel_take_the_batch_defaults() {
        let mut record = full_record();
        record.hive_id = None;
        record.channel = None;
        let candidate = record.into_candidate("h1").unwrap();
        assert_eq!(candidate.hive_id, "h1");
        assert_eq!(candidate.channel, DEFAULT_CHANNEL);
    }

    #[test]
    fn ts_is_derived_when_absent() {
        let mut record = full_record();
        record.ts = None;
        let candidate = record.into_candidate("h1").unwrap();
        assert_eq!(
            protocol::parse_rfc3339_ms(&candidate.ts),
            Some(1_767_225_600_000)
        );
    }

    #[test]
    fn round_trips_a_stored_message() {
        let message = MessageCandidate::local("h1", "a", "x", None, Some("u9".to_string()))
            .into_message(3);
        let candidate = GossipRecord::from_message(&message)
            .into_candidate("h1")
            .unwrap();
        assert_eq!(candidate.uid, "u9");
        assert_eq!(candidate.created_at_ms, message.created_at_ms);
        // Relayed copies lose the local marking.
        assert_eq!(candidate.source, MessageSource::Gossip);
    }

    #[test]
    fn sparse_json_deserializes() {
        let record: GossipRecord = serde_json::from_str(
            r#"{"uid":"u1","agent_id":"a","content":"c","created_at_ms":1000}"#,
        )
        .unwrap();
        assert!(record.into_candidate("h1").is_ok());
    }
}
