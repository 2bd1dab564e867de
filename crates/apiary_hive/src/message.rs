//! Message types for the per-hive append-only log.

use serde::{Deserialize, Serialize};

use apiary_core::protocol;

/// Channel used when a poster does not name one.
pub const DEFAULT_CHANNEL: &str = "default";

// ---------------------------------------------------------------------------
// Data Types
// ---------------------------------------------------------------------------

/// Where a stored message entered this server. `Local` survives only at the
/// origin server; every relayed copy is recorded as `Gossip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    Local,
    Gossip,
}

impl MessageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Gossip => "gossip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "gossip" => Some(Self::Gossip),
            _ => None,
        }
    }
}

/// One immutable record in a hive's message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiveMessage {
    /// Monotonic per-hive id, gap-free under the single-writer actor.
    pub id: i64,
    /// Caller-chosen globally unique identifier; the dedup key.
    pub uid: String,
    /// RFC 3339 creation time as recorded at the origin server.
    pub ts: String,
    /// Epoch milliseconds; the gossip synchronization key.
    pub created_at_ms: i64,
    pub agent_id: String,
    pub hive_id: String,
    pub content: String,
    pub channel: String,
    pub source: MessageSource,
}

/// An append request: everything a [`HiveMessage`] carries except the `id`,
/// which the owning hive actor allocates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageCandidate {
    pub uid: String,
    pub ts: String,
    pub created_at_ms: i64,
    pub agent_id: String,
    pub hive_id: String,
    pub content: String,
    pub channel: String,
    pub source: MessageSource,
}

impl MessageCandidate {
    /// Builds a candidate for a message first posted here by a client.
    /// Synthesizes a uid when the caller did not pick one.
    pub fn local(
        hive_id: impl Into<String>,
        agent_id: impl Into<String>,
        content: impl Into<String>,
        channel: Option<String>,
        uid: Option<String>,
    ) -> Self {
        Self {
            uid: uid.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
            ts: protocol::iso_now(),
            created_at_ms: protocol::now_ms(),
            agent_id: agent_id.into(),
            hive_id: hive_id.into(),
            content: content.into(),
            channel: channel.unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
            source: MessageSource::Local,
        }
    }

    /// Finalizes the candidate into a stored record with its allocated id.
    pub fn into_message(self, id: i64) -> HiveMessage {
        HiveMessage {
            id,
            uid: self.uid,
            ts: self.ts,
            created_at_ms: self.created_at_ms,
            agent_id: self.agent_id,
            hive_id: self.hive_id,
            content: self.content,
            channel: self.channel,
            source: self.source,
        }
    }

    /// Checks field shape: non-empty identifiers within length bounds and
    /// content within the size cap. Returns the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        check_ident("uid", &self.uid)?;
        check_ident("agent_id", &self.agent_id)?;
        check_ident("hive_id", &self.hive_id)?;
        check_ident("channel", &self.channel)?;
        if self.content.is_empty() {
            return Err("content must not be empty".to_string());
        }
        if self.content.len() > protocol::MAX_CONTENT_BYTES {
            return Err(format!(
                "content exceeds {} bytes",
                protocol::MAX_CONTENT_BYTES
            ));
        }
        if self.created_at_ms <= 0 {
            return Err("created_at_ms must be positive".to_string());
        }
        Ok(())
    }
}

fn check_ident(field: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    if value.chars().count() > protocol::MAX_IDENT_CHARS {
        return Err(format!(
            "{field} exceeds {} characters",
            protocol::MAX_IDENT_CHARS
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_candidate_fills_defaults() {
        let candidate = MessageCandidate::local("h1", "agent-1", "hello", None, None);
        assert_eq!(candidate.hive_id, "h1");
        assert_eq!(candidate.channel, DEFAULT_CHANNEL);
        assert_eq!(candidate.source, MessageSource::Local);
        assert!(!candidate.uid.is_empty());
        assert!(candidate.created_at_ms > 0);
        assert!(candidate.validate().is_ok());
    }

    #[test]
    fn local_candidates_get_distinct_uids() {
        let a = MessageCandidate::local("h1", "a", "x", None, None);
        let b = MessageCandidate::local("h1", "a", "x", None, None);
        assert_ne!(a.uid, b.uid);
    }

    #[test]
    fn explicit_uid_and_channel_are_kept() {
        let candidate = MessageCandidate::local(
            "h1",
            "agent-1",
            "hello",
            Some("ops".to_string()),
            Some("uid-7".to_string()),
        );
        assert_eq!(candidate.uid, "uid-7");
        assert_eq!(candidate.channel, "ops");
    }

    #[test]
    fn into_message_preserves_fields() {
        let candidate = MessageCandidate::local("h1", "agent-1", "hello", None, None);
        let uid = candidate.uid.clone();
        let message = candidate.into_message(42);
        assert_eq!(message.id, 42);
        assert_eq!(message.uid, uid);
        assert_eq!(message.hive_id, "h1");
        assert_eq!(message.source, MessageSource::Local);
    }

    #[test]
    fn source_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&MessageSource::Local).unwrap(),
            "\"local\""
        );
        assert_eq!(
            serde_json::to_string(&MessageSource::Gossip).unwrap(),
            "\"gossip\""
        );
        assert_eq!(MessageSource::parse("gossip"), Some(MessageSource::Gossip));
        assert_eq!(MessageSource::parse("unknown"), None);
    }

    #[test]
    fn validate_rejects_bad_shapes() {
        let good = MessageCandidate::local("h1", "agent-1", "hello", None, None);
        assert!(good.validate().is_ok());

        let mut empty_content = good.clone();
        empty_content.content.clear();
        assert!(empty_content.validate().is_err());

        let mut huge = good.clone();
        huge.content = "x".repeat(protocol::MAX_CONTENT_BYTES + 1);
        assert!(huge.validate().is_err());

        let mut no_agent = good.clone();
        no_agent.agent_id.clear();
        assert!(no_agent.validate().is_err());

        let mut long_hive = good.clone();
        long_hive.hive_id = "h".repeat(protocol::MAX_IDENT_CHARS + 1);
        assert!(long_hive.validate().is_err());

        let mut bad_time = good;
        bad_time.created_at_ms = 0;
        assert!(bad_time.validate().is_err());
    }
}
