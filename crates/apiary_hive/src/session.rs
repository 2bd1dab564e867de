//! Session store — opaque bearer tokens for authenticated agents.
//!
//! Tokens look like `<hive_id>.<64 hex chars>` so the HTTP layer can route
//! a request to the owning hive actor without a global token table. Callers
//! must still treat the whole token as opaque.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use apiary_core::protocol;

/// A time-bounded credential minted after a successful join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub agent_id: String,
    pub pubkey: String,
    pub hive_id: String,
    /// Epoch milliseconds.
    pub expires_at: i64,
}

/// In-memory session table for one hive, keyed by bearer token.
///
/// Expiry is lazy: an expired session is evicted by the first `validate`
/// that touches it. There is no renewal; reaching the TTL means a fresh
/// join.
pub struct SessionStore {
    sessions: HashMap<String, Session>,
    ttl_ms: i64,
}

impl SessionStore {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            sessions: HashMap::new(),
            ttl_ms,
        }
    }

    /// Mints an unguessable token and records the session under it.
    pub fn create(&mut self, agent_id: &str, pubkey: &str, hive_id: &str) -> (String, Session) {
        let token = mint_token(hive_id);
        let session = Session {
            agent_id: agent_id.to_string(),
            pubkey: pubkey.to_string(),
            hive_id: hive_id.to_string(),
            expires_at: protocol::now_ms() + self.ttl_ms,
        };
        self.sessions.insert(token.clone(), session.clone());
        (token, session)
    }

    /// Resolves a token to its session. An expired session is treated
    /// exactly like an unknown one and is removed by this access.
    pub fn validate(&mut self, token: &str) -> Option<Session> {
        match self.sessions.get(token) {
            Some(session) if session.expires_at >= protocol::now_ms() => Some(session.clone()),
            Some(_) => {
                self.sessions.remove(token);
                None
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Builds a bearer token: the owning hive id, a dot, then 32 CSPRNG bytes
/// hex-encoded.
fn mint_token(hive_id: &str) -> String {
    format!("{hive_id}.{}", hex::encode(rand::random::<[u8; 32]>()))
}

/// Recovers the owning hive id from a bearer token. Splits at the last dot
/// so hive ids may themselves contain dots; `None` means the token cannot
/// be ours.
pub fn token_hive_id(token: &str) -> Option<&str> {
    token.rsplit_once('.').map(|(hive, _)| hive)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(protocol::SESSION_TTL_MS)
    }

    #[test]
    fn create_then_validate_round_trips() {
        let mut sessions = store();
        let (token, session) = sessions.create("agent-1", "PubKey", "h1");

        assert!(token.starts_with("h1."));
        assert_eq!(session.hive_id, "h1");

        let found = sessions.validate(&token).unwrap();
        assert_eq!(found.agent_id, "agent-1");
        assert_eq!(found.pubkey, "PubKey");

        // Validation is not consumption.
        assert!(sessions.validate(&token).is_some());
    }

    #[test]
    fn unknown_token_is_rejected() {
        let mut sessions = store();
        assert!(sessions.validate("h1.deadbeef").is_none());
    }

    #[test]
    fn expired_session_is_evicted_on_read() {
        let mut sessions = store();
        sessions.sessions.insert(
            "h1.stale".to_string(),
            Session {
                agent_id: "a".to_string(),
                pubkey: "k".to_string(),
                hive_id: "h1".to_string(),
                expires_at: protocol::now_ms() - 1,
            },
        );

        assert!(sessions.validate("h1.stale").is_none());
        assert!(sessions.is_empty());
    }

    #[test]
    fn tokens_are_unguessable_length_and_unique() {
        let mut sessions = store();
        let (a, _) = sessions.create("agent-1", "k", "h1");
        let (b, _) = sessions.create("agent-1", "k", "h1");
        assert_ne!(a, b);
        assert_eq!(a.len(), "h1.".len() + 64);
        assert_eq!(sessions.len(), 2);
    }

    #[test]
    fn token_hive_id_honors_last_dot() {
        assert_eq!(token_hive_id("h1.abcdef"), Some("h1"));
        assert_eq!(token_hive_id("team.alpha.abcdef"), Some("team.alpha"));
        assert_eq!(token_hive_id("nodot"), None);
    }
}
