//! Challenge issuance — short-lived, single-use join nonces.
//!
//! A challenge binds an agent identity to a hive for one join attempt.
//! Consumption and expiry both end a nonce's life for good: once removed it
//! is never revalidated.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use apiary_core::error::ApiaryError;
use apiary_core::{identity, protocol};

/// A single-use nonce binding an agent + hive pair until `expires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub agent_id: String,
    pub pubkey: String,
    pub nonce: String,
    pub hive_id: String,
    /// Epoch milliseconds.
    pub expires_at: i64,
}

impl Challenge {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at < now_ms
    }
}

/// In-memory challenge table for one hive, keyed by nonce.
pub struct ChallengeManager {
    challenges: HashMap<String, Challenge>,
    ttl_ms: i64,
}

impl ChallengeManager {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            challenges: HashMap::new(),
            ttl_ms,
        }
    }

    /// Issues a fresh challenge for the identity. Rejects a public key that
    /// is not well-formed before anything is stored. Expired challenges are
    /// opportunistically evicted on every issue to bound table growth.
    pub fn issue(
        &mut self,
        agent_id: &str,
        pubkey: &str,
        hive_id: &str,
    ) -> Result<Challenge, ApiaryError> {
        if !identity::is_valid_public_key(pubkey) {
            return Err(ApiaryError::validation(
                "pubkey is not a valid base58 Ed25519 public key",
            ));
        }

        self.evict_expired();

        let nonce = hex::encode(rand::random::<[u8; 32]>());
        let challenge = Challenge {
            agent_id: agent_id.to_string(),
            pubkey: pubkey.to_string(),
            nonce: nonce.clone(),
            hive_id: hive_id.to_string(),
            expires_at: protocol::now_ms() + self.ttl_ms,
        };
        // A colliding nonce silently overwrites the older challenge.
        self.challenges.insert(nonce, challenge.clone());
        Ok(challenge)
    }

    /// Looks up a stored challenge without consuming it.
    pub fn get(&self, nonce: &str) -> Option<&Challenge> {
        self.challenges.get(nonce)
    }

    /// Removes and returns a stored challenge.
    pub fn remove(&mut self, nonce: &str) -> Option<Challenge> {
        self.challenges.remove(nonce)
    }

    /// Drops every challenge already past expiry. Returns how many went.
    pub fn evict_expired(&mut self) -> usize {
        let now = protocol::now_ms();
        let before = self.challenges.len();
        self.challenges.retain(|_, c| !c.is_expired(now));
        let evicted = before - self.challenges.len();
        if evicted > 0 {
            debug!("evicted {evicted} expired challenges");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use apiary_core::AgentKeypair;

    fn manager() -> ChallengeManager {
        ChallengeManager::new(protocol::CHALLENGE_TTL_MS)
    }

    #[test]
    fn issue_stores_a_fresh_challenge() {
        let mut mgr = manager();
        let kp = AgentKeypair::generate();
        let challenge = mgr.issue("agent-1", &kp.public_key_b58(), "h1").unwrap();

        assert_eq!(mgr.len(), 1);
        assert_eq!(challenge.agent_id, "agent-1");
        assert_eq!(challenge.hive_id, "h1");
        assert_eq!(challenge.nonce.len(), 64);
        assert!(!challenge.is_expired(protocol::now_ms()));

        let window = challenge.expires_at - protocol::now_ms();
        assert!(window > protocol::CHALLENGE_TTL_MS - 5000);
        assert!(window <= protocol::CHALLENGE_TTL_MS);
    }

    #[test]
    fn issue_rejects_malformed_pubkey() {
        let mut mgr = manager();
        let err = mgr.issue("agent-1", "not-a-key", "h1").unwrap_err();
        assert!(matches!(err, ApiaryError::Validation(_)));
        assert!(mgr.is_empty());
    }

    #[test]
    fn nonces_are_unique_across_issues() {
        let mut mgr = manager();
        let kp = AgentKeypair::generate();
        let a = mgr.issue("a", &kp.public_key_b58(), "h1").unwrap();
        let b = mgr.issue("a", &kp.public_key_b58(), "h1").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_eq!(mgr.len(), 2);
    }

    #[test]
    fn remove_consumes_a_challenge() {
        let mut mgr = manager();
        let kp = AgentKeypair::generate();
        let challenge = mgr.issue("a", &kp.public_key_b58(), "h1").unwrap();

        assert!(mgr.remove(&challenge.nonce).is_some());
        assert!(mgr.remove(&challenge.nonce).is_none());
        assert!(mgr.get(&challenge.nonce).is_none());
    }

    #[test]
    fn issue_evicts_expired_challenges() {
        let mut mgr = manager();
        let kp = AgentKeypair::generate();

        // Plant an already-expired challenge directly.
        mgr.challenges.insert(
            "stale".to_string(),
            Challenge {
                agent_id: "old".to_string(),
                pubkey: kp.public_key_b58(),
                nonce: "stale".to_string(),
                hive_id: "h1".to_string(),
                expires_at: protocol::now_ms() - 1000,
            },
        );
        assert_eq!(mgr.len(), 1);

        mgr.issue("new", &kp.public_key_b58(), "h1").unwrap();
        assert_eq!(mgr.len(), 1);
        assert!(mgr.get("stale").is_none());
    }

    #[test]
    fn evict_expired_keeps_live_challenges() {
        let mut mgr = manager();
        let kp = AgentKeypair::generate();
        let live = mgr.issue("a", &kp.public_key_b58(), "h1").unwrap();

        mgr.challenges.insert(
            "stale".to_string(),
            Challenge {
                agent_id: "old".to_string(),
                pubkey: kp.public_key_b58(),
                nonce: "stale".to_string(),
                hive_id: "h1".to_string(),
                expires_at: 1,
            },
        );

        let evicted = mgr.evict_expired();
        assert_eq!(evicted, 1);
        assert!(mgr.get(&live.nonce).is_some());
    }
}
