//! Join authentication — consumes a challenge, verifies the canonical
//! signed payload plus the optional device proof, and admits the agent.
//!
//! The checks run in a fixed order and every one is a hard precondition:
//!
//! 1. the nonce names a stored challenge;
//! 2. agent id, pubkey, hive id, and expiry all match the stored challenge;
//! 3. the challenge has not expired (an expired one is deleted on sight);
//! 4. the caller's timestamp parses and sits within the clock-skew window;
//! 5. the device proof, when required or partially supplied, is complete,
//!    fresh, and validly signed;
//! 6. the canonical join payload verifies against the challenge's key.
//!
//! A rejected request leaves the challenge stored and usable until its own
//! expiry, with the single exception of step 3. Success consumes it.

use serde::{Deserialize, Serialize};

use apiary_core::error::{ApiaryError, AuthFailure};
use apiary_core::{identity, protocol};

use crate::challenge::{Challenge, ChallengeManager};

/// Everything a caller submits to consume a challenge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinRequest {
    pub agent_id: String,
    pub pubkey: String,
    pub nonce: String,
    pub hive_id: String,
    /// Echo of the challenge's expiry, epoch milliseconds.
    pub expires_at: i64,
    /// Caller-side RFC 3339 timestamp, also part of the signed payload.
    pub timestamp: String,
    /// Base64 detached Ed25519 signature over the canonical join payload.
    pub signature: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_pubkey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_signed_at: Option<String>,
}

/// Tunables for the join checks.
#[derive(Debug, Clone, Copy)]
pub struct AuthPolicy {
    pub max_clock_skew_ms: i64,
    pub device_proof_required: bool,
    pub device_proof_max_age_ms: i64,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            max_clock_skew_ms: protocol::MAX_CLOCK_SKEW_MS,
            device_proof_required: false,
            device_proof_max_age_ms: protocol::DEVICE_PROOF_MAX_AGE_MS,
        }
    }
}

/// Runs the ordered join preconditions against the stored challenge set.
/// On success the consumed challenge is removed and returned; the caller
/// mints the session from it.
pub fn authenticate(
    challenges: &mut ChallengeManager,
    request: &JoinRequest,
    policy: &AuthPolicy,
) -> Result<Challenge, ApiaryError> {
    // 1. The nonce must name a stored challenge.
    let Some(stored) = challenges.get(&request.nonce).cloned() else {
        return Err(AuthFailure::ChallengeNotFound.into());
    };

    // 2. Binding fields must match the stored challenge exactly.
    if stored.agent_id != request.agent_id
        || stored.pubkey != request.pubkey
        || stored.hive_id != request.hive_id
        || stored.expires_at != request.expires_at
    {
        return Err(AuthFailure::BindingMismatch.into());
    }

    // 3. An expired challenge is deleted, not honored.
    let now = protocol::now_ms();
    if stored.is_expired(now) {
        challenges.remove(&request.nonce);
        return Err(AuthFailure::ChallengeExpired.into());
    }

    // 4. The caller's clock must agree with ours within the skew window.
    let Some(ts_ms) = protocol::parse_rfc3339_ms(&request.timestamp) else {
        return Err(AuthFailure::ClockSkew.into());
    };
    if (ts_ms - now).abs() > policy.max_clock_skew_ms {
        return Err(AuthFailure::ClockSkew.into());
    }

    // 5. Device proof.
    verify_device_proof(request, policy, now)?;

    // 6. The canonical payload must carry a valid signature by the
    //    challenge's key, not whatever key the request claims.
    let payload = protocol::join_payload(
        &stored.agent_id,
        &stored.pubkey,
        &stored.nonce,
        &stored.hive_id,
        stored.expires_at,
        &request.timestamp,
    );
    if !identity::verify_signature(payload.as_bytes(), &request.signature, &stored.pubkey) {
        return Err(AuthFailure::InvalidSignature.into());
    }

    // Consumed: this nonce is never valid again.
    challenges.remove(&request.nonce);
    Ok(stored)
}

/// Verifies the optional device proof. Mandatory mode, or the presence of
/// any single device field, demands all four. The signature covers exactly
/// the UTF-8 bytes of the device nonce; `device_signed_at` is checked for
/// freshness on its own.
fn verify_device_proof(
    request: &JoinRequest,
    policy: &AuthPolicy,
    now_ms: i64,
) -> Result<(), ApiaryError> {
    let any_present = request.device_pubkey.is_some()
        || request.device_nonce.is_some()
        || request.device_signature.is_some()
        || request.device_signed_at.is_some();
    if !policy.device_proof_required && !any_present {
        return Ok(());
    }

    let (Some(pubkey), Some(nonce), Some(signature), Some(signed_at)) = (
        request.device_pubkey.as_deref(),
        request.device_nonce.as_deref(),
        request.device_signature.as_deref(),
        request.device_signed_at.as_deref(),
    ) else {
        return Err(AuthFailure::DeviceProof.into());
    };

    let Some(signed_ms) = protocol::parse_rfc3339_ms(signed_at) else {
        return Err(AuthFailure::DeviceProof.into());
    };
    if (now_ms - signed_ms).abs() > policy.device_proof_max_age_ms {
        return Err(AuthFailure::DeviceProof.into());
    }

    if !identity::verify_signature(nonce.as_bytes(), signature, pubkey) {
        return Err(AuthFailure::DeviceProof.into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
