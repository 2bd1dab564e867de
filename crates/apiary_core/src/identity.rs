//! Agent identity — Ed25519 key handling and signature verification.
//!
//! Public keys travel base58-encoded, signatures base64-encoded. All
//! verification entry points return `bool` and never panic or error on
//! attacker-controlled input: a malformed key, a short signature, or a
//! non-decodable string is simply an invalid signature.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// Byte length of an Ed25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Byte length of a detached Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Decodes a base58 public key into a verifying key. `None` for anything
/// that is not exactly 32 bytes of valid curve point.
pub fn decode_public_key(pubkey_b58: &str) -> Option<VerifyingKey> {
    let bytes = bs58::decode(pubkey_b58).into_vec().ok()?;
    let arr = <[u8; PUBLIC_KEY_LEN]>::try_from(bytes).ok()?;
    VerifyingKey::from_bytes(&arr).ok()
}

/// Checks that a string is base58-decodable to exactly the public key
/// length. Used to reject malformed identities before a challenge is ever
/// issued; full point validation happens at verification time.
pub fn is_valid_public_key(pubkey_b58: &str) -> bool {
    match bs58::decode(pubkey_b58).into_vec() {
        Ok(bytes) => bytes.len() == PUBLIC_KEY_LEN,
        Err(_) => false,
    }
}

/// Verifies a base64 detached signature over `message` against a base58
/// public key. Any decode failure or length mismatch returns `false`.
pub fn verify_signature(message: &[u8], signature_b64: &str, pubkey_b58: &str) -> bool {
    let Some(key) = decode_public_key(pubkey_b58) else {
        return false;
    };
    let Ok(sig_bytes) = BASE64.decode(signature_b64) else {
        return false;
    };
    let Ok(sig_arr) = <[u8; SIGNATURE_LEN]>::try_from(sig_bytes) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_arr);
    key.verify(message, &signature).is_ok()
}

// ---------------------------------------------------------------------------
// Keypair
// ---------------------------------------------------------------------------

/// An in-memory Ed25519 keypair producing wire-format keys and signatures.
///
/// Key-file storage belongs to the wallet tooling, not this crate; this type
/// exists for embedders and tests that need a signing side.
pub struct AgentKeypair {
    signing: SigningKey,
}

impl AgentKeypair {
    /// Generates a fresh keypair from OS randomness.
    pub fn generate() -> Self {
        let secret: [u8; 32] = rand::random();
        Self {
            signing: SigningKey::from_bytes(&secret),
        }
    }

    /// Rebuilds a keypair from raw secret bytes.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    /// The public half, base58-encoded for the wire.
    pub fn public_key_b58(&self) -> String {
        bs58::encode(self.signing.verifying_key().as_bytes()).into_string()
    }

    /// Signs `message`, returning the base64-encoded detached signature.
    pub fn sign_b64(&self, message: &[u8]) -> String {
        BASE64.encode(self.signing.sign(message).to_bytes())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_public_key_is_valid() {
        let kp = AgentKeypair::generate();
        assert!(is_valid_public_key(&kp.public_key_b58()));
    }

    #[test]
    fn invalid_public_keys_are_rejected() {
        assert!(!is_valid_public_key(""));
        assert!(!is_valid_public_key("not base58 0OIl"));
        // Valid base58 but wrong decoded length.
        assert!(!is_valid_public_key("3mJr7AoUXx2Wqd"));
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let kp = AgentKeypair::generate();
        let msg = b"1.0\nagent-1\nkey\nnonce\nh1";
        let sig = kp.sign_b64(msg);
        assert!(verify_signature(msg, &sig, &kp.public_key_b58()));
    }

    #[test]
    fn tampered_message_fails_verification() {
        let kp = AgentKeypair::generate();
        let sig = kp.sign_b64(b"original");
        assert!(!verify_signature(b"tampered", &sig, &kp.public_key_b58()));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let kp = AgentKeypair::generate();
        let other = AgentKeypair::generate();
        let sig = kp.sign_b64(b"hello");
        assert!(!verify_signature(b"hello", &sig, &other.public_key_b58()));
    }

    #[test]
    fn malformed_inputs_never_panic() {
        let kp = AgentKeypair::generate();
        let pk = kp.public_key_b58();
        // Bad base64.
        assert!(!verify_signature(b"m", "!!!not-base64!!!", &pk));
        // Valid base64, wrong signature length.
        assert!(!verify_signature(b"m", &BASE64.encode([0u8; 10]), &pk));
        // Garbage key with a real signature.
        let sig = kp.sign_b64(b"m");
        assert!(!verify_signature(b"m", &sig, "zzzz"));
        // Everything empty.
        assert!(!verify_signature(b"", "", ""));
    }

    #[test]
    fn keypair_is_deterministic_from_secret() {
        let secret = [7u8; 32];
        let a = AgentKeypair::from_secret_bytes(&secret);
        let b = AgentKeypair::from_secret_bytes(&secret);
        assert_eq!(a.public_key_b58(), b.public_key_b58());
        assert_eq!(a.sign_b64(b"x"), b.sign_b64(b"x"));
    }
}
