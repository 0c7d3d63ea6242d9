//! Per-agent NKey pairs and enrollment signature verification.
//!
//! Agents hold user-type Ed25519 NKeys (public keys prefixed `U`). At
//! enrollment the agent signs the byte string `"{nonce}:{timestamp}"` with
//! its private key; the server verifies against the presented public key.
//! Replay protection comes from the freshness window plus the pinned-key
//! continuity check, not from nonce tracking.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use nkeys::KeyPair;

use crate::error::CredentialError;

/// A freshly generated user key pair.
///
/// The seed is handed to the agent exactly once, inside the credentials
/// file; the server retains only the public key.
#[derive(Debug, Clone)]
pub struct UserKey {
    /// Seed (private key), `SU`-prefixed.
    pub seed: String,
    /// Public key, `U`-prefixed.
    pub public_key: String,
}

/// Generate a user-type NKey pair.
///
/// # Errors
///
/// Returns an error if the seed cannot be extracted from the pair.
pub fn generate_user_key() -> Result<UserKey, CredentialError> {
    let pair = KeyPair::new_user();
    let seed = pair
        .seed()
        .map_err(|e| CredentialError::Generate(e.to_string()))?;

    Ok(UserKey {
        seed,
        public_key: pair.public_key(),
    })
}

/// Whether a string is a valid user-type public NKey.
#[must_use]
pub fn is_valid_user_key(public_key: &str) -> bool {
    public_key.starts_with('U') && KeyPair::from_public_key(public_key).is_ok()
}

/// Verify an enrollment signature over `"{nonce}:{timestamp}"`.
///
/// Any missing field, decode failure or mismatch yields `false`.
#[must_use]
pub fn verify_enrollment_signature(
    public_key: &str,
    nonce: &str,
    timestamp_ms: i64,
    signature_b64: &str,
) -> bool {
    if public_key.is_empty() || nonce.is_empty() || signature_b64.is_empty() || timestamp_ms == 0 {
        return false;
    }

    let Ok(pair) = KeyPair::from_public_key(public_key) else {
        return false;
    };
    let Ok(signature) = BASE64.decode(signature_b64) else {
        return false;
    };

    let signed = format!("{nonce}:{timestamp_ms}");
    pair.verify(signed.as_bytes(), &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_shape() {
        let key = generate_user_key().unwrap();
        assert!(key.public_key.starts_with('U'));
        assert!(key.seed.starts_with("SU"));
        assert!(is_valid_user_key(&key.public_key));
    }

    #[test]
    fn test_signature_round_trip() {
        let pair = KeyPair::new_user();
        let nonce = "f2b44c1d";
        let timestamp = 1_700_000_000_000_i64;

        let signed = format!("{nonce}:{timestamp}");
        let signature = BASE64.encode(pair.sign(signed.as_bytes()).unwrap());

        assert!(verify_enrollment_signature(
            &pair.public_key(),
            nonce,
            timestamp,
            &signature,
        ));
    }

    #[test]
    fn test_signature_rejects_tampered_payload() {
        let pair = KeyPair::new_user();
        let signed = "nonce:1700000000000";
        let signature = BASE64.encode(pair.sign(signed.as_bytes()).unwrap());

        // Different timestamp than what was signed.
        assert!(!verify_enrollment_signature(
            &pair.public_key(),
            "nonce",
            1_700_000_000_001,
            &signature,
        ));
    }

    #[test]
    fn test_signature_rejects_wrong_key() {
        let signer = KeyPair::new_user();
        let other = KeyPair::new_user();
        let signed = "nonce:1700000000000";
        let signature = BASE64.encode(signer.sign(signed.as_bytes()).unwrap());

        assert!(!verify_enrollment_signature(
            &other.public_key(),
            "nonce",
            1_700_000_000_000,
            &signature,
        ));
    }

    #[test]
    fn test_signature_rejects_missing_fields() {
        let pair = KeyPair::new_user();
        assert!(!verify_enrollment_signature("", "nonce", 1, "c2ln"));
        assert!(!verify_enrollment_signature(&pair.public_key(), "", 1, "c2ln"));
        assert!(!verify_enrollment_signature(&pair.public_key(), "nonce", 0, "c2ln"));
        assert!(!verify_enrollment_signature(&pair.public_key(), "nonce", 1, ""));
        assert!(!verify_enrollment_signature(
            &pair.public_key(),
            "nonce",
            1,
            "not base64!!",
        ));
    }
}
