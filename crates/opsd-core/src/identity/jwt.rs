//! NATS user JWT issuance for enrolled agents.
//!
//! Claims follow the NATS JWT v2 layout: an `ed25519-nkey` header, a
//! base32 `jti` over the sha256 of the claims, and a signature by the
//! account signing key over the joined header and body segments. The
//! granted permissions confine the agent to its own subject namespace.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use chrono::{DateTime, Duration, Utc};
use data_encoding::BASE32_NOPAD;
use nkeys::KeyPair;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::CredentialError;
use super::nkey::is_valid_user_key;

/// Default credential validity.
pub const DEFAULT_CREDENTIAL_TTL_DAYS: i64 = 365;

const JWT_HEADER: &str = r#"{"typ":"JWT","alg":"ed25519-nkey"}"#;

#[derive(Serialize)]
struct UserClaims<'a> {
    jti: String,
    iat: i64,
    iss: &'a str,
    sub: &'a str,
    exp: i64,
    nats: NatsUser<'a>,
}

#[derive(Serialize)]
struct NatsUser<'a> {
    #[serde(rename = "pub")]
    publish: Permission,
    #[serde(rename = "sub")]
    subscribe: Permission,
    subs: i64,
    data: i64,
    payload: i64,
    issuer_account: &'a str,
    #[serde(rename = "type")]
    claim_type: &'a str,
    version: u32,
}

#[derive(Serialize)]
struct Permission {
    allow: Vec<String>,
}

/// Issues agent credential JWTs signed by an account signing key.
pub struct JwtIssuer {
    signing_key: KeyPair,
    account_public_key: String,
}

impl JwtIssuer {
    /// Build an issuer from the configured signing-key seed and the agents
    /// account public key.
    ///
    /// # Errors
    ///
    /// Returns an error if the seed does not parse or the account key is
    /// missing.
    pub fn new(
        signing_key_seed: &SecretString,
        account_public_key: &str,
    ) -> Result<Self, CredentialError> {
        let signing_key = KeyPair::from_seed(signing_key_seed.expose_secret())
            .map_err(|e| CredentialError::InvalidSigningSeed(e.to_string()))?;

        if account_public_key.is_empty() {
            return Err(CredentialError::MissingAccountKey);
        }

        Ok(Self {
            signing_key,
            account_public_key: account_public_key.to_string(),
        })
    }

    /// Issue a user JWT for an agent's public key.
    ///
    /// The permission set confines the agent to its own subjects: events
    /// and heartbeat publishing, RPC and inbox subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the public key is not a user key or signing
    /// fails.
    pub fn issue_agent_jwt(
        &self,
        agent_id: &str,
        public_key: &str,
        validity: Duration,
    ) -> Result<(String, DateTime<Utc>), CredentialError> {
        if !is_valid_user_key(public_key) {
            return Err(CredentialError::InvalidUserKey);
        }

        let now = Utc::now();
        let expires_at = now + validity;
        let issuer_key = self.signing_key.public_key();

        let mut claims = UserClaims {
            jti: String::new(),
            iat: now.timestamp(),
            iss: &issuer_key,
            sub: public_key,
            exp: expires_at.timestamp(),
            nats: NatsUser {
                publish: Permission {
                    allow: vec![
                        format!("ops.{agent_id}.events.>"),
                        format!("$KV.AGENTS.{agent_id}"),
                        "$JS.API.STREAM.INFO.KV_AGENTS".to_string(),
                        format!("ops.{agent_id}.>"),
                    ],
                },
                subscribe: Permission {
                    allow: vec![
                        format!("ops.{agent_id}.rpc"),
                        format!("ops.{agent_id}.>"),
                        "_INBOX.>".to_string(),
                    ],
                },
                subs: -1,
                data: -1,
                payload: -1,
                issuer_account: &self.account_public_key,
                claim_type: "user",
                version: 2,
            },
        };

        // The jti is the base32 sha256 of the claims serialized with an
        // empty jti, then the claims are re-serialized with it set.
        let unhashed =
            serde_json::to_vec(&claims).map_err(|e| CredentialError::Encode(e.to_string()))?;
        claims.jti = BASE32_NOPAD.encode(&Sha256::digest(&unhashed));

        let body =
            serde_json::to_vec(&claims).map_err(|e| CredentialError::Encode(e.to_string()))?;
        let signing_input = format!(
            "{}.{}",
            B64URL.encode(JWT_HEADER.as_bytes()),
            B64URL.encode(&body)
        );
        let signature = self
            .signing_key
            .sign(signing_input.as_bytes())
            .map_err(|e| CredentialError::Encode(e.to_string()))?;

        let token = format!("{signing_input}.{}", B64URL.encode(&signature));
        Ok((token, expires_at))
    }
}

impl std::fmt::Debug for JwtIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtIssuer")
            .field("account_public_key", &self.account_public_key)
            .finish_non_exhaustive()
    }
}

/// Render the credentials file returned once at enrollment.
///
/// This is the standard NATS `.creds` layout holding the JWT and the NKey
/// seed in a single file.
#[must_use]
pub fn render_creds_file(jwt: &str, nkey_seed: &str) -> String {
    format!(
        "-----BEGIN NATS USER JWT-----\n{jwt}\n-----END NATS USER JWT-----\n\n\
         -----BEGIN USER NKEY SEED-----\n{nkey_seed}\n-----END USER NKEY SEED-----\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::nkey::generate_user_key;

    fn test_issuer() -> (JwtIssuer, String) {
        let account = KeyPair::new_account();
        let seed = SecretString::from(account.seed().unwrap());
        let account_public = account.public_key();
        (
            JwtIssuer::new(&seed, &account_public).unwrap(),
            account_public,
        )
    }

    fn decode_claims(token: &str) -> serde_json::Value {
        let body = token.split('.').nth(1).unwrap();
        serde_json::from_slice(&B64URL.decode(body).unwrap()).unwrap()
    }

    #[test]
    fn test_issuer_rejects_bad_configuration() {
        let seed = SecretString::from("not-a-seed".to_string());
        assert!(matches!(
            JwtIssuer::new(&seed, "ABCDEF"),
            Err(CredentialError::InvalidSigningSeed(_))
        ));

        let account = KeyPair::new_account();
        let seed = SecretString::from(account.seed().unwrap());
        assert!(matches!(
            JwtIssuer::new(&seed, ""),
            Err(CredentialError::MissingAccountKey)
        ));
    }

    #[test]
    fn test_issued_jwt_shape() {
        let (issuer, account_public) = test_issuer();
        let key = generate_user_key().unwrap();

        let (token, expires_at) = issuer
            .issue_agent_jwt("abc123456789", &key.public_key, Duration::days(365))
            .unwrap();

        assert_eq!(token.split('.').count(), 3);

        let claims = decode_claims(&token);
        assert_eq!(claims["sub"], key.public_key);
        assert_eq!(claims["nats"]["issuer_account"], account_public);
        assert_eq!(claims["nats"]["type"], "user");
        assert_eq!(claims["nats"]["version"], 2);
        assert!(!claims["jti"].as_str().unwrap().is_empty());
        assert_eq!(claims["exp"].as_i64().unwrap(), expires_at.timestamp());
    }

    #[test]
    fn test_issued_jwt_permissions_are_agent_scoped() {
        let (issuer, _) = test_issuer();
        let key = generate_user_key().unwrap();

        let (token, _) = issuer
            .issue_agent_jwt("a1b2c3d4e5f6", &key.public_key, Duration::days(1))
            .unwrap();
        let claims = decode_claims(&token);

        let publish: Vec<&str> = claims["nats"]["pub"]["allow"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert!(publish.contains(&"ops.a1b2c3d4e5f6.events.>"));
        assert!(publish.contains(&"$KV.AGENTS.a1b2c3d4e5f6"));
        assert!(publish.contains(&"$JS.API.STREAM.INFO.KV_AGENTS"));

        let subscribe: Vec<&str> = claims["nats"]["sub"]["allow"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert!(subscribe.contains(&"ops.a1b2c3d4e5f6.rpc"));
        assert!(subscribe.contains(&"_INBOX.>"));
    }

    #[test]
    fn test_issue_rejects_non_user_key() {
        let (issuer, _) = test_issuer();
        let account = KeyPair::new_account();

        assert!(matches!(
            issuer.issue_agent_jwt("abc123456789", &account.public_key(), Duration::days(1)),
            Err(CredentialError::InvalidUserKey)
        ));
    }

    #[test]
    fn test_signature_verifies_with_signing_key() {
        let (issuer, _) = test_issuer();
        let key = generate_user_key().unwrap();

        let (token, _) = issuer
            .issue_agent_jwt("abc123456789", &key.public_key, Duration::days(1))
            .unwrap();

        let mut parts = token.rsplitn(2, '.');
        let signature = B64URL.decode(parts.next().unwrap()).unwrap();
        let signing_input = parts.next().unwrap();

        let claims = decode_claims(&token);
        let issuer_key = KeyPair::from_public_key(claims["iss"].as_str().unwrap()).unwrap();
        assert!(issuer_key
            .verify(signing_input.as_bytes(), &signature)
            .is_ok());
    }

    #[test]
    fn test_creds_file_markers() {
        let creds = render_creds_file("eyJ0.header.sig", "SUAexample");
        assert!(creds.contains("-----BEGIN NATS USER JWT-----"));
        assert!(creds.contains("eyJ0.header.sig"));
        assert!(creds.contains("-----BEGIN USER NKEY SEED-----"));
        assert!(creds.contains("SUAexample"));
    }
}
