//! Enrollment orchestrator.
//!
//! Turns a bootstrap token plus a signed enrollment request into an agent
//! row, a credential row and a signed user JWT. The pinned-key check is
//! the identity anchor: once an agent has registered a key, enrollment
//! with any other key is refused until an operator rotates it.

use chrono::{Duration, Utc};
use thiserror::Error;
use tracing::info;

use opsd_core::error::{CredentialError, IdentityError, TokenError};
use opsd_core::identity::bootstrap::timestamp_fresh;
use opsd_core::identity::jwt::JwtIssuer;
use opsd_core::identity::nkey::verify_enrollment_signature;
use opsd_core::model::{AgentStatus, EnrollmentRequest, EnrollmentResponse};

use crate::storage::{AgentUpsert, NewCredential, Storage, StorageError};

/// Enrollment failures, mapped onto status codes by the HTTP collaborator.
#[derive(Debug, Error)]
pub enum EnrollError {
    /// Request-shape or proof-of-possession failure (400/401).
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Bootstrap-token verdict (401).
    #[error(transparent)]
    Token(#[from] TokenError),

    /// The agent id belongs to another organization (403).
    #[error("agent belongs to different organization")]
    WrongOrganization,

    /// The agent id is pinned to a different key (403).
    #[error("agent_id already registered with different key")]
    PinnedKeyMismatch,

    /// JWT issuance failure (500).
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Gateway failure (500).
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Runs the end-to-end enrollment transaction.
pub struct Enroller {
    storage: Storage,
    issuer: JwtIssuer,
    nats_urls: Vec<String>,
    credential_ttl: Duration,
}

impl Enroller {
    /// Assemble an enroller.
    #[must_use]
    pub const fn new(
        storage: Storage,
        issuer: JwtIssuer,
        nats_urls: Vec<String>,
        credential_ttl: Duration,
    ) -> Self {
        Self {
            storage,
            issuer,
            nats_urls,
            credential_ttl,
        }
    }

    /// Enroll an agent.
    ///
    /// Re-enrollment with the same key and a still-valid token succeeds
    /// and leaves the original pinned credential untouched.
    ///
    /// # Errors
    ///
    /// Returns a typed [`EnrollError`] for every rejection path.
    pub async fn enroll(
        &self,
        request: &EnrollmentRequest,
        bootstrap_token: &str,
        remote_ip: &str,
    ) -> Result<EnrollmentResponse, EnrollError> {
        validate_request(request)?;

        if !timestamp_fresh(request.timestamp, Utc::now()) {
            return Err(IdentityError::StaleTimestamp.into());
        }
        if !verify_enrollment_signature(
            &request.public_key,
            &request.nonce,
            request.timestamp,
            &request.signature,
        ) {
            return Err(IdentityError::SignatureInvalid.into());
        }

        let token = self
            .storage
            .validate_bootstrap_token(bootstrap_token, remote_ip)
            .await
            .map_err(|e| match e {
                StorageError::Token(verdict) => EnrollError::Token(verdict),
                other => EnrollError::Storage(other),
            })?;

        if let Some(existing) = self.storage.get_agent_by_agent_id(&request.agent_id).await? {
            if existing.org_id.is_some_and(|org| org != token.org_id) {
                return Err(EnrollError::WrongOrganization);
            }
        }

        let pinned_key = self.storage.get_pinned_public_key(&request.agent_id).await?;
        if pinned_key
            .as_deref()
            .is_some_and(|pinned| pinned != request.public_key)
        {
            return Err(EnrollError::PinnedKeyMismatch);
        }

        let now = Utc::now();
        let agent = self
            .storage
            .upsert_agent(&AgentUpsert {
                agent_id: request.agent_id.clone(),
                org_id: Some(token.org_id),
                name: String::new(),
                hostname: request.hostname.clone(),
                status: AgentStatus::Online,
                tags: Some(token.tags.clone()),
                hardware_fingerprint: Some(request.hardware_fingerprint.clone()),
                enrolled_via: Some(token.id),
                enrolled_at: Some(now),
                enrolled_ip: Some(remote_ip.to_string()),
                last_seen_at: Some(now),
                meta: Some(serde_json::json!({
                    "os": request.os,
                    "arch": request.arch,
                    "agent_version": request.agent_version,
                })),
            })
            .await?;

        self.storage
            .increment_bootstrap_token_usage(token.id)
            .await?;

        let (jwt, expires_at) = self.issuer.issue_agent_jwt(
            &request.agent_id,
            &request.public_key,
            self.credential_ttl,
        )?;

        self.storage
            .create_agent_credential(&NewCredential {
                agent_id: &request.agent_id,
                public_key: &request.public_key,
                // Only the first key an agent ever registers is pinned.
                is_pinned: pinned_key.is_none(),
                fingerprint: &request.hardware_fingerprint,
                remote_ip,
                hostname: &request.hostname,
                expires_at,
            })
            .await?;

        info!(
            agent_id = %request.agent_id,
            org_id = %token.org_id,
            pinned = pinned_key.is_none(),
            "agent enrolled"
        );

        Ok(EnrollmentResponse {
            agent_id: agent.agent_id,
            org_id: token.org_id,
            jwt,
            nats_urls: self.nats_urls.clone(),
            tags: agent.tags,
            expires_at,
        })
    }
}

/// Reject requests with missing fields or a malformed agent id.
fn validate_request(request: &EnrollmentRequest) -> Result<(), IdentityError> {
    if request.agent_id.is_empty() {
        return Err(IdentityError::MissingField("agent_id"));
    }
    if request.public_key.is_empty() {
        return Err(IdentityError::MissingField("public_key"));
    }
    if request.hostname.is_empty() {
        return Err(IdentityError::MissingField("hostname"));
    }
    if request.hardware_fingerprint.is_empty() {
        return Err(IdentityError::MissingField("hardware_fingerprint"));
    }
    if request.nonce.is_empty() {
        return Err(IdentityError::MissingField("nonce"));
    }
    if request.timestamp == 0 {
        return Err(IdentityError::MissingField("timestamp"));
    }
    if request.signature.is_empty() {
        return Err(IdentityError::MissingField("signature"));
    }
    if !valid_agent_id(&request.agent_id) {
        return Err(IdentityError::InvalidAgentId);
    }
    Ok(())
}

/// Agent ids are exactly 12 lowercase hex characters.
fn valid_agent_id(agent_id: &str) -> bool {
    agent_id.len() == 12
        && agent_id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_request() -> EnrollmentRequest {
        EnrollmentRequest {
            agent_id: "a1b2c3d4e5f6".to_string(),
            public_key: "UABCDEF".to_string(),
            hostname: "web-01".to_string(),
            hardware_fingerprint: "fp-1234".to_string(),
            os: "linux".to_string(),
            arch: "amd64".to_string(),
            agent_version: "1.4.0".to_string(),
            nonce: "f2b44c1d".to_string(),
            timestamp: 1_700_000_000_000,
            signature: "c2lnbmF0dXJl".to_string(),
        }
    }

    #[test]
    fn test_complete_request_validates() {
        assert!(validate_request(&complete_request()).is_ok());
    }

    #[test]
    fn test_missing_fields_are_named() {
        let mut request = complete_request();
        request.public_key = String::new();
        assert_eq!(
            validate_request(&request),
            Err(IdentityError::MissingField("public_key"))
        );

        let mut request = complete_request();
        request.timestamp = 0;
        assert_eq!(
            validate_request(&request),
            Err(IdentityError::MissingField("timestamp"))
        );
    }

    #[test]
    fn test_agent_id_format() {
        assert!(valid_agent_id("a1b2c3d4e5f6"));
        assert!(valid_agent_id("000000000000"));
        assert!(!valid_agent_id("a1b2c3d4e5f"));
        assert!(!valid_agent_id("a1b2c3d4e5f67"));
        assert!(!valid_agent_id("A1B2C3D4E5F6"));
        assert!(!valid_agent_id("g1b2c3d4e5f6"));

        let mut request = complete_request();
        request.agent_id = "not-hex-here".to_string();
        assert_eq!(
            validate_request(&request),
            Err(IdentityError::InvalidAgentId)
        );
    }
}
