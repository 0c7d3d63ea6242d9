//! Shared error taxonomy.
//!
//! Typed errors cross the component boundaries described in the design:
//! consumers recover locally, watchers log and continue, while enrollment,
//! RPC and conflict resolution propagate these variants to the HTTP
//! collaborator which maps them onto status codes.

use thiserror::Error;

/// Bootstrap-token validation failures.
///
/// Each variant is a terminal verdict: the caller must not retry with the
/// same token without operator intervention.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    /// No token row matches the presented secret.
    #[error("bootstrap token not found")]
    NotFound,

    /// The token has been revoked by an operator.
    #[error("bootstrap token revoked")]
    Revoked,

    /// The token's expiry time has passed.
    #[error("bootstrap token expired")]
    Expired,

    /// The token's usage counter reached its configured maximum.
    #[error("bootstrap token usage limit reached")]
    UsageLimitReached,

    /// The caller's remote IP is outside the token's allowed CIDRs.
    #[error("bootstrap token ip not allowed")]
    IpNotAllowed,
}

/// Enrollment proof-of-possession failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// A required request field is absent or empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// The agent id is not 12 lowercase hex characters.
    #[error("invalid agent_id")]
    InvalidAgentId,

    /// The signature over `"{nonce}:{timestamp}"` did not verify.
    #[error("invalid signature")]
    SignatureInvalid,

    /// The request timestamp is outside the freshness window.
    #[error("timestamp expired")]
    StaleTimestamp,
}

/// Request-reply dispatch failures, mapped from the transport.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Nothing is subscribed on the agent's RPC subject.
    #[error("agent is offline")]
    AgentOffline,

    /// The agent did not answer within the wait deadline.
    #[error("request timed out")]
    Timeout,

    /// The request payload could not be encoded.
    #[error("encode request: {0}")]
    Encode(String),

    /// The response payload could not be decoded.
    #[error("decode response: {0}")]
    Decode(String),

    /// Any other bus-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Presence-cache access failure.
///
/// Cache unavailability is non-fatal to ingest; callers degrade presence
/// freshness and keep going.
#[derive(Debug, Error)]
#[error("cache error: {0}")]
pub struct CacheError(pub String);

/// NKey / JWT issuance failures.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The configured signing-key seed could not be parsed.
    #[error("invalid NATS signing key seed: {0}")]
    InvalidSigningSeed(String),

    /// The agents account public key is missing from configuration.
    #[error("missing NATS agents account public key")]
    MissingAccountKey,

    /// The agent-presented public key is not a valid user NKey.
    #[error("invalid agent public key")]
    InvalidUserKey,

    /// Key generation failed.
    #[error("generate key pair: {0}")]
    Generate(String),

    /// Claim serialization or signing failed.
    #[error("encode jwt: {0}")]
    Encode(String),
}
