//! Domain entities persisted by the gateway and exchanged with collaborators.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Agent presence state as tracked by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Enrolled but never seen on the bus.
    Pending,
    /// A heartbeat was observed within the presence TTL.
    Online,
    /// Presence evidence is absent or the agent disconnected.
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            _ => Err(format!("unknown agent status: {s}")),
        }
    }
}

/// A managed host's agent record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Row id.
    pub id: Uuid,
    /// 12-char lowercase hex identifier chosen by the agent.
    pub agent_id: String,
    /// Owning organization, absent until enrollment assigns one.
    pub org_id: Option<Uuid>,
    /// Display name.
    pub name: String,
    /// Reported hostname.
    pub hostname: String,
    /// Presence state.
    pub status: AgentStatus,
    /// Tags inherited from the bootstrap token.
    pub tags: Vec<String>,
    /// Hardware fingerprint captured at enrollment.
    pub hardware_fingerprint: Option<String>,
    /// Bootstrap token that enrolled this agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrolled_via: Option<Uuid>,
    /// Enrollment time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrolled_at: Option<DateTime<Utc>>,
    /// Remote IP observed at enrollment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrolled_ip: Option<String>,
    /// Last presence evidence.
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Opaque agent metadata (os, arch, agent version, discovery extras).
    pub meta: serde_json::Value,
}

/// A persisted record of an agent-reported alert event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    /// Monotone integer id.
    pub id: i64,
    /// Reporting agent.
    pub agent_id: String,
    /// Alert type as reported.
    #[serde(rename = "type")]
    pub kind: String,
    /// Originating source (container, service, path or "unknown").
    pub source: String,
    /// Sanitized raw error text (NUL bytes removed).
    pub raw_error: String,
    /// Alert details as reported, decoded lazily by consumers.
    pub context: serde_json::Value,
    /// Analysis text attached by the external analysis pipeline.
    pub ai_analysis: String,
    /// Whether the analysis flagged the incident as critical.
    pub is_critical: bool,
    /// Remediation suggested by the analysis pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<SuggestedAction>,
    /// Lifecycle status: `new`, `analyzed` or `action_sent`.
    pub status: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Remediation proposal attached to an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedAction {
    /// Action name understood by the agent.
    pub cmd: String,
    /// Action arguments.
    pub args: HashMap<String, String>,
    /// Human-readable label.
    pub label: String,
}

/// Tenant boundary for users, tokens and agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    /// Row id.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Unique URL-safe identifier, at most 63 chars.
    pub slug: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Input for organization creation.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrganizationInput {
    /// Display name.
    pub name: String,
    /// Unique slug.
    pub slug: String,
}

/// An operator account, used as the actor for token issuance and
/// conflict resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Row id.
    pub id: Uuid,
    /// Owning organization.
    pub org_id: Uuid,
    /// Unique email.
    pub email: String,
    /// bcrypt hash of the password; never serialized outward.
    #[serde(skip_serializing)]
    #[serde(default)]
    pub password_hash: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A limited-use secret granting the right to enroll agents into an
/// organization.
///
/// The full secret is returned only once, on creation. `token_prefix`
/// holds the literal first 12 characters of the secret for indexed lookup;
/// the bcrypt `token_hash` is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapToken {
    /// Row id.
    pub id: Uuid,
    /// Owning organization.
    pub org_id: Uuid,
    /// First 12 characters of the secret.
    pub token_prefix: String,
    /// bcrypt hash of the full secret; never serialized outward.
    #[serde(skip_serializing)]
    #[serde(default)]
    pub token_hash: String,
    /// Operator description.
    pub description: Option<String>,
    /// Tags copied onto enrolled agents.
    pub tags: Vec<String>,
    /// When non-empty, enrollment is restricted to these CIDRs.
    pub allowed_cidrs: Vec<String>,
    /// Optional expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// Optional usage ceiling.
    pub max_uses: Option<i32>,
    /// Successful enrollments so far.
    pub use_count: i32,
    /// Issuing user.
    pub created_by: Option<Uuid>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last successful use.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Revocation time, when revoked.
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Input for bootstrap-token creation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateBootstrapTokenInput {
    /// Operator description.
    #[serde(default)]
    pub description: Option<String>,
    /// Tags copied onto enrolled agents.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Optional CIDR allow-list.
    #[serde(default)]
    pub allowed_cidrs: Vec<String>,
    /// Optional expiry.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Optional usage ceiling.
    #[serde(default)]
    pub max_uses: Option<i32>,
}

/// A signing key registered by an agent.
///
/// At most one non-revoked credential per agent is pinned; the pinned key
/// anchors identity continuity across re-enrollments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCredential {
    /// Row id.
    pub id: Uuid,
    /// Owning agent.
    pub agent_id: String,
    /// User NKey public key (prefixed `U`).
    pub public_key: String,
    /// Whether this key anchors the agent's identity.
    pub is_pinned: bool,
    /// Hardware fingerprint presented at registration.
    pub fingerprint_at_registration: Option<String>,
    /// Remote IP at registration.
    pub registered_from_ip: Option<String>,
    /// Hostname at registration.
    pub registered_hostname: Option<String>,
    /// Expiry of the issued JWT.
    pub expires_at: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Revocation time, when rotated out.
    pub revoked_at: Option<DateTime<Utc>>,
}

/// A bus connection observed for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConnection {
    /// Row id.
    pub id: Uuid,
    /// Owning agent.
    pub agent_id: String,
    /// Bus client id, when reported.
    pub client_id: Option<String>,
    /// Remote IP of the connection.
    pub remote_ip: String,
    /// Hostname reported at connect.
    pub hostname: Option<String>,
    /// Connect time.
    pub connected_at: DateTime<Utc>,
    /// Disconnect time; `None` while the connection is open.
    pub disconnected_at: Option<DateTime<Utc>>,
    /// Reason recorded at disconnect.
    pub disconnect_reason: Option<String>,
}

/// Resolution state of an agent identity conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Awaiting an operator decision.
    Pending,
    /// The existing connection keeps the identity.
    ExistingWins,
    /// The new connection keeps the identity.
    NewWins,
    /// Both connections were revoked.
    BothDisconnected,
}

impl ConflictResolution {
    /// Translate an operator request value into a stored resolution.
    ///
    /// Accepts `keep_existing`, `keep_new` and `revoke_both`; anything else
    /// is rejected.
    #[must_use]
    pub fn from_request(value: &str) -> Option<Self> {
        match value {
            "keep_existing" => Some(Self::ExistingWins),
            "keep_new" => Some(Self::NewWins),
            "revoke_both" => Some(Self::BothDisconnected),
            _ => None,
        }
    }

    /// The stored string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ExistingWins => "existing_wins",
            Self::NewWins => "new_wins",
            Self::BothDisconnected => "both_disconnected",
        }
    }
}

impl std::str::FromStr for ConflictResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "existing_wins" => Ok(Self::ExistingWins),
            "new_wins" => Ok(Self::NewWins),
            "both_disconnected" => Ok(Self::BothDisconnected),
            _ => Err(format!("unknown resolution: {s}")),
        }
    }
}

/// A detected agent identity/address conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConflict {
    /// Row id.
    pub id: Uuid,
    /// Conflicted agent.
    pub agent_id: String,
    /// Remote IP of the connection already open.
    pub existing_ip: String,
    /// Remote IP of the newly observed connection.
    pub new_ip: String,
    /// Hostname of the connection already open.
    pub existing_hostname: Option<String>,
    /// Hostname of the newly observed connection.
    pub new_hostname: Option<String>,
    /// Current resolution state.
    pub resolution: ConflictResolution,
    /// Resolving user, once resolved.
    pub resolved_by: Option<Uuid>,
    /// Detection time.
    pub created_at: DateTime<Utc>,
    /// Resolution time.
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Enrollment request body as presented by the HTTP collaborator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnrollmentRequest {
    /// 12-char lowercase hex identifier.
    #[serde(default)]
    pub agent_id: String,
    /// User NKey public key (prefixed `U`).
    #[serde(default)]
    pub public_key: String,
    /// Reported hostname.
    #[serde(default)]
    pub hostname: String,
    /// Hardware fingerprint.
    #[serde(default)]
    pub hardware_fingerprint: String,
    /// Operating system name.
    #[serde(default)]
    pub os: String,
    /// Architecture.
    #[serde(default)]
    pub arch: String,
    /// Agent software version.
    #[serde(default)]
    pub agent_version: String,
    /// Opaque freshness nonce chosen by the agent.
    #[serde(default)]
    pub nonce: String,
    /// Unix milliseconds at signing time.
    #[serde(default)]
    pub timestamp: i64,
    /// Base64 signature over `"{nonce}:{timestamp}"`.
    #[serde(default)]
    pub signature: String,
}

/// Enrollment response returned once to the agent.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentResponse {
    /// Enrolled agent id.
    pub agent_id: String,
    /// Owning organization.
    pub org_id: Uuid,
    /// Issued user JWT.
    pub jwt: String,
    /// Bus URLs the agent should connect to.
    pub nats_urls: Vec<String>,
    /// Tags inherited from the bootstrap token.
    pub tags: Vec<String>,
    /// JWT expiry.
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_status_round_trip() {
        for status in [
            AgentStatus::Pending,
            AgentStatus::Online,
            AgentStatus::Offline,
        ] {
            assert_eq!(status.to_string().parse::<AgentStatus>().unwrap(), status);
        }
        assert!("gone".parse::<AgentStatus>().is_err());
    }

    #[test]
    fn test_resolution_request_mapping() {
        assert_eq!(
            ConflictResolution::from_request("keep_existing"),
            Some(ConflictResolution::ExistingWins)
        );
        assert_eq!(
            ConflictResolution::from_request("keep_new"),
            Some(ConflictResolution::NewWins)
        );
        assert_eq!(
            ConflictResolution::from_request("revoke_both"),
            Some(ConflictResolution::BothDisconnected)
        );
        assert_eq!(ConflictResolution::from_request("existing_wins"), None);
        assert_eq!(ConflictResolution::from_request(""), None);
    }

    #[test]
    fn test_token_hash_not_serialized() {
        let token = BootstrapToken {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            token_prefix: "ops_bt_ab12c".to_string(),
            token_hash: "$2b$12$secret".to_string(),
            description: None,
            tags: vec![],
            allowed_cidrs: vec![],
            expires_at: None,
            max_uses: None,
            use_count: 0,
            created_by: None,
            created_at: Utc::now(),
            last_used_at: None,
            revoked_at: None,
        };

        let json = serde_json::to_string(&token).unwrap();
        assert!(!json.contains("token_hash"));
        assert!(json.contains("token_prefix"));
    }
}
