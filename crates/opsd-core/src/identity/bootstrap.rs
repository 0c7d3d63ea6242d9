//! Bootstrap-token generation and validation.
//!
//! A token is `ops_bt_` followed by 64 hex characters. The literal first
//! 12 characters are stored as an indexed prefix for candidate lookup;
//! prefix equality is necessary but never sufficient - the bcrypt hash
//! comparison is authoritative.

use chrono::{DateTime, TimeZone, Utc};
use ipnet::IpNet;
use rand::RngCore;

use crate::error::TokenError;
use crate::model::BootstrapToken;

/// Fixed secret prefix.
pub const TOKEN_PREFIX: &str = "ops_bt_";

/// Random bytes drawn per token.
pub const TOKEN_LENGTH: usize = 32;

/// Length of the indexed prefix.
pub const INDEX_PREFIX_LEN: usize = 12;

/// Freshness window for enrollment timestamps.
pub const MAX_TIMESTAMP_SKEW: chrono::Duration = chrono::Duration::minutes(5);

/// A freshly generated token. The `token` field is the only copy of the
/// secret that will ever exist; it is returned to the operator once.
#[derive(Debug, Clone)]
pub struct GeneratedToken {
    /// Full secret.
    pub token: String,
    /// First 12 characters, stored for indexed lookup.
    pub prefix: String,
    /// bcrypt hash of the full secret.
    pub hash: String,
}

/// Generate a bootstrap-token secret with its indexed prefix and hash.
///
/// # Errors
///
/// Returns an error if bcrypt hashing fails.
pub fn generate_token() -> Result<GeneratedToken, bcrypt::BcryptError> {
    let mut bytes = [0u8; TOKEN_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut bytes);

    let token = format!("{TOKEN_PREFIX}{}", hex_encode(&bytes));
    let prefix = token[..INDEX_PREFIX_LEN].to_string();
    let hash = bcrypt::hash(&token, bcrypt::DEFAULT_COST)?;

    Ok(GeneratedToken {
        token,
        prefix,
        hash,
    })
}

/// The indexed lookup prefix of a presented secret, when long enough.
#[must_use]
pub fn index_prefix(token: &str) -> Option<&str> {
    if token.len() < INDEX_PREFIX_LEN || !token.is_char_boundary(INDEX_PREFIX_LEN) {
        return None;
    }
    Some(&token[..INDEX_PREFIX_LEN])
}

/// Compare a presented secret against a stored bcrypt hash.
#[must_use]
pub fn verify_token_hash(token: &str, hash: &str) -> bool {
    bcrypt::verify(token, hash).unwrap_or(false)
}

/// Validate a presented secret against a candidate row.
///
/// The hash comparison runs first; a candidate whose hash does not match
/// is reported as [`TokenError::NotFound`] so callers can move on to the
/// next prefix candidate. Revocation, expiry, usage ceiling and the CIDR
/// allow-list are checked in that order.
///
/// # Errors
///
/// Returns the first applicable [`TokenError`].
pub fn validate_token(
    token: &str,
    row: &BootstrapToken,
    remote_ip: &str,
    now: DateTime<Utc>,
) -> Result<(), TokenError> {
    if !verify_token_hash(token, &row.token_hash) {
        return Err(TokenError::NotFound);
    }
    if row.revoked_at.is_some() {
        return Err(TokenError::Revoked);
    }
    if row.expires_at.is_some_and(|at| at < now) {
        return Err(TokenError::Expired);
    }
    if row.max_uses.is_some_and(|max| row.use_count >= max) {
        return Err(TokenError::UsageLimitReached);
    }
    if !row.allowed_cidrs.is_empty() && !ip_allowed(remote_ip, &row.allowed_cidrs) {
        return Err(TokenError::IpNotAllowed);
    }
    Ok(())
}

/// Whether a remote IP falls inside any of the given CIDRs.
///
/// Unparseable CIDR entries are skipped; an unparseable IP never matches.
#[must_use]
pub fn ip_allowed(remote_ip: &str, cidrs: &[String]) -> bool {
    let Ok(ip) = remote_ip.parse::<std::net::IpAddr>() else {
        return false;
    };

    cidrs
        .iter()
        .filter_map(|cidr| cidr.parse::<IpNet>().ok())
        .any(|net| net.contains(&ip))
}

/// Whether a unix-millisecond timestamp lies within the enrollment
/// freshness window, in either direction.
#[must_use]
pub fn timestamp_fresh(timestamp_ms: i64, now: DateTime<Utc>) -> bool {
    let Some(stamp) = Utc.timestamp_millis_opt(timestamp_ms).single() else {
        return false;
    };
    (now - stamp).abs() <= MAX_TIMESTAMP_SKEW
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    // DEFAULT_COST is deliberately slow; tests that only exercise the
    // comparison path hash at the bcrypt floor.
    fn fast_hash(token: &str) -> String {
        bcrypt::hash(token, 4).unwrap()
    }

    fn token_row(token: &str) -> BootstrapToken {
        BootstrapToken {
            id: uuid::Uuid::new_v4(),
            org_id: uuid::Uuid::new_v4(),
            token_prefix: token[..INDEX_PREFIX_LEN].to_string(),
            token_hash: fast_hash(token),
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
        }
    }

    #[test]
    fn test_generated_token_shape() {
        let generated = generate_token().unwrap();

        assert!(generated.token.starts_with(TOKEN_PREFIX));
        assert_eq!(generated.token.len(), TOKEN_PREFIX.len() + TOKEN_LENGTH * 2);
        assert_eq!(generated.prefix, &generated.token[..INDEX_PREFIX_LEN]);
        assert!(verify_token_hash(&generated.token, &generated.hash));
        assert!(!verify_token_hash("ops_bt_wrong", &generated.hash));
    }

    #[test]
    fn test_index_prefix() {
        assert_eq!(index_prefix("ops_bt_abcdef0123"), Some("ops_bt_abcde"));
        assert_eq!(index_prefix("short"), None);
    }

    #[test]
    fn test_validate_accepts_good_token() {
        let token = "ops_bt_0123456789abcdef";
        let row = token_row(token);
        assert_eq!(validate_token(token, &row, "10.0.0.1", Utc::now()), Ok(()));
    }

    #[test]
    fn test_validate_wrong_secret_same_prefix() {
        // Same 12-char prefix, different tail: the hash compare decides.
        let row = token_row("ops_bt_0123456789abcdef");
        assert_eq!(
            validate_token("ops_bt_0123499999999999", &row, "10.0.0.1", Utc::now()),
            Err(TokenError::NotFound)
        );
    }

    #[test]
    fn test_validate_revoked() {
        let token = "ops_bt_0123456789abcdef";
        let mut row = token_row(token);
        row.revoked_at = Some(Utc::now());
        assert_eq!(
            validate_token(token, &row, "10.0.0.1", Utc::now()),
            Err(TokenError::Revoked)
        );
    }

    #[test]
    fn test_validate_expired() {
        let token = "ops_bt_0123456789abcdef";
        let mut row = token_row(token);
        row.expires_at = Some(Utc::now() - Duration::seconds(1));
        assert_eq!(
            validate_token(token, &row, "10.0.0.1", Utc::now()),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn test_validate_usage_limit() {
        let token = "ops_bt_0123456789abcdef";
        let mut row = token_row(token);
        row.max_uses = Some(3);
        row.use_count = 3;
        assert_eq!(
            validate_token(token, &row, "10.0.0.1", Utc::now()),
            Err(TokenError::UsageLimitReached)
        );

        row.use_count = 2;
        assert_eq!(validate_token(token, &row, "10.0.0.1", Utc::now()), Ok(()));
    }

    #[test]
    fn test_validate_cidr_allow_list() {
        let token = "ops_bt_0123456789abcdef";
        let mut row = token_row(token);
        row.allowed_cidrs = vec!["10.0.0.0/8".to_string()];

        assert_eq!(validate_token(token, &row, "10.1.2.3", Utc::now()), Ok(()));
        assert_eq!(
            validate_token(token, &row, "192.168.0.1", Utc::now()),
            Err(TokenError::IpNotAllowed)
        );
    }

    #[test]
    fn test_ip_allowed_edge_cases() {
        let cidrs = vec!["10.0.0.0/8".to_string(), "not-a-cidr".to_string()];
        assert!(ip_allowed("10.255.255.255", &cidrs));
        assert!(!ip_allowed("11.0.0.1", &cidrs));
        assert!(!ip_allowed("not-an-ip", &cidrs));
        assert!(!ip_allowed("10.0.0.1", &[]));
    }

    #[test]
    fn test_timestamp_freshness_boundary() {
        let now = Utc::now();
        let skew_ms = MAX_TIMESTAMP_SKEW.num_milliseconds();

        assert!(timestamp_fresh(now.timestamp_millis(), now));
        assert!(timestamp_fresh(now.timestamp_millis() - skew_ms, now));
        assert!(!timestamp_fresh(now.timestamp_millis() - skew_ms - 1, now));
        // Future skew is rejected symmetrically.
        assert!(!timestamp_fresh(now.timestamp_millis() + skew_ms + 1, now));
        assert!(!timestamp_fresh(0, now));
    }
}
