//! End-to-end identity flow: bootstrap token, signed enrollment proof,
//! credential JWT and the rendered credentials file.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use base64::Engine;
use chrono::{Duration, Utc};
use secrecy::SecretString;

use opsd_core::error::TokenError;
use opsd_core::identity::bootstrap::{
    generate_token, index_prefix, timestamp_fresh, validate_token, INDEX_PREFIX_LEN,
};
use opsd_core::identity::jwt::{render_creds_file, JwtIssuer};
use opsd_core::identity::nkey::{generate_user_key, verify_enrollment_signature};
use opsd_core::model::BootstrapToken;

fn token_row(generated: &opsd_core::identity::GeneratedToken) -> BootstrapToken {
    BootstrapToken {
        id: uuid::Uuid::new_v4(),
        org_id: uuid::Uuid::new_v4(),
        token_prefix: generated.prefix.clone(),
        token_hash: generated.hash.clone(),
        description: Some("staging fleet".to_string()),
        tags: vec!["staging".to_string()],
        allowed_cidrs: vec!["10.0.0.0/8".to_string()],
        expires_at: Some(Utc::now() + Duration::hours(1)),
        max_uses: Some(5),
        use_count: 0,
        created_by: None,
        created_at: Utc::now(),
        last_used_at: None,
        revoked_at: None,
    }
}

#[test]
fn enrollment_identity_chain() {
    // Operator mints a bootstrap token; the agent presents it from an
    // allowed address.
    let generated = generate_token().unwrap();
    let row = token_row(&generated);

    assert_eq!(
        index_prefix(&generated.token),
        Some(&generated.token[..INDEX_PREFIX_LEN])
    );
    assert_eq!(
        validate_token(&generated.token, &row, "10.20.30.40", Utc::now()),
        Ok(())
    );
    assert_eq!(
        validate_token(&generated.token, &row, "203.0.113.9", Utc::now()),
        Err(TokenError::IpNotAllowed)
    );

    // The agent proves possession of its freshly generated key.
    let key = generate_user_key().unwrap();
    let pair = nkeys::KeyPair::from_seed(&key.seed).unwrap();
    let timestamp = Utc::now().timestamp_millis();
    let signed = format!("2b7e151628aed2a6:{timestamp}");
    let signature = BASE64.encode(pair.sign(signed.as_bytes()).unwrap());

    assert!(timestamp_fresh(timestamp, Utc::now()));
    assert!(verify_enrollment_signature(
        &key.public_key,
        "2b7e151628aed2a6",
        timestamp,
        &signature,
    ));

    // The backend issues a credential JWT scoped to the agent's subjects.
    let account = nkeys::KeyPair::new_account();
    let issuer = JwtIssuer::new(
        &SecretString::from(account.seed().unwrap()),
        &account.public_key(),
    )
    .unwrap();

    let (jwt, expires_at) = issuer
        .issue_agent_jwt("a1b2c3d4e5f6", &key.public_key, Duration::days(365))
        .unwrap();
    assert!(expires_at > Utc::now() + Duration::days(364));

    let claims: serde_json::Value =
        serde_json::from_slice(&B64URL.decode(jwt.split('.').nth(1).unwrap()).unwrap()).unwrap();
    assert_eq!(claims["sub"], key.public_key);
    assert_eq!(claims["nats"]["issuer_account"], account.public_key());

    // The credentials file hands both halves to the agent exactly once.
    let creds = render_creds_file(&jwt, &key.seed);
    assert!(creds.contains(&jwt));
    assert!(creds.contains(&key.seed));
    assert!(creds.contains("-----BEGIN NATS USER JWT-----"));
    assert!(creds.contains("-----END USER NKEY SEED-----"));
}

#[test]
fn reenrollment_with_rotated_key_is_distinguishable() {
    // A second key pair for the same agent id produces a different public
    // key, which is what the pinned-key continuity check compares.
    let first = generate_user_key().unwrap();
    let second = generate_user_key().unwrap();
    assert_ne!(first.public_key, second.public_key);

    // A signature from the second key never verifies against the first.
    let pair = nkeys::KeyPair::from_seed(&second.seed).unwrap();
    let timestamp = Utc::now().timestamp_millis();
    let signed = format!("nonce:{timestamp}");
    let signature = BASE64.encode(pair.sign(signed.as_bytes()).unwrap());

    assert!(!verify_enrollment_signature(
        &first.public_key,
        "nonce",
        timestamp,
        &signature,
    ));
}
