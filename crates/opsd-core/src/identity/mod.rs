//! Agent identity: bootstrap tokens, NKey proof-of-possession and NATS
//! user JWT issuance.
//!
//! Enrollment chains the three: a bootstrap token authorizes the request,
//! the NKey signature proves possession of the presented key, and the
//! issued JWT grants the agent its per-subject bus permissions.

pub mod bootstrap;
pub mod jwt;
pub mod nkey;

pub use bootstrap::{generate_token, validate_token, verify_token_hash, GeneratedToken};
pub use jwt::{render_creds_file, JwtIssuer};
pub use nkey::{generate_user_key, verify_enrollment_signature, UserKey};
