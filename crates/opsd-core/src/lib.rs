//! # opsd-core
//!
//! Core library for opsd - the control-plane backend of an agent-fleet
//! monitoring platform.
//!
//! This crate provides the building blocks the daemon assembles into the
//! ingest, presence, identity and dispatch pipelines:
//!
//! - **Wire records**: msgpack-encoded heartbeat, event, inventory and
//!   action shapes published by agents
//! - **Identity**: bootstrap-token generation and validation, per-agent
//!   NKey issuance, enrollment signature verification, NATS user JWTs
//! - **Presence**: the short-TTL "last seen" cache interface and key layout
//! - **Batching**: adaptive pull-consumer batch sizing
//! - **Event hub**: in-process per-organization conflict fan-out
//!
//! ## Example
//!
//! ```rust
//! use opsd_core::batch::BatchSizer;
//!
//! let mut sizer = BatchSizer::new(64, 8, 512);
//! sizer.record(64);
//! assert_eq!(sizer.size(), 64);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod batch;
pub mod error;
pub mod hub;
pub mod identity;
pub mod model;
pub mod presence;
pub mod wire;

/// Re-export commonly used types at the crate root.
pub use error::{RpcError, TokenError};
pub use hub::ConflictHub;
pub use model::{Agent, AgentConflict, AgentStatus, ConflictResolution, Incident};
pub use presence::PresenceCache;
