//! Apiary Hive — per-hive state and the actors that own it.
//!
//! A hive is a named coordination room: agents prove an Ed25519 identity
//! through a challenge/join exchange, hold a session token, and append to
//! the hive's ordered message log. Everything one hive owns — challenges,
//! sessions, the log, gossip cursors — lives inside a single actor task,
//! which is the entire concurrency story: per-hive operations serialize on
//! the actor's channel, and different hives never contend.

pub mod actor;
pub mod auth;
pub mod challenge;
pub mod message;
pub mod session;
pub mod store;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use actor::{HiveHandle, HiveRegistry, HiveSettings, JoinGrant, StoreBacking};
pub use auth::{AuthPolicy, JoinRequest};
pub use challenge::Challenge;
pub use message::{HiveMessage, MessageCandidate, MessageSource};
pub use session::Session;
