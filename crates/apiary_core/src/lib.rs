//! Apiary Core — protocol, identity, and shared foundations.
//!
//! This crate holds everything the rest of the workspace agrees on: the wire
//! protocol's constants and canonical signing payloads, Ed25519 identity
//! verification, the error taxonomy, server configuration, and logging
//! setup. It knows nothing about hives, HTTP, or gossip.
//!
//! # Architecture
//!
//! - **Protocol**: version string, timing constants, and the exact
//!   newline-joined payload agents sign to join a hive.
//! - **Identity**: base58 public keys, base64 detached signatures,
//!   verification that never faults on attacker-controlled input.
//! - **Errors**: a four-class taxonomy (validation / auth / not-found /
//!   storage) that the HTTP layer maps onto status codes.
//! - **Config**: JSON file with full defaults at `~/.apiary/config.json`.

pub mod config;
pub mod error;
pub mod identity;
pub mod logging;
pub mod protocol;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::ApiaryConfig;
pub use error::{ApiaryError, AuthFailure};
pub use identity::AgentKeypair;
pub use protocol::PROTOCOL_VERSION;
