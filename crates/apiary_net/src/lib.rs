//! Apiary Net — the HTTP surface and the gossip engine.
//!
//! `api` exposes the eight JSON routes a server answers; `gossip` keeps a
//! federation of servers converging on the same message sets; `wire` holds
//! the bodies both sides of every exchange agree on.

pub mod api;
pub mod gossip;
pub mod wire;

pub use api::{ApiState, router};
pub use gossip::{GOSSIP_SECRET_HEADER, GossipEngine, GossipSettings};
