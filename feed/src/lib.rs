//! # Fleet Telemetry Feed
//!
//! The feed is the authoritative side of the telemetry wire: it tracks
//! which console is subscribed to which (resource, topic) channel,
//! publishes simulated fleet telemetry to them, and answers one-shot
//! control requests.
//!
//! ## Module Organization
//!
//! ### Fleet Module (`fleet`)
//! Simulated managed server processes: console output, metrics,
//! rosters, jobs, and the EULA-gated process lifecycle.
//!
//! ### Subscribers Module (`subscribers`)
//! Subscriber lifecycle: per-address topic routes, activity tracking,
//! and timeout cleanup.
//!
//! ### Network Module (`network`)
//! The UDP server loop: packet demux, publish fan-out, and request
//! handling.

pub mod fleet;
pub mod network;
pub mod subscribers;
