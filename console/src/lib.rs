//! # Fleet Console Telemetry Library
//!
//! This library implements the real-time telemetry pipeline behind the
//! fleet administration console: the component that keeps live state for
//! a selected managed server process and feeds a virtualized console
//! view at constant per-frame cost.
//!
//! ## Architecture Overview
//!
//! Each selected resource gets one logical channel per telemetry topic
//! (console, metrics, players, freezes, background jobs, health). All
//! channel payloads flow through a single normalization boundary into a
//! bounded event store; a debounced health tracker derives one
//! connectivity indicator per resource; the window renderer computes the
//! minimal visible row range from the store snapshot each frame.
//!
//! ## Module Organization
//!
//! ### Channel Module (`channel`)
//! The transport seam: the `ChannelTransport` trait, channel handles
//! with explicit unsubscribe, and the UDP reference transport.
//!
//! ### Registry Module (`registry`)
//! Reference-counted table of open channels per resource; idempotent
//! subscribe and synchronous teardown.
//!
//! ### Store Module (`store`)
//! Per-resource bounded buffers with normalization at ingestion and
//! version-cached snapshots for memoized rendering.
//!
//! ### Health Module (`health`)
//! Connected/Disconnected per resource, debounced against reconnect
//! flicker.
//!
//! ### Window Module (`window`)
//! Virtualized visible-range computation over the filtered console
//! buffer, with pinned/free auto-scroll modes.
//!
//! ### Dispatch Module (`dispatch`)
//! One-shot commands with confirmation-driven synthetic console records
//! and a stale-completion guard.
//!
//! ### Context Module (`context`)
//! The dependency-injected object tying store, registry, and health
//! together; one instance per running client, many per test suite.

pub mod channel;
pub mod context;
pub mod dispatch;
pub mod health;
pub mod registry;
pub mod store;
pub mod window;
