//! # Commands Module
//!
//! The three command handlers for burrow:
//!
//! ## `share`
//! Exports a local directory to one remote peer:
//! - Creates a session (id + passcode) at the relay
//! - Opens the encrypted tunnel as the responder
//! - Serves filesystem requests until the peer disconnects
//!
//! ## `connect`
//! Browses a shared directory remotely:
//! - Takes the session id and passcode from the sharer
//! - Opens the encrypted tunnel as the initiator
//! - Hands the tunnel to the interactive file browser
//!
//! ## `relay`
//! Runs the blind rendezvous server:
//! - Issues session credentials over HTTP
//! - Pairs the two endpoints of each session
//! - Forwards opaque encrypted frames in both directions

pub mod connect;
pub mod relay;
pub mod share;

use crate::DEFAULT_RELAY_URL;

/// Relay URL from the flag, the BURROW_RELAY environment variable, or
/// the built-in default, in that order.
pub fn resolve_relay_url(flag: Option<String>) -> String {
    flag.or_else(|| std::env::var("BURROW_RELAY").ok())
        .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string())
}
