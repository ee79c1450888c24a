pub mod client;
pub mod commands;
pub mod cryptography;
pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod relay;
pub mod secure_fs;
pub mod session;
pub mod transport;
pub mod tunnel;

pub use error::{Error, Result};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
pub const TAG_SIZE: usize = 16;

/// Largest frame payload a peer will accept.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Largest transport message the relay or a peer will read. Leaves room
/// for the frame header, the AEAD record overhead and the message kind
/// byte on top of MAX_FRAME_SIZE.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

pub const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:8080";
