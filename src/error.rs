use thiserror::Error;

use crate::protocol;

#[derive(Error, Debug)]
pub enum Error {
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("session locked due to too many failed attempts")]
    SessionLocked,

    #[error("invalid key material")]
    InvalidKey,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("frame exceeds maximum size")]
    FrameTooLarge,

    #[error("unknown frame type: {0:#x}")]
    UnknownFrameType(u32),

    #[error("invalid frame format")]
    InvalidFrame,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("tunnel closed")]
    TunnelClosed,

    #[error("operation timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("path traversal attempt detected")]
    PathTraversal,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("session not found")]
    SessionNotFound,

    #[error("remote error {code}: {message}")]
    Remote { code: u32, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),
}

impl Error {
    /// Wire error code for this error, per the protocol table.
    pub fn wire_code(&self) -> u32 {
        match self {
            Error::NotFound(_) => protocol::ERR_CODE_NOT_FOUND,
            Error::PermissionDenied | Error::SessionLocked => protocol::ERR_CODE_PERMISSION,
            Error::PathTraversal | Error::InvalidPath(_) => protocol::ERR_CODE_INVALID_PATH,
            Error::Io(_) => protocol::ERR_CODE_IO,
            Error::Remote { code, .. } => *code,
            _ => protocol::ERR_CODE_UNKNOWN,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
