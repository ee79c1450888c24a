//! Wire protocol: length-prefixed typed frames and their payloads.
//!
//! Frame layout: `length(4, big-endian) || type(4, big-endian) || payload`.
//! Payloads of request/response frames are bincode-encoded structs; the
//! codec itself treats them as opaque bytes.

use serde::{Deserialize, Serialize};

use crate::{Error, Result, MAX_FRAME_SIZE};

pub const FRAME_HEADER_SIZE: usize = 8;

// Error codes carried by ErrorResponse.
pub const ERR_CODE_NOT_FOUND: u32 = 1;
pub const ERR_CODE_PERMISSION: u32 = 2;
pub const ERR_CODE_EXISTS: u32 = 3;
pub const ERR_CODE_IS_DIRECTORY: u32 = 4;
pub const ERR_CODE_NOT_DIRECTORY: u32 = 5;
pub const ERR_CODE_INVALID_PATH: u32 = 6;
pub const ERR_CODE_QUOTA_EXCEEDED: u32 = 7;
pub const ERR_CODE_IO: u32 = 8;
pub const ERR_CODE_UNKNOWN: u32 = 99;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum FrameType {
    Handshake = 0x01,
    HandshakeResp = 0x02,
    List = 0x10,
    Stat = 0x11,
    Read = 0x12,
    Write = 0x13,
    Delete = 0x14,
    Rename = 0x15,
    Mkdir = 0x16,
    Response = 0x20,
    Error = 0x21,
    Ping = 0x30,
    Pong = 0x31,
}

impl FrameType {
    pub fn from_u32(value: u32) -> Result<Self> {
        Ok(match value {
            0x01 => FrameType::Handshake,
            0x02 => FrameType::HandshakeResp,
            0x10 => FrameType::List,
            0x11 => FrameType::Stat,
            0x12 => FrameType::Read,
            0x13 => FrameType::Write,
            0x14 => FrameType::Delete,
            0x15 => FrameType::Rename,
            0x16 => FrameType::Mkdir,
            0x20 => FrameType::Response,
            0x21 => FrameType::Error,
            0x30 => FrameType::Ping,
            0x31 => FrameType::Pong,
            other => return Err(Error::UnknownFrameType(other)),
        })
    }
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self { frame_type, payload }
    }

    /// Serializes the frame header and payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge);
        }

        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&(self.frame_type as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parses one frame from a buffer holding exactly one frame.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(Error::InvalidFrame);
        }

        let length = u32::from_be_bytes(data[0..4].try_into().expect("slice is 4 bytes")) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge);
        }

        let raw_type = u32::from_be_bytes(data[4..8].try_into().expect("slice is 4 bytes"));
        let frame_type = FrameType::from_u32(raw_type)?;

        if data.len() != FRAME_HEADER_SIZE + length {
            return Err(Error::InvalidFrame);
        }

        Ok(Self {
            frame_type,
            payload: data[FRAME_HEADER_SIZE..].to_vec(),
        })
    }
}

// Request payloads.

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ListRequest {
    pub path: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatRequest {
    pub path: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReadRequest {
    pub path: String,
    pub offset: i64,
    pub length: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WriteRequest {
    pub path: String,
    pub offset: i64,
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DeleteRequest {
    pub path: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RenameRequest {
    pub old_path: String,
    pub new_path: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MkdirRequest {
    pub path: String,
    pub perm: u32,
}

// Response payloads.

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: i64,
    pub mode: u32,
    pub mtime: i64,
    pub is_dir: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ListResponse {
    pub files: Vec<FileInfo>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatResponse {
    pub info: FileInfo,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReadResponse {
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WriteResponse {
    pub bytes_written: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorResponse {
    pub code: u32,
    pub message: String,
}

/// Builds a response frame from any serializable payload.
pub fn response_frame<T: Serialize>(payload: &T) -> Result<Frame> {
    Ok(Frame::new(FrameType::Response, bincode::serialize(payload)?))
}

/// Builds an error frame with the given code and message.
pub fn error_frame(code: u32, message: &str) -> Frame {
    let resp = ErrorResponse {
        code,
        message: message.to_string(),
    };
    // ErrorResponse serialization cannot fail: two plain fields
    let payload = bincode::serialize(&resp).expect("error response serializes");
    Frame::new(FrameType::Error, payload)
}
