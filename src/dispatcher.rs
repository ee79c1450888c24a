//! Sharer-side request loop.
//!
//! One dispatcher serves one tunnel, strictly in arrival order:
//! Idle (receive) -> Decoding -> Executing -> Replying -> Idle. The three
//! failure classes take different exits: operation errors and protocol
//! errors answer with an error frame and keep the loop alive; tunnel
//! errors end it.

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::{
    self, DeleteRequest, Frame, FrameType, ListRequest, MkdirRequest, ReadRequest, RenameRequest,
    StatRequest, WriteRequest, WriteResponse, ERR_CODE_UNKNOWN,
};
use crate::secure_fs::SecureFilesystem;
use crate::tunnel::Tunnel;
use crate::{Error, Result};

enum Outcome {
    /// Decoded, executed, reply ready.
    Reply(Frame),
    /// The filesystem refused; answer with its wire code.
    OperationError(Error),
    /// The request itself was malformed; answer generically.
    ProtocolError(String),
}

/// Serves filesystem requests over the tunnel until the peer disconnects.
/// Returns `Ok(())` on a clean close.
pub async fn serve(tunnel: &Tunnel, fs: &SecureFilesystem) -> Result<()> {
    loop {
        let frame = match tunnel.receive().await {
            Ok(frame) => frame,
            Err(Error::TunnelClosed) => {
                debug!("tunnel closed, dispatcher exiting");
                return Ok(());
            }
            // A frame that parsed badly still came over an authenticated
            // channel; tell the peer and keep serving
            Err(e @ (Error::UnknownFrameType(_) | Error::InvalidFrame | Error::FrameTooLarge)) => {
                let reply = protocol::error_frame(ERR_CODE_UNKNOWN, &e.to_string());
                if let Err(send_err) = tunnel.send(&reply).await {
                    tunnel.close().await;
                    return Err(send_err);
                }
                continue;
            }
            Err(e) => {
                warn!("tunnel error in dispatcher: {}", e);
                tunnel.close().await;
                return Err(e);
            }
        };

        let reply = match dispatch(&frame, fs) {
            Outcome::Reply(frame) => frame,
            Outcome::OperationError(e) => {
                debug!("request failed: {}", e);
                protocol::error_frame(e.wire_code(), &e.to_string())
            }
            Outcome::ProtocolError(message) => {
                debug!("protocol error: {}", message);
                protocol::error_frame(ERR_CODE_UNKNOWN, &message)
            }
        };

        if let Err(e) = tunnel.send(&reply).await {
            warn!("failed to send reply: {}", e);
            tunnel.close().await;
            return Err(e);
        }
    }
}

fn dispatch(frame: &Frame, fs: &SecureFilesystem) -> Outcome {
    match frame.frame_type {
        FrameType::Ping => Outcome::Reply(Frame::new(FrameType::Pong, Vec::new())),

        FrameType::List => match decode::<ListRequest>(&frame.payload) {
            Err(outcome) => outcome,
            Ok(req) => execute(fs.list(&req.path)),
        },

        FrameType::Stat => match decode::<StatRequest>(&frame.payload) {
            Err(outcome) => outcome,
            Ok(req) => execute(fs.stat(&req.path)),
        },

        FrameType::Read => match decode::<ReadRequest>(&frame.payload) {
            Err(outcome) => outcome,
            Ok(req) => execute(fs.read(&req.path, req.offset, req.length)),
        },

        FrameType::Write => match decode::<WriteRequest>(&frame.payload) {
            Err(outcome) => outcome,
            Ok(req) => execute(fs.write(&req.path, req.offset, &req.data)),
        },

        FrameType::Delete => match decode::<DeleteRequest>(&frame.payload) {
            Err(outcome) => outcome,
            Ok(req) => execute(fs.delete(&req.path).map(|_| empty_write_response())),
        },

        FrameType::Rename => match decode::<RenameRequest>(&frame.payload) {
            Err(outcome) => outcome,
            Ok(req) => execute(fs.rename(&req.old_path, &req.new_path).map(|_| empty_write_response())),
        },

        FrameType::Mkdir => match decode::<MkdirRequest>(&frame.payload) {
            Err(outcome) => outcome,
            Ok(req) => execute(fs.mkdir(&req.path, req.perm).map(|_| empty_write_response())),
        },

        other => Outcome::ProtocolError(format!("unexpected request type: {:?}", other)),
    }
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> std::result::Result<T, Outcome> {
    bincode::deserialize(payload)
        .map_err(|e| Outcome::ProtocolError(format!("malformed request payload: {}", e)))
}

fn execute<T: Serialize>(result: Result<T>) -> Outcome {
    match result {
        Ok(payload) => match protocol::response_frame(&payload) {
            Ok(frame) => Outcome::Reply(frame),
            Err(e) => Outcome::OperationError(e),
        },
        Err(e) => Outcome::OperationError(e),
    }
}

// Mutations without a natural payload answer with a zero-byte write
// response.
fn empty_write_response() -> WriteResponse {
    WriteResponse { bytes_written: 0 }
}
