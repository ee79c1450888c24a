//! The encrypted duplex channel between two peers.
//!
//! A tunnel owns one upgraded relay connection. Opening it derives the
//! preshared key from the passcode, runs the handshake over raw frames,
//! then wraps every application frame in the directional AEADs. Sends
//! and receives are serialized by their own locks so the sender and
//! receiver can live on separate tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::Mutex;

use crate::cryptography::{self, Aead};
use crate::handshake::{Handshake, Role};
use crate::protocol::{Frame, FrameType};
use crate::transport::{self, Message, MessageSource, SharedSink};
use crate::{Error, Result};

// Handshake messages ride on slow links and wait out the remote peer's
// memory-hard key derivation, hence the generous read budget.
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(120);
const HANDSHAKE_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const DATA_READ_TIMEOUT: Duration = Duration::from_secs(120);
const DATA_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const PONG_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

struct RecvHalf {
    source: MessageSource,
    cipher: Aead,
}

pub struct Tunnel {
    sink: SharedSink,
    send_half: Mutex<Aead>,
    recv_half: Mutex<RecvHalf>,
    closed: AtomicBool,
    session_id: String,
}

impl Tunnel {
    /// Dials the relay endpoint for `role`, performs the handshake and
    /// installs the transport ciphers.
    ///
    /// The connector is the initiator; the sharer is the responder.
    pub async fn open(
        relay_url: &str,
        session_id: &str,
        passcode: &str,
        role: Role,
    ) -> Result<Tunnel> {
        // Argon2id is CPU- and memory-bound for ~100ms; keep it off the
        // async workers.
        let preshared = {
            let passcode = passcode.to_string();
            let session = session_id.to_string();
            tokio::task::spawn_blocking(move || cryptography::derive_key(&passcode, &session))
                .await
                .map_err(|e| Error::Transport(format!("key derivation task failed: {}", e)))??
        };

        let endpoint = match role {
            Role::Initiator => transport::ENDPOINT_CONNECT,
            Role::Responder => transport::ENDPOINT_SHARE,
        };

        debug!("dialing relay endpoint /{} for session {}", endpoint, session_id);
        let upgraded = transport::dial(relay_url, endpoint, session_id).await?;
        let (sink, mut source) = transport::into_message_stream(upgraded);
        let sink: SharedSink = Arc::new(Mutex::new(sink));

        let mut handshake = Handshake::new(&preshared, role);
        if let Err(e) = perform_handshake(&sink, &mut source, &mut handshake, role).await {
            transport::close_sink(&sink).await;
            return Err(e);
        }

        let (send_key, recv_key) = handshake.transport_keys()?;
        debug!("tunnel established for session {}", session_id);

        Ok(Tunnel {
            sink,
            send_half: Mutex::new(Aead::new(&send_key)),
            recv_half: Mutex::new(RecvHalf {
                source,
                cipher: Aead::new(&recv_key),
            }),
            closed: AtomicBool::new(false),
            session_id: session_id.to_string(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Encrypts and sends one frame as a single transport message.
    /// The send counter only moves inside this critical section.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TunnelClosed);
        }

        let encoded = frame.encode()?;

        let mut cipher = self.send_half.lock().await;
        let record = cipher.seal(&encoded)?;
        transport::send_message(&self.sink, transport::data_message(&record), DATA_WRITE_TIMEOUT)
            .await
    }

    /// Receives, decrypts and parses one frame. Transport pings are
    /// answered transparently and never surface to the caller.
    pub async fn receive(&self) -> Result<Frame> {
        if self.is_closed() {
            return Err(Error::TunnelClosed);
        }

        let mut half = self.recv_half.lock().await;
        loop {
            match transport::recv_message(&mut half.source, DATA_READ_TIMEOUT).await? {
                None => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(Error::TunnelClosed);
                }
                Some(Message::Ping) => {
                    transport::send_message(
                        &self.sink,
                        transport::pong_message(),
                        PONG_WRITE_TIMEOUT,
                    )
                    .await?;
                }
                Some(Message::Pong) => continue,
                Some(Message::Data(record)) => {
                    let plaintext = half.cipher.open(&record)?;
                    return Frame::decode(&plaintext);
                }
            }
        }
    }

    /// Protocol-level liveness probe: sends a ping frame, expects pong.
    pub async fn ping(&self) -> Result<()> {
        self.send(&Frame::new(FrameType::Ping, Vec::new())).await?;

        let reply = self.receive().await?;
        if reply.frame_type != FrameType::Pong {
            return Err(Error::Protocol(format!(
                "expected pong, got {:?}",
                reply.frame_type
            )));
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the tunnel. Idempotent; the peer observes the closed
    /// transport on its next read or write.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            transport::close_sink(&self.sink).await;
        }
    }
}

async fn perform_handshake(
    sink: &SharedSink,
    source: &mut MessageSource,
    handshake: &mut Handshake,
    role: Role,
) -> Result<()> {
    match role {
        Role::Initiator => {
            let m1 = handshake.create_initiator_message()?;
            send_raw_frame(sink, &Frame::new(FrameType::Handshake, m1)).await?;

            let reply = recv_raw_frame(sink, source).await?;
            if reply.frame_type != FrameType::HandshakeResp {
                return Err(Error::Protocol(format!(
                    "unexpected handshake frame: {:?}",
                    reply.frame_type
                )));
            }
            handshake.process_responder_message(&reply.payload)
        }
        Role::Responder => {
            let first = recv_raw_frame(sink, source).await?;
            if first.frame_type != FrameType::Handshake {
                return Err(Error::Protocol(format!(
                    "unexpected handshake frame: {:?}",
                    first.frame_type
                )));
            }
            handshake.process_initiator_message(&first.payload)?;

            let m2 = handshake.create_responder_message()?;
            send_raw_frame(sink, &Frame::new(FrameType::HandshakeResp, m2)).await
        }
    }
}

// Handshake frames travel unencrypted: the auth blobs inside carry
// their own sealing.
async fn send_raw_frame(sink: &SharedSink, frame: &Frame) -> Result<()> {
    let encoded = frame.encode()?;
    transport::send_message(sink, transport::data_message(&encoded), HANDSHAKE_WRITE_TIMEOUT).await
}

async fn recv_raw_frame(sink: &SharedSink, source: &mut MessageSource) -> Result<Frame> {
    loop {
        match transport::recv_message(source, HANDSHAKE_READ_TIMEOUT).await? {
            None => return Err(Error::TunnelClosed),
            Some(Message::Ping) => {
                transport::send_message(sink, transport::pong_message(), PONG_WRITE_TIMEOUT)
                    .await?;
            }
            Some(Message::Pong) => continue,
            Some(Message::Data(payload)) => return Frame::decode(&payload),
        }
    }
}
