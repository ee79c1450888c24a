//! Message-oriented transport between a peer and the relay.
//!
//! A tunnel endpoint is an HTTP/1.1 connection upgraded to a binary
//! duplex stream. Messages are framed with a 4-byte big-endian length
//! prefix and start with a one-byte kind: data messages carry opaque
//! payloads end to end, ping/pong keep idle connections alive and are
//! consumed by whichever side receives them.

use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use hyper::header::{CONNECTION, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::{Body, Client, Request, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{Error, Result, MAX_MESSAGE_SIZE};

/// Protocol token sent in the Upgrade header.
pub const UPGRADE_PROTOCOL: &str = "burrow-tunnel";

/// Relay endpoint joined by the sharer.
pub const ENDPOINT_SHARE: &str = "share";
/// Relay endpoint joined by the connector.
pub const ENDPOINT_CONNECT: &str = "connect";

const KIND_DATA: u8 = 0x00;
const KIND_PING: u8 = 0x01;
const KIND_PONG: u8 = 0x02;

pub type MessageSink = SplitSink<Framed<Upgraded, LengthDelimitedCodec>, Bytes>;
pub type MessageSource = SplitStream<Framed<Upgraded, LengthDelimitedCodec>>;

/// Write half of a message stream, shareable between the tasks that
/// need to reply (forwarding, keepalive, pong answers).
pub type SharedSink = Arc<Mutex<MessageSink>>;

#[derive(Debug)]
pub enum Message {
    Data(Bytes),
    Ping,
    Pong,
}

fn message_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(MAX_MESSAGE_SIZE)
        .new_codec()
}

/// Splits an upgraded connection into message-framed halves.
pub fn into_message_stream(upgraded: Upgraded) -> (MessageSink, MessageSource) {
    Framed::new(upgraded, message_codec()).split()
}

pub fn data_message(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(KIND_DATA);
    buf.put_slice(payload);
    buf.freeze()
}

pub fn ping_message() -> Bytes {
    Bytes::from_static(&[KIND_PING])
}

pub fn pong_message() -> Bytes {
    Bytes::from_static(&[KIND_PONG])
}

pub fn parse_message(mut raw: BytesMut) -> Result<Message> {
    if raw.is_empty() {
        return Err(Error::Transport("empty transport message".to_string()));
    }

    let kind = raw[0];
    match kind {
        KIND_DATA => {
            let _ = raw.split_to(1);
            Ok(Message::Data(raw.freeze()))
        }
        KIND_PING => Ok(Message::Ping),
        KIND_PONG => Ok(Message::Pong),
        other => Err(Error::Transport(format!(
            "unknown transport message kind: {:#x}",
            other
        ))),
    }
}

/// Sends one message within the deadline. Writes are serialized by the
/// sink's own lock; the lock is never held across anything but the write.
pub async fn send_message(sink: &SharedSink, message: Bytes, deadline: Duration) -> Result<()> {
    timeout(deadline, async {
        let mut guard = sink.lock().await;
        guard.send(message).await.map_err(Error::Io)
    })
    .await
    .map_err(|_| Error::Timeout)?
}

/// Receives one message within the deadline. Returns `None` on a clean
/// end of stream.
pub async fn recv_message(
    source: &mut MessageSource,
    deadline: Duration,
) -> Result<Option<Message>> {
    match timeout(deadline, source.next()).await {
        Err(_) => Err(Error::Timeout),
        Ok(None) => Ok(None),
        Ok(Some(Err(e))) => Err(Error::Io(e)),
        Ok(Some(Ok(raw))) => parse_message(raw).map(Some),
    }
}

/// Closes the write half, signalling the peer.
pub async fn close_sink(sink: &SharedSink) {
    let mut guard = sink.lock().await;
    let _ = guard.close().await;
}

/// Dials the relay's endpoint for a session and upgrades the connection
/// to the tunnel transport.
pub async fn dial(relay_url: &str, endpoint: &str, session_id: &str) -> Result<Upgraded> {
    let base = relay_url.trim_end_matches('/');
    let uri = format!("{}/{}?session={}", base, endpoint, session_id);

    let request = Request::builder()
        .uri(&uri)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, UPGRADE_PROTOCOL)
        .body(Body::empty())
        .map_err(|e| Error::Transport(format!("invalid relay URL: {}", e)))?;

    let response = Client::new().request(request).await?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(Error::Transport(format!(
            "relay refused connection: {}",
            response.status()
        )));
    }

    Ok(hyper::upgrade::on(response).await?)
}
