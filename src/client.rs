//! Connector-side driver: synchronous request/response over the tunnel,
//! one outstanding request at a time. This is the interface the file
//! browser (or any other UI) programs against.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::{
    DeleteRequest, ErrorResponse, FileInfo, Frame, FrameType, ListRequest, ListResponse,
    MkdirRequest, ReadRequest, ReadResponse, RenameRequest, StatRequest, StatResponse,
    WriteRequest, WriteResponse,
};
use crate::tunnel::Tunnel;
use crate::{Error, Result};

/// Chunk size for whole-file downloads. A client choice, not a protocol
/// constant; anything up to the frame cap works.
const DOWNLOAD_CHUNK_SIZE: i64 = 64 * 1024;

pub struct RemoteClient {
    tunnel: Tunnel,
}

impl RemoteClient {
    pub fn new(tunnel: Tunnel) -> Self {
        Self { tunnel }
    }

    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    pub async fn list(&self, path: &str) -> Result<Vec<FileInfo>> {
        let resp: ListResponse = self
            .call(FrameType::List, &ListRequest { path: path.to_string() })
            .await?;
        Ok(resp.files)
    }

    pub async fn stat(&self, path: &str) -> Result<FileInfo> {
        let resp: StatResponse = self
            .call(FrameType::Stat, &StatRequest { path: path.to_string() })
            .await?;
        Ok(resp.info)
    }

    /// Reads one range. The sharer clamps the length to the file end and
    /// its own read cap, so the returned chunk may be shorter than asked.
    pub async fn read(&self, path: &str, offset: i64, length: i64) -> Result<Vec<u8>> {
        let resp: ReadResponse = self
            .call(
                FrameType::Read,
                &ReadRequest {
                    path: path.to_string(),
                    offset,
                    length,
                },
            )
            .await?;
        Ok(resp.data)
    }

    /// Fetches a whole file with successive chunked reads.
    pub async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let info = self.stat(path).await?;

        let mut data = Vec::with_capacity(info.size.max(0) as usize);
        let mut offset: i64 = 0;
        while offset < info.size {
            let chunk = self.read(path, offset, DOWNLOAD_CHUNK_SIZE).await?;
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as i64;
            data.extend_from_slice(&chunk);
        }

        Ok(data)
    }

    pub async fn write(&self, path: &str, offset: i64, data: &[u8]) -> Result<i64> {
        let resp: WriteResponse = self
            .call(
                FrameType::Write,
                &WriteRequest {
                    path: path.to_string(),
                    offset,
                    data: data.to_vec(),
                },
            )
            .await?;
        Ok(resp.bytes_written)
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let _: WriteResponse = self
            .call(FrameType::Delete, &DeleteRequest { path: path.to_string() })
            .await?;
        Ok(())
    }

    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let _: WriteResponse = self
            .call(
                FrameType::Rename,
                &RenameRequest {
                    old_path: old_path.to_string(),
                    new_path: new_path.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn mkdir(&self, path: &str, perm: u32) -> Result<()> {
        let _: WriteResponse = self
            .call(FrameType::Mkdir, &MkdirRequest { path: path.to_string(), perm })
            .await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        self.tunnel.ping().await
    }

    pub async fn close(&self) {
        self.tunnel.close().await;
    }

    async fn call<Req, Resp>(&self, frame_type: FrameType, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = bincode::serialize(request)?;
        self.tunnel.send(&Frame::new(frame_type, payload)).await?;

        let reply = self.tunnel.receive().await?;
        match reply.frame_type {
            FrameType::Response => Ok(bincode::deserialize(&reply.payload)?),
            FrameType::Error => {
                let err: ErrorResponse = bincode::deserialize(&reply.payload)?;
                Err(Error::Remote {
                    code: err.code,
                    message: err.message,
                })
            }
            other => Err(Error::Protocol(format!(
                "unexpected reply frame: {:?}",
                other
            ))),
        }
    }
}
