//! One accepted IPC socket: identity, framed reads and serialized writes.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use dcs_core::error::IpcError;
use dcs_core::frame::{encode_frame, FrameError, JsonFrameDecoder};
use dcs_core::session::{Permission, SessionMode};
use serde::Serialize;
use serde_json::Value;

const READ_CHUNK: usize = 8 * 1024;

/// Shared handle to a connection. The single reader task holds the
/// [`FrameReader`]; everything else (dispatcher, fanout, HTTP bridge) only
/// ever writes, serialized by the write mutex so one frame is one socket
/// write.
pub struct Connection {
    pub id: u32,
    pub peer_pid: i32,
    pub permissions: HashSet<Permission>,
    pub plugin: Option<String>,
    pub mode: SessionMode,
    pub cancel: CancellationToken,
    writer: Mutex<OwnedWriteHalf>,
    max_frame_bytes: usize,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u32,
        peer_pid: i32,
        permissions: HashSet<Permission>,
        plugin: Option<String>,
        mode: SessionMode,
        writer: OwnedWriteHalf,
        max_frame_bytes: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer_pid,
            permissions,
            plugin,
            mode,
            cancel: CancellationToken::new(),
            writer: Mutex::new(writer),
            max_frame_bytes,
        })
    }

    pub fn has_permissions(&self, required: &[Permission]) -> bool {
        required.iter().all(|perm| self.permissions.contains(perm))
    }

    pub async fn send_frame<T: Serialize>(&self, value: &T) -> Result<(), IpcError> {
        let bytes = encode_frame(value, self.max_frame_bytes)
            .map_err(|err| IpcError::protocol(err.to_string()))?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Write raw bytes (an HTTP bridge body) after a frame, under the same
    /// write mutex.
    pub async fn send_raw(&self, bytes: &[u8]) -> Result<(), IpcError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Cooperative close: cancels every operation owned by the connection.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Framed reading over the owned read half. Exactly one of these exists
/// per connection, so reads need no lock.
pub struct FrameReader {
    half: OwnedReadHalf,
    decoder: JsonFrameDecoder,
}

impl FrameReader {
    pub fn new(half: OwnedReadHalf, max_frame_bytes: usize) -> Self {
        Self {
            half,
            decoder: JsonFrameDecoder::new(max_frame_bytes),
        }
    }

    /// Next frame, or `None` on a clean EOF at a frame boundary.
    pub async fn read_frame(&mut self, cancel: &CancellationToken) -> Result<Option<Value>, IpcError> {
        loop {
            match self.decoder.next_frame() {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {}
                Err(FrameError::Syntax(message)) => return Err(IpcError::protocol(message)),
                Err(err) => return Err(IpcError::protocol(err.to_string())),
            }

            let mut buf = [0u8; READ_CHUNK];
            let read = tokio::select! {
                read = self.half.read(&mut buf) => read?,
                _ = cancel.cancelled() => return Err(IpcError::cancelled()),
            };
            if read == 0 {
                if self.decoder.buffered_len() > 0 {
                    return Err(IpcError::protocol("connection closed mid-frame"));
                }
                return Ok(None);
            }
            self.decoder.push_bytes(&buf[..read]);
        }
    }

    /// Read exactly `len` raw bytes, consuming anything the framing layer
    /// already buffered first.
    pub async fn read_raw(
        &mut self,
        len: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, IpcError> {
        let mut body = self.decoder.take_buffered(len);
        while body.len() < len {
            let mut buf = vec![0u8; (len - body.len()).min(READ_CHUNK)];
            let read = tokio::select! {
                read = self.half.read(&mut buf) => read?,
                _ = cancel.cancelled() => return Err(IpcError::cancelled()),
            };
            if read == 0 {
                return Err(IpcError::protocol("connection closed mid-body"));
            }
            body.extend_from_slice(&buf[..read]);
        }
        Ok(body)
    }
}
