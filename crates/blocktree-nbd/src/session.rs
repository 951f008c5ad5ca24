//! NBD request session.
//!
//! Serves the kernel's framed requests off the server end of the socket
//! pair: 28-byte big-endian request headers in, 16-byte reply headers (plus
//! payload for successful reads) out. Requests are served strictly in
//! order and each reply is written contiguously.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use blocktree_core::reader::{ChunkReader, ReadError};

pub const REQUEST_MAGIC: u32 = 0x2560_9513;
pub const REPLY_MAGIC: u32 = 0x6744_6698;

pub const CMD_READ: u32 = 0;
pub const CMD_DISCONNECT: u32 = 2;

const REQUEST_LEN: usize = 28;
const REPLY_LEN: usize = 16;

/// Session error: protocol violations abort the connection.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad request magic {0:#010x}")]
    BadMagic(u32),
    #[error("unknown command {0}")]
    UnknownCommand(u32),
}

fn be_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    u32::from_be_bytes(raw)
}

fn errno_for(error: &ReadError) -> u32 {
    match error {
        ReadError::NotFound(_) => libc::ENOENT as u32,
        _ => libc::EIO as u32,
    }
}

fn reply(error: u32, handle: &[u8; 8]) -> [u8; REPLY_LEN] {
    let mut out = [0u8; REPLY_LEN];
    out[0..4].copy_from_slice(&REPLY_MAGIC.to_be_bytes());
    out[4..8].copy_from_slice(&error.to_be_bytes());
    out[8..16].copy_from_slice(handle);
    out
}

/// Serve NBD requests until the kernel disconnects.
///
/// A failed read answers that request with a non-zero error code and the
/// session continues; only malformed framing tears the session down.
pub async fn serve<T>(stream: &mut T, reader: &ChunkReader) -> Result<(), SessionError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        let mut header = [0u8; REQUEST_LEN];
        stream.read_exact(&mut header).await?;

        let magic = be_u32(&header[0..4]);
        if magic != REQUEST_MAGIC {
            return Err(SessionError::BadMagic(magic));
        }
        let command = be_u32(&header[4..8]);
        let mut handle = [0u8; 8];
        handle.copy_from_slice(&header[8..16]);
        let mut offset_raw = [0u8; 8];
        offset_raw.copy_from_slice(&header[16..24]);
        let offset = u64::from_be_bytes(offset_raw);
        let length = be_u32(&header[24..28]);

        match command {
            CMD_READ => {
                debug!(offset, length, "read request");
                match reader.read_at(offset, length as usize).await {
                    Ok(payload) => {
                        let mut response = Vec::with_capacity(REPLY_LEN + payload.len());
                        response.extend_from_slice(&reply(0, &handle));
                        response.extend_from_slice(&payload);
                        stream.write_all(&response).await?;
                    }
                    Err(error) => {
                        warn!(offset, length, %error, "read failed");
                        stream.write_all(&reply(errno_for(&error), &handle)).await?;
                    }
                }
                stream.flush().await?;
            }
            CMD_DISCONNECT => {
                info!("disconnect requested");
                return Ok(());
            }
            other => return Err(SessionError::UnknownCommand(other)),
        }
    }
}
