//! Wire framing shared by the V2 consumer protocol and the V1 lookup
//! peer protocol.
//!
//! Commands are an ASCII verb line terminated by `\n`, optionally
//! followed by a length-prefixed binary body. Responses are
//! `size(4, BE) || frameType(4, BE) || payload`.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

use crate::error::ProtocolError;

pub const MAGIC_V2: &[u8; 4] = b"  V2";
pub const MAGIC_V1: &[u8; 4] = b"  V1";

pub const FRAME_TYPE_RESPONSE: i32 = 0;
pub const FRAME_TYPE_ERROR: i32 = 1;
pub const FRAME_TYPE_MESSAGE: i32 = 2;

pub const OK: &[u8] = b"OK";
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

/// Longest accepted command line; a line this size is already garbage.
pub const MAX_LINE_LEN: usize = 4096;

pub fn append_frame(buf: &mut BytesMut, frame_type: i32, payload: &[u8]) {
    buf.reserve(8 + payload.len());
    buf.put_u32((payload.len() + 4) as u32);
    buf.put_i32(frame_type);
    buf.put_slice(payload);
}

/// Read one `\n`-terminated command line, without the terminator.
/// `Ok(None)` means the peer closed the connection cleanly.
pub async fn read_command_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut line = Vec::with_capacity(64);
    // cap the read so a newline-less peer cannot balloon memory
    let mut limited = (&mut *reader).take((MAX_LINE_LEN + 1) as u64);
    let n = limited.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if line.pop() != Some(b'\n') {
        return Err(ProtocolError::fatal(
            "E_BAD_MESSAGE",
            "command line too long or truncated",
        ));
    }
    // tolerate \r\n
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(line))
}

/// Read a 4-byte length-prefixed body, bounded by `max`.
pub async fn read_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    max: u32,
) -> Result<Vec<u8>, ProtocolError> {
    let len = reader.read_u32().await?;
    if len == 0 {
        return Err(ProtocolError::fatal("E_BAD_BODY", "body cannot be empty"));
    }
    if len > max {
        return Err(ProtocolError::fatal(
            "E_BAD_BODY",
            format!("body too big: {len} > {max}"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
