//! One TCP connection speaking the V2 protocol.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

pub const FRAME_TYPE_RESPONSE: i32 = 0;
pub const FRAME_TYPE_ERROR: i32 = 1;
pub const FRAME_TYPE_MESSAGE: i32 = 2;

const MAGIC_V2: &[u8; 4] = b"  V2";
const HEARTBEAT: &[u8] = b"_heartbeat_";

#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: i32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn is_heartbeat(&self) -> bool {
        self.frame_type == FRAME_TYPE_RESPONSE && self.data == HEARTBEAT
    }
}

/// A message delivered on a subscription.
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    pub timestamp: i64,
    pub attempts: u16,
    pub id: [u8; 16],
    pub body: Vec<u8>,
}

impl ConsumedMessage {
    /// The id as it is sent back in FIN/REQ/TOUCH.
    pub fn id_str(&self) -> String {
        String::from_utf8_lossy(&self.id).into_owned()
    }

    fn decode(data: &[u8]) -> io::Result<Self> {
        if data.len() < 26 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message frame too short",
            ));
        }
        let mut buf = data;
        let timestamp = buf.get_i64();
        let attempts = buf.get_u16();
        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[..16]);
        buf.advance(16);
        Ok(Self {
            timestamp,
            attempts,
            id,
            body: buf.to_vec(),
        })
    }
}

pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    /// Connect and send the protocol magic.
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        };
        client.writer.write_all(MAGIC_V2).await?;
        Ok(client)
    }

    pub async fn identify(&mut self, body: &serde_json::Value) -> io::Result<Frame> {
        let payload = serde_json::to_vec(body)?;
        self.send_with_body(b"IDENTIFY\n", &payload).await?;
        self.read_frame().await
    }

    pub async fn subscribe(&mut self, topic: &str, channel: &str) -> io::Result<Frame> {
        self.send_line(format!("SUB {topic} {channel}\n")).await?;
        self.read_frame().await
    }

    pub async fn rdy(&mut self, count: i64) -> io::Result<()> {
        self.send_line(format!("RDY {count}\n")).await
    }

    pub async fn publish(&mut self, topic: &str, body: &[u8]) -> io::Result<Frame> {
        self.send_with_body(format!("PUB {topic}\n").as_bytes(), body)
            .await?;
        self.read_frame().await
    }

    pub async fn publish_deferred(
        &mut self,
        topic: &str,
        defer_ms: u64,
        body: &[u8],
    ) -> io::Result<Frame> {
        self.send_with_body(format!("DPUB {topic} {defer_ms}\n").as_bytes(), body)
            .await?;
        self.read_frame().await
    }

    pub async fn publish_multi(&mut self, topic: &str, bodies: &[&[u8]]) -> io::Result<Frame> {
        let mut payload = BytesMut::new();
        payload.put_u32(bodies.len() as u32);
        for body in bodies {
            payload.put_u32(body.len() as u32);
            payload.put_slice(body);
        }
        self.send_with_body(format!("MPUB {topic}\n").as_bytes(), &payload)
            .await?;
        self.read_frame().await
    }

    pub async fn fin(&mut self, id: &str) -> io::Result<()> {
        self.send_line(format!("FIN {id}\n")).await
    }

    pub async fn requeue(&mut self, id: &str, timeout_ms: u64) -> io::Result<()> {
        self.send_line(format!("REQ {id} {timeout_ms}\n")).await
    }

    pub async fn touch(&mut self, id: &str) -> io::Result<()> {
        self.send_line(format!("TOUCH {id}\n")).await
    }

    pub async fn nop(&mut self) -> io::Result<()> {
        self.send_line("NOP\n".to_string()).await
    }

    pub async fn cls(&mut self) -> io::Result<Frame> {
        self.send_line("CLS\n".to_string()).await?;
        self.read_frame().await
    }

    /// Read raw frames; heartbeats are NOT auto-answered here.
    pub async fn read_frame(&mut self) -> io::Result<Frame> {
        let size = self.reader.read_u32().await?;
        if size < 4 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "short frame"));
        }
        let frame_type = self.reader.read_i32().await?;
        let mut data = vec![0u8; (size - 4) as usize];
        self.reader.read_exact(&mut data).await?;
        Ok(Frame { frame_type, data })
    }

    /// Read until the next delivered message, answering heartbeats with
    /// NOP along the way. Error frames surface as `io::Error`.
    pub async fn next_message(&mut self) -> io::Result<ConsumedMessage> {
        loop {
            let frame = self.read_frame().await?;
            if frame.is_heartbeat() {
                self.nop().await?;
                continue;
            }
            match frame.frame_type {
                FRAME_TYPE_MESSAGE => return ConsumedMessage::decode(&frame.data),
                FRAME_TYPE_ERROR => {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        String::from_utf8_lossy(&frame.data).into_owned(),
                    ))
                }
                _ => continue,
            }
        }
    }

    async fn send_line(&mut self, line: String) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await
    }

    async fn send_with_body(&mut self, cmd: &[u8], body: &[u8]) -> io::Result<()> {
        let mut buf = BytesMut::with_capacity(cmd.len() + 4 + body.len());
        buf.put_slice(cmd);
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);
        self.writer.write_all(&buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_message_frame() {
        let mut data = BytesMut::new();
        data.put_i64(1_700_000_000_000_000_000);
        data.put_u16(3);
        data.put_slice(b"0123456789abcdef");
        data.put_slice(b"body!");

        let msg = ConsumedMessage::decode(&data).unwrap();
        assert_eq!(msg.timestamp, 1_700_000_000_000_000_000);
        assert_eq!(msg.attempts, 3);
        assert_eq!(msg.id_str(), "0123456789abcdef");
        assert_eq!(msg.body, b"body!");
    }

    #[test]
    fn short_frame_is_rejected() {
        assert!(ConsumedMessage::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn heartbeat_frame_is_recognized() {
        let frame = Frame {
            frame_type: FRAME_TYPE_RESPONSE,
            data: b"_heartbeat_".to_vec(),
        };
        assert!(frame.is_heartbeat());
        let frame = Frame {
            frame_type: FRAME_TYPE_RESPONSE,
            data: b"OK".to_vec(),
        };
        assert!(!frame.is_heartbeat());
    }
}
