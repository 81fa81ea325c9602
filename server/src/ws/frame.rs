//! RFC 6455 frame codec.
//!
//! Only what the server needs: masked client frames in, unmasked server
//! frames out. Fragmentation is rejected at the connection layer; this
//! module only decodes single frames.

use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use tumble_core::error::{Error, Result};

pub const MAX_WS_MESSAGE_BYTES: usize = 16 * 1024;
pub const WS_ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_INTERNAL: u16 = 1011;
pub const CLOSE_BAD_REQUEST: u16 = 4400;
pub const CLOSE_UNAUTHORIZED: u16 = 4401;
pub const CLOSE_FORBIDDEN: u16 = 4403;
pub const CLOSE_SESSION_EXPIRED: u16 = 4408;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

#[derive(Debug)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// The `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_ACCEPT_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Read one client frame. Clients must mask; anything unmasked, reserved
/// or oversized is a protocol error.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;

    let fin = header[0] & 0x80 != 0;
    if header[0] & 0x70 != 0 {
        return Err(Error::MalformedMessage("reserved bits set".into()));
    }
    let opcode = Opcode::from_bits(header[0] & 0x0F)
        .ok_or_else(|| Error::MalformedMessage("unknown opcode".into()))?;

    let masked = header[1] & 0x80 != 0;
    if !masked {
        return Err(Error::MalformedMessage("client frame not masked".into()));
    }

    let len = match header[1] & 0x7F {
        126 => {
            let mut buf = [0u8; 2];
            reader.read_exact(&mut buf).await?;
            u16::from_be_bytes(buf) as u64
        }
        127 => {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf).await?;
            u64::from_be_bytes(buf)
        }
        n => n as u64,
    };

    if opcode.is_control() && (len > 125 || !fin) {
        return Err(Error::MalformedMessage("invalid control frame".into()));
    }
    if len > max_payload as u64 {
        return Err(Error::PayloadTooLarge);
    }

    let mut mask = [0u8; 4];
    reader.read_exact(&mut mask).await?;

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }

    Ok(Frame {
        fin,
        opcode,
        payload,
    })
}

/// Write one final, unmasked server frame.
pub async fn write_frame<W>(writer: &mut W, opcode: Opcode, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut header = Vec::with_capacity(10);
    header.push(0x80 | opcode.bits());
    match payload.len() {
        n if n < 126 => header.push(n as u8),
        n if n <= u16::MAX as usize => {
            header.push(126);
            header.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            header.push(127);
            header.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Close payload: status code then a short UTF-8 reason.
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}
