//! Inter-service transport frame.
//!
//! Wire format (bit-exact):
//!
//! ```text
//!  +--------+----------------+----------------+
//!  | opcode |    length (4)  |   payload ...  |
//!  | 1 byte |  big-endian    |   length bytes |
//!  +--------+----------------+----------------+
//! ```
//!
//! The opcode enumeration is a compatible superset of the WebSocket control
//! codes so the same [`Frame`] abstraction layers over both transports.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Refuse frames larger than this; a well-behaved peer never sends them and
/// a corrupt length prefix must not trigger a giant allocation.
pub const MAX_PAYLOAD_LEN: usize = 4 << 20;

/// Frame opcode. Values match RFC 6455 control codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xa,
}

impl TryFrom<u8> for OpCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xa => Ok(OpCode::Pong),
            other => Err(WireError::UnknownOpCode(other)),
        }
    }
}

/// An opcode plus an opaque payload. The payload is uninterpreted at this
/// layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: Vec<u8>) -> Self {
        Frame { opcode, payload }
    }

    pub fn binary(payload: Vec<u8>) -> Self {
        Frame::new(OpCode::Binary, payload)
    }

    pub fn pong() -> Self {
        Frame::new(OpCode::Pong, Vec::new())
    }
}

/// Errors arising from frame and packet codecs.
#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unknown opcode 0x{0:x}")]
    UnknownOpCode(u8),
    #[error("frame payload of {0} bytes exceeds the {MAX_PAYLOAD_LEN} byte limit")]
    FrameTooLarge(usize),
    #[error("bad magic marker")]
    BadMagic,
    #[error("unsupported packet version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown packet flag 0x{0:x}")]
    UnknownFlag(u8),
    #[error("truncated packet")]
    Truncated,
    #[error("header decode: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Read one frame, blocking until it is complete. Failures propagate the
/// underlying I/O error; there is no in-band error framing.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, WireError>
where
    R: AsyncRead + Unpin,
{
    let opcode = OpCode::try_from(reader.read_u8().await?)?;
    let len = reader.read_u32().await? as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Frame { opcode, payload })
}

/// Write one frame. Buffered writers require a flush after a batch.
pub async fn write_frame<W>(writer: &mut W, opcode: OpCode, payload: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u8(opcode as u8).await?;
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip_preserves_opcode_and_payload() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, OpCode::Binary, b"hello").await.unwrap();
        write_frame(&mut client, OpCode::Ping, &[]).await.unwrap();

        let first = read_frame(&mut server).await.unwrap();
        assert_eq!(first.opcode, OpCode::Binary);
        assert_eq!(first.payload, b"hello");

        let second = read_frame(&mut server).await.unwrap();
        assert_eq!(second.opcode, OpCode::Ping);
        assert!(second.payload.is_empty());
    }

    #[tokio::test]
    async fn frame_layout_is_opcode_then_big_endian_length() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, OpCode::Binary, b"ab").await.unwrap();

        let mut raw = [0u8; 7];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut raw).await.unwrap();
        assert_eq!(raw, [0x2, 0x00, 0x00, 0x00, 0x02, b'a', b'b']);
    }

    #[tokio::test]
    async fn unknown_opcode_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &[0x5, 0, 0, 0, 0]).await.unwrap();

        match read_frame(&mut server).await {
            Err(WireError::UnknownOpCode(0x5)) => {}
            other => panic!("expected UnknownOpCode, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected_without_allocating() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &[0x2, 0xff, 0xff, 0xff, 0xff])
            .await
            .unwrap();

        match read_frame(&mut server).await {
            Err(WireError::FrameTooLarge(_)) => {}
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }
}
