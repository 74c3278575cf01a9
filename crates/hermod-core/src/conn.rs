//! Framed connection halves over either transport.
//!
//! The fabric is transport-agnostic: everything above this module speaks
//! [`Frame`]s through the [`FrameReader`]/[`FrameWriter`] trait objects, and
//! the single selection point between the length-prefixed TCP stream and
//! WebSocket is the [`FramedConn`] constructor.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use hermod_proto::{frame, Frame, OpCode, WireError};

#[derive(Debug, Error)]
pub enum ConnError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error("opcode {0:?} cannot be written on this transport")]
    Unsupported(OpCode),
}

/// Read side of a framed connection.
#[async_trait]
pub trait FrameReader: Send {
    /// Block until one frame arrives. Malformed framing or transport
    /// failures surface as errors.
    async fn read_frame(&mut self) -> Result<Frame, ConnError>;
}

/// Write side of a framed connection. Writes may be buffered; callers flush
/// after a batch.
#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), ConnError>;
    async fn flush(&mut self) -> Result<(), ConnError>;
}

// ---------------------------------------------------------------------------
// Length-prefixed byte stream transport
// ---------------------------------------------------------------------------

pub struct StreamFrameReader<R> {
    inner: BufReader<R>,
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameReader for StreamFrameReader<R> {
    async fn read_frame(&mut self) -> Result<Frame, ConnError> {
        Ok(frame::read_frame(&mut self.inner).await?)
    }
}

pub struct StreamFrameWriter<W> {
    inner: BufWriter<W>,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWriter for StreamFrameWriter<W> {
    async fn write_frame(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), ConnError> {
        Ok(frame::write_frame(&mut self.inner, opcode, payload).await?)
    }

    async fn flush(&mut self) -> Result<(), ConnError> {
        use tokio::io::AsyncWriteExt;
        self.inner.flush().await.map_err(WireError::from)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

pub struct WsFrameReader<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> FrameReader for WsFrameReader<S> {
    async fn read_frame(&mut self) -> Result<Frame, ConnError> {
        match self.inner.next().await {
            None => Err(ConnError::Closed),
            Some(Err(e)) => Err(ConnError::Ws(e)),
            Some(Ok(msg)) => Ok(match msg {
                Message::Binary(b) => Frame::new(OpCode::Binary, b.to_vec()),
                Message::Text(t) => Frame::new(OpCode::Text, t.as_bytes().to_vec()),
                Message::Ping(b) => Frame::new(OpCode::Ping, b.to_vec()),
                Message::Pong(b) => Frame::new(OpCode::Pong, b.to_vec()),
                Message::Close(reason) => Frame::new(
                    OpCode::Close,
                    reason
                        .map(|cf| cf.reason.as_bytes().to_vec())
                        .unwrap_or_default(),
                ),
                // Raw frames never surface from a read.
                Message::Frame(_) => Frame::new(OpCode::Continuation, Vec::new()),
            }),
        }
    }
}

pub struct WsFrameWriter<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> FrameWriter for WsFrameWriter<S> {
    async fn write_frame(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), ConnError> {
        let msg = match opcode {
            OpCode::Binary => Message::Binary(payload.to_vec().into()),
            OpCode::Text => Message::Text(String::from_utf8_lossy(payload).into_owned().into()),
            OpCode::Ping => Message::Ping(payload.to_vec().into()),
            OpCode::Pong => Message::Pong(payload.to_vec().into()),
            OpCode::Close => Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: String::from_utf8_lossy(payload).into_owned().into(),
            })),
            OpCode::Continuation => return Err(ConnError::Unsupported(opcode)),
        };
        // Buffer without flushing so batches coalesce like the TCP path.
        self.inner.feed(msg).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), ConnError> {
        self.inner.flush().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FramedConn
// ---------------------------------------------------------------------------

/// Both halves of a framed connection, before they part ways. Acceptors and
/// dialers use it whole for the handshake; the channel splits it afterwards.
pub struct FramedConn {
    reader: Box<dyn FrameReader>,
    writer: Box<dyn FrameWriter>,
}

impl FramedConn {
    /// Frame a raw byte stream (TCP, or an in-memory duplex in tests) with
    /// the length-prefixed codec.
    pub fn stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        FramedConn {
            reader: Box::new(StreamFrameReader { inner: BufReader::new(r) }),
            writer: Box::new(StreamFrameWriter { inner: BufWriter::new(w) }),
        }
    }

    /// Frame an established WebSocket stream (either side of the upgrade).
    pub fn ws<S>(stream: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = stream.split();
        FramedConn {
            reader: Box::new(WsFrameReader { inner: source }),
            writer: Box::new(WsFrameWriter { inner: sink }),
        }
    }

    pub async fn read_frame(&mut self) -> Result<Frame, ConnError> {
        self.reader.read_frame().await
    }

    pub async fn write_frame(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), ConnError> {
        self.writer.write_frame(opcode, payload).await
    }

    pub async fn flush(&mut self) -> Result<(), ConnError> {
        self.writer.flush().await
    }

    pub fn split(self) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        (self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn framed_stream_roundtrip_requires_flush() {
        let (client, server) = tokio::io::duplex(4096);
        let mut a = FramedConn::stream(client);
        let mut b = FramedConn::stream(server);

        a.write_frame(OpCode::Binary, b"one").await.unwrap();
        a.write_frame(OpCode::Binary, b"two").await.unwrap();
        a.flush().await.unwrap();

        assert_eq!(b.read_frame().await.unwrap().payload, b"one");
        assert_eq!(b.read_frame().await.unwrap().payload, b"two");
    }
}
