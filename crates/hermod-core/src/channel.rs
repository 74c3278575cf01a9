//! A named live connection to one peer, with queued writes and a read loop.
//!
//! Exactly one writer task drains the outbound queue, so pushes on a single
//! channel reach the wire in FIFO order. The read loop runs on the caller's
//! task and hands every data frame to the message listener on a spawned
//! task, capped by a per-channel semaphore so a misbehaving peer cannot fan
//! out unboundedly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use hermod_proto::{Frame, OpCode};

use crate::conn::{ConnError, FrameReader, FrameWriter, FramedConn};
use crate::{DEFAULT_READ_WAIT, DEFAULT_WRITE_WAIT};

/// Outbound queue depth. Small on purpose: a full queue back-pressures
/// producers instead of buffering without bound.
const WRITE_QUEUE_CAP: usize = 5;

/// Upper bound on concurrently running listener tasks per channel.
const LISTENER_TASK_CAP: usize = 32;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel {0} is closed")]
    Closed(String),
    #[error("read loop is already running on this channel")]
    ReaderTaken,
    #[error("read wait expired")]
    ReadTimeout,
    #[error("write wait expired")]
    WriteTimeout,
    #[error("remote side closed the channel")]
    PeerClosed,
    #[error(transparent)]
    Conn(#[from] ConnError),
}

/// The peer-facing view of a channel handed to message listeners.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;
    async fn push(&self, payload: Vec<u8>) -> Result<(), ChannelError>;
}

/// Receives inbound data frames. Each call runs on its own task.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn receive(&self, agent: Arc<dyn Agent>, payload: Vec<u8>);
}

pub struct Channel {
    id: String,
    data_tx: mpsc::Sender<Vec<u8>>,
    control_tx: mpsc::UnboundedSender<Frame>,
    closed: CancellationToken,
    reader: Mutex<Option<Box<dyn FrameReader>>>,
    read_wait_ms: AtomicU64,
    write_wait_ms: Arc<AtomicU64>,
    listener_permits: Arc<Semaphore>,
}

impl Channel {
    /// Wrap a connection. Spawns the single writer task immediately.
    pub fn new(id: &str, conn: FramedConn) -> Arc<Channel> {
        let (reader, writer) = conn.split();
        let (data_tx, data_rx) = mpsc::channel(WRITE_QUEUE_CAP);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let write_wait_ms = Arc::new(AtomicU64::new(DEFAULT_WRITE_WAIT.as_millis() as u64));

        let channel = Arc::new(Channel {
            id: id.to_owned(),
            data_tx,
            control_tx,
            closed: closed.clone(),
            reader: Mutex::new(Some(reader)),
            read_wait_ms: AtomicU64::new(DEFAULT_READ_WAIT.as_millis() as u64),
            write_wait_ms: write_wait_ms.clone(),
            listener_permits: Arc::new(Semaphore::new(LISTENER_TASK_CAP)),
        });

        let task_id = channel.id.clone();
        tokio::spawn(async move {
            if let Err(e) = write_loop(writer, data_rx, control_rx, closed, write_wait_ms).await {
                debug!(id = %task_id, error = %e, "write loop stopped");
            }
        });

        channel
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Zero durations are ignored, matching the option semantics of the
    /// constructors that call this with unset config values.
    pub fn set_write_wait(&self, wait: Duration) {
        if !wait.is_zero() {
            self.write_wait_ms.store(wait.as_millis() as u64, Ordering::Relaxed);
        }
    }

    pub fn set_read_wait(&self, wait: Duration) {
        if !wait.is_zero() {
            self.read_wait_ms.store(wait.as_millis() as u64, Ordering::Relaxed);
        }
    }

    fn read_wait(&self) -> Duration {
        Duration::from_millis(self.read_wait_ms.load(Ordering::Relaxed))
    }

    /// Enqueue a payload for asynchronous write. Blocks while the queue is
    /// full; fails once the channel is closed.
    pub async fn push(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed(self.id.clone()));
        }
        self.data_tx
            .send(payload)
            .await
            .map_err(|_| ChannelError::Closed(self.id.clone()))
    }

    /// Idempotent. Fires the closed event; the writer task emits exactly one
    /// graceful Close frame before it exits.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Signalled once [`Channel::close`] has been called.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Run the read loop on the calling task until the peer disappears, the
    /// read wait expires, or the channel closes. Only one read loop may ever
    /// run per channel.
    pub async fn read_loop(
        self: Arc<Self>,
        listener: Arc<dyn MessageListener>,
    ) -> Result<(), ChannelError> {
        let mut reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(ChannelError::ReaderTaken)?;

        loop {
            let frame = tokio::select! {
                _ = self.closed.cancelled() => return Ok(()),
                read = timeout(self.read_wait(), reader.read_frame()) => match read {
                    Err(_) => return Err(ChannelError::ReadTimeout),
                    Ok(Err(e)) => return Err(e.into()),
                    Ok(Ok(frame)) => frame,
                },
            };

            match frame.opcode {
                OpCode::Ping => {
                    trace!(id = %self.id, "recv a ping; resp with a pong");
                    let _ = self.control_tx.send(Frame::pong());
                }
                OpCode::Close => return Err(ChannelError::PeerClosed),
                OpCode::Binary => {
                    if frame.payload.is_empty() {
                        continue;
                    }
                    // Deliver off the read path so a slow handler never
                    // stalls the socket.
                    if let Ok(permit) = self.listener_permits.clone().acquire_owned().await {
                        let agent: Arc<dyn Agent> = self.clone();
                        let listener = listener.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            listener.receive(agent, frame.payload).await;
                        });
                    }
                }
                _ => {}
            }
        }
    }
}

#[async_trait]
impl Agent for Channel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn push(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
        Channel::push(self, payload).await
    }
}

fn write_wait_of(ms: &AtomicU64) -> Duration {
    Duration::from_millis(ms.load(Ordering::Relaxed))
}

async fn write_one(
    writer: &mut Box<dyn FrameWriter>,
    opcode: OpCode,
    payload: &[u8],
    wait: Duration,
) -> Result<(), ChannelError> {
    timeout(wait, writer.write_frame(opcode, payload))
        .await
        .map_err(|_| ChannelError::WriteTimeout)??;
    Ok(())
}

/// The single writer task. Waits on the payload queue, the control queue
/// (pong replies) and the closed event. Data writes batch: drain whatever is
/// already queued without flushing between frames, then flush once. On any
/// write error mid-batch, stop and return without attempting the flush.
async fn write_loop(
    mut writer: Box<dyn FrameWriter>,
    mut data_rx: mpsc::Receiver<Vec<u8>>,
    mut control_rx: mpsc::UnboundedReceiver<Frame>,
    closed: CancellationToken,
    write_wait_ms: Arc<AtomicU64>,
) -> Result<(), ChannelError> {
    loop {
        let wait = write_wait_of(&write_wait_ms);
        tokio::select! {
            biased;
            _ = closed.cancelled() => {
                let _ = timeout(wait, writer.write_frame(OpCode::Close, &[])).await;
                let _ = timeout(wait, writer.flush()).await;
                return Ok(());
            }
            Some(frame) = control_rx.recv() => {
                write_one(&mut writer, frame.opcode, &frame.payload, wait).await?;
                timeout(wait, writer.flush()).await.map_err(|_| ChannelError::WriteTimeout)??;
            }
            maybe = data_rx.recv() => {
                let Some(payload) = maybe else { return Ok(()) };
                write_one(&mut writer, OpCode::Binary, &payload, wait).await?;
                while let Ok(next) = data_rx.try_recv() {
                    write_one(&mut writer, OpCode::Binary, &next, wait).await?;
                }
                timeout(wait, writer.flush()).await.map_err(|_| ChannelError::WriteTimeout)??;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermod_proto::OpCode;

    struct NullListener;

    #[async_trait]
    impl MessageListener for NullListener {
        async fn receive(&self, _agent: Arc<dyn Agent>, _payload: Vec<u8>) {}
    }

    #[tokio::test]
    async fn pushes_reach_the_peer_in_fifo_order() {
        let (local, remote) = tokio::io::duplex(4096);
        let channel = Channel::new("c1", FramedConn::stream(local));
        let mut peer = FramedConn::stream(remote);

        for i in 0..20u8 {
            channel.push(vec![i]).await.unwrap();
        }

        for i in 0..20u8 {
            let frame = peer.read_frame().await.unwrap();
            assert_eq!(frame.opcode, OpCode::Binary);
            assert_eq!(frame.payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_emits_one_close_frame() {
        let (local, remote) = tokio::io::duplex(4096);
        let channel = Channel::new("c1", FramedConn::stream(local));
        let mut peer = FramedConn::stream(remote);

        let mut joins = Vec::new();
        for _ in 0..8 {
            let ch = channel.clone();
            joins.push(tokio::spawn(async move { ch.close() }));
        }
        for join in joins {
            join.await.unwrap();
        }

        let frame = peer.read_frame().await.unwrap();
        assert_eq!(frame.opcode, OpCode::Close);
        assert!(channel.push(b"late".to_vec()).await.is_err());

        // The writer exits after the single close frame; once the channel is
        // gone the peer sees end-of-stream rather than a second one.
        drop(channel);
        assert!(peer.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn ping_gets_a_pong_and_close_ends_the_loop() {
        let (local, remote) = tokio::io::duplex(4096);
        let channel = Channel::new("c1", FramedConn::stream(local));
        let mut peer = FramedConn::stream(remote);

        let reader = channel.clone();
        let join =
            tokio::spawn(async move { reader.read_loop(Arc::new(NullListener)).await });

        peer.write_frame(OpCode::Ping, &[]).await.unwrap();
        peer.flush().await.unwrap();
        assert_eq!(peer.read_frame().await.unwrap().opcode, OpCode::Pong);

        peer.write_frame(OpCode::Close, &[]).await.unwrap();
        peer.flush().await.unwrap();
        assert!(matches!(join.await.unwrap(), Err(ChannelError::PeerClosed)));
    }

    #[tokio::test]
    async fn second_read_loop_is_rejected() {
        let (local, _remote) = tokio::io::duplex(4096);
        let channel = Channel::new("c1", FramedConn::stream(local));

        let runner = channel.clone();
        tokio::spawn(async move { runner.read_loop(Arc::new(NullListener)).await });
        tokio::task::yield_now().await;

        match channel.read_loop(Arc::new(NullListener)).await {
            Err(ChannelError::ReaderTaken) => {}
            other => panic!("expected ReaderTaken, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn idle_channel_times_out_after_read_wait() {
        let (local, _remote) = tokio::io::duplex(64);
        let channel = Channel::new("c1", FramedConn::stream(local));
        channel.set_read_wait(Duration::from_millis(50));

        let started = tokio::time::Instant::now();
        match channel.read_loop(Arc::new(NullListener)).await {
            Err(ChannelError::ReadTimeout) => {}
            other => panic!("expected ReadTimeout, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
