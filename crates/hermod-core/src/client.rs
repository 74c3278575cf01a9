//! Outbound client: a live framed connection to a remote service node.
//!
//! The dial and application handshake are delegated to an injected
//! [`Dialer`], so the same client drives both the inter-service TCP link and
//! a WebSocket edge (mock/test terminals). Frame writes serialize under the
//! send mutex; an optional heartbeat task keeps idle links alive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use hermod_proto::messages::InnerHandshakeReq;
use hermod_proto::{Frame, OpCode};

use crate::conn::{ConnError, FrameReader, FrameWriter, FramedConn};
use crate::naming::ServiceDescriptor;
use crate::{DEFAULT_LOGIN_WAIT, DEFAULT_READ_WAIT, DEFAULT_WRITE_WAIT};

const STATE_DISCONNECTED: u8 = 0;
const STATE_CONNECTED: u8 = 1;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client has connected")]
    AlreadyConnected,
    #[error("connection is nil")]
    NotConnected,
    #[error("dial {0}: {1}")]
    Dial(String, String),
    #[error("remote side closed the channel")]
    PeerClosed,
    #[error("read wait expired")]
    ReadTimeout,
    #[error("write wait expired")]
    WriteTimeout,
    #[error(transparent)]
    Conn(#[from] ConnError),
}

/// Everything a dialer needs to reach and introduce itself to a peer.
pub struct DialContext {
    /// Id of the client being connected (the remote service instance).
    pub id: String,
    pub name: String,
    pub address: String,
    pub timeout: Duration,
}

/// Performs the transport dial plus the application handshake, returning a
/// framed connection ready for traffic.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial_and_handshake(&self, ctx: DialContext) -> Result<FramedConn, ClientError>;
}

/// The canonical inter-service dialer: TCP connect, then one Binary frame
/// carrying the caller's service id so the peer can account for the link.
pub struct TcpDialer {
    service_id: String,
}

impl TcpDialer {
    pub fn new(service_id: &str) -> Self {
        TcpDialer { service_id: service_id.to_owned() }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial_and_handshake(&self, ctx: DialContext) -> Result<FramedConn, ClientError> {
        let stream = timeout(ctx.timeout, TcpStream::connect(&ctx.address))
            .await
            .map_err(|_| ClientError::Dial(ctx.address.clone(), "connect timed out".to_owned()))?
            .map_err(|e| ClientError::Dial(ctx.address.clone(), e.to_string()))?;

        let mut conn = FramedConn::stream(stream);
        let req = InnerHandshakeReq { service_id: self.service_id.clone() };
        conn.write_frame(OpCode::Binary, &prost::Message::encode_to_vec(&req)).await?;
        conn.flush().await?;
        Ok(conn)
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Zero disables the ping task.
    pub heartbeat: Duration,
    pub read_wait: Duration,
    pub write_wait: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            heartbeat: Duration::ZERO,
            read_wait: DEFAULT_READ_WAIT,
            write_wait: DEFAULT_WRITE_WAIT,
        }
    }
}

type SharedWriter = Arc<Mutex<Option<Box<dyn FrameWriter>>>>;

pub struct Client {
    descriptor: ServiceDescriptor,
    meta: RwLock<HashMap<String, String>>,
    state: AtomicU8,
    closed: AtomicBool,
    dialer: RwLock<Option<Arc<dyn Dialer>>>,
    reader: Mutex<Option<Box<dyn FrameReader>>>,
    writer: SharedWriter,
    heartbeat_stop: CancellationToken,
    options: ClientOptions,
}

impl Client {
    pub fn new(id: &str, name: &str, options: ClientOptions) -> Self {
        Client::with_meta(id, name, HashMap::new(), options)
    }

    pub fn with_meta(
        id: &str,
        name: &str,
        meta: HashMap<String, String>,
        options: ClientOptions,
    ) -> Self {
        Client {
            descriptor: ServiceDescriptor::new(id, name),
            meta: RwLock::new(meta),
            state: AtomicU8::new(STATE_DISCONNECTED),
            closed: AtomicBool::new(false),
            dialer: RwLock::new(None),
            reader: Mutex::new(None),
            writer: Arc::new(Mutex::new(None)),
            heartbeat_stop: CancellationToken::new(),
            options,
        }
    }

    pub fn service_id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn service_name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn get_meta(&self, key: &str) -> Option<String> {
        self.meta.read().get(key).cloned()
    }

    pub fn set_meta(&self, key: &str, value: &str) {
        self.meta.write().insert(key.to_owned(), value.to_owned());
    }

    /// Snapshot of this client as a service descriptor, with the live
    /// metadata.
    pub fn descriptor(&self) -> ServiceDescriptor {
        let mut descriptor = self.descriptor.clone();
        descriptor.meta = self.meta.read().clone();
        descriptor
    }

    pub fn set_dialer(&self, dialer: Arc<dyn Dialer>) {
        *self.dialer.write() = Some(dialer);
    }

    /// CAS disconnected -> connected; a second connect fails. The heartbeat
    /// task starts here when the interval is positive.
    pub async fn connect(&self, addr: &str) -> Result<(), ClientError> {
        if self
            .state
            .compare_exchange(
                STATE_DISCONNECTED,
                STATE_CONNECTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(ClientError::AlreadyConnected);
        }

        let dialer = self.dialer.read().clone();
        let Some(dialer) = dialer else {
            self.state.store(STATE_DISCONNECTED, Ordering::Release);
            return Err(ClientError::Dial(addr.to_owned(), "dialer is nil".to_owned()));
        };

        let ctx = DialContext {
            id: self.descriptor.id.clone(),
            name: self.descriptor.name.clone(),
            address: addr.to_owned(),
            timeout: DEFAULT_LOGIN_WAIT,
        };
        let conn = match dialer.dial_and_handshake(ctx).await {
            Ok(conn) => conn,
            Err(e) => {
                self.state.store(STATE_DISCONNECTED, Ordering::Release);
                return Err(e);
            }
        };

        let (reader, writer) = conn.split();
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);

        if !self.options.heartbeat.is_zero() {
            let id = self.descriptor.id.clone();
            let writer = self.writer.clone();
            let interval = self.options.heartbeat;
            let write_wait = self.options.write_wait;
            let stop = self.heartbeat_stop.clone();
            tokio::spawn(async move {
                if let Err(e) = heartbeat_loop(&id, writer, interval, write_wait, stop).await {
                    warn!(id = %id, error = %e, "heartbeat loop stopped");
                }
            });
        }
        Ok(())
    }

    /// Write one Binary frame under the send mutex.
    pub async fn send(&self, payload: &[u8]) -> Result<(), ClientError> {
        if self.state.load(Ordering::Acquire) != STATE_CONNECTED {
            return Err(ClientError::NotConnected);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ClientError::NotConnected)?;
        timeout(self.options.write_wait, writer.write_frame(OpCode::Binary, payload))
            .await
            .map_err(|_| ClientError::WriteTimeout)??;
        timeout(self.options.write_wait, writer.flush())
            .await
            .map_err(|_| ClientError::WriteTimeout)??;
        Ok(())
    }

    /// Read one frame. A Close opcode maps to an error; with heartbeats
    /// enabled the read deadline is refreshed before every read.
    pub async fn read(&self) -> Result<Frame, ClientError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(ClientError::NotConnected)?;
        let frame = if self.options.heartbeat.is_zero() {
            reader.read_frame().await?
        } else {
            timeout(self.options.read_wait, reader.read_frame())
                .await
                .map_err(|_| ClientError::ReadTimeout)??
        };
        if frame.opcode == OpCode::Close {
            return Err(ClientError::PeerClosed);
        }
        Ok(frame)
    }

    /// Idempotent: one graceful Close frame, then the connection is dropped
    /// and the state resets.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.heartbeat_stop.cancel();
        {
            let mut guard = self.writer.lock().await;
            if let Some(writer) = guard.as_mut() {
                let _ = timeout(self.options.write_wait, writer.write_frame(OpCode::Close, &[])).await;
                let _ = timeout(self.options.write_wait, writer.flush()).await;
            }
            *guard = None;
        }
        *self.reader.lock().await = None;
        let _ = self.state.compare_exchange(
            STATE_CONNECTED,
            STATE_DISCONNECTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

async fn heartbeat_loop(
    id: &str,
    writer: SharedWriter,
    interval: Duration,
    write_wait: Duration,
    stop: CancellationToken,
) -> Result<(), ClientError> {
    let mut tick = tokio::time::interval(interval);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            _ = tick.tick() => {}
        }
        trace!(id = %id, "send ping to server");
        let mut guard = writer.lock().await;
        let Some(writer) = guard.as_mut() else { return Ok(()) };
        timeout(write_wait, writer.write_frame(OpCode::Ping, &[]))
            .await
            .map_err(|_| ClientError::WriteTimeout)??;
        timeout(write_wait, writer.flush())
            .await
            .map_err(|_| ClientError::WriteTimeout)??;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LoopbackDialer {
        conn: std::sync::Mutex<Option<FramedConn>>,
    }

    #[async_trait]
    impl Dialer for LoopbackDialer {
        async fn dial_and_handshake(&self, _ctx: DialContext) -> Result<FramedConn, ClientError> {
            self.conn
                .lock()
                .unwrap()
                .take()
                .ok_or(ClientError::NotConnected)
        }
    }

    fn loopback_client(options: ClientOptions) -> (Arc<Client>, FramedConn) {
        let (local, remote) = tokio::io::duplex(4096);
        let client = Arc::new(Client::new("svc_1", "svc", options));
        client.set_dialer(Arc::new(LoopbackDialer {
            conn: std::sync::Mutex::new(Some(FramedConn::stream(local))),
        }));
        (client, FramedConn::stream(remote))
    }

    #[tokio::test]
    async fn second_connect_fails_with_already_connected() {
        let (client, _peer) = loopback_client(ClientOptions::default());
        client.connect("loopback").await.unwrap();
        assert!(matches!(
            client.connect("loopback").await,
            Err(ClientError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn send_writes_binary_frames_and_read_maps_close_to_error() {
        let (client, mut peer) = loopback_client(ClientOptions::default());
        client.connect("loopback").await.unwrap();

        client.send(b"payload").await.unwrap();
        let frame = peer.read_frame().await.unwrap();
        assert_eq!(frame.opcode, OpCode::Binary);
        assert_eq!(frame.payload, b"payload");

        peer.write_frame(OpCode::Close, &[]).await.unwrap();
        peer.flush().await.unwrap();
        assert!(matches!(client.read().await, Err(ClientError::PeerClosed)));
    }

    #[tokio::test]
    async fn heartbeat_pings_arrive_on_the_interval() {
        let (client, mut peer) = loopback_client(ClientOptions {
            heartbeat: Duration::from_millis(20),
            ..ClientOptions::default()
        });
        client.connect("loopback").await.unwrap();

        for _ in 0..3 {
            let frame = peer.read_frame().await.unwrap();
            assert_eq!(frame.opcode, OpCode::Ping);
        }
        client.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_emits_one_close_frame() {
        let (client, mut peer) = loopback_client(ClientOptions::default());
        client.connect("loopback").await.unwrap();

        client.close().await;
        client.close().await;

        let frame = peer.read_frame().await.unwrap();
        assert_eq!(frame.opcode, OpCode::Close);
        assert!(matches!(client.send(b"x").await, Err(ClientError::NotConnected)));
        assert!(peer.read_frame().await.is_err());
    }
}
