//! Accepting side of the fabric: listens on one address, hands fresh
//! connections to the Acceptor for handshake, registers the resulting
//! channel and runs its read loop until teardown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hermod_proto::OpCode;

use crate::channel::{Channel, ChannelError, MessageListener};
use crate::channels::ChannelMap;
use crate::conn::FramedConn;
use crate::naming::ServiceDescriptor;
use crate::{DEFAULT_LOGIN_WAIT, DEFAULT_READ_WAIT, DEFAULT_WRITE_WAIT};

/// Close reason sent when a second connection claims a live channel id.
pub const REASON_DUPLICATE_CHANNEL: &str = "channelId is repeated";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("StateListener is nil")]
    StateListenerRequired,
    #[error("MessageListener is nil")]
    MessageListenerRequired,
    #[error("listen {0}: {1}")]
    Bind(String, std::io::Error),
    #[error("listen exited")]
    ListenExited,
    #[error("channel no found")]
    ChannelNotFound,
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Edge transport of a server, chosen once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Ws,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Ws => "ws",
        }
    }
}

/// Performs handshake/authentication on a fresh connection and yields the
/// application-assigned channel id.
#[async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept(
        &self,
        conn: &mut FramedConn,
        login_wait: Duration,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>>;
}

/// Notified after a channel leaves the registry.
#[async_trait]
pub trait StateListener: Send + Sync {
    async fn disconnect(&self, channel_id: &str);
}

/// Fallback acceptor: admits everyone under a freshly generated unique id.
struct DefaultAcceptor;

#[async_trait]
impl Acceptor for DefaultAcceptor {
    async fn accept(
        &self,
        _conn: &mut FramedConn,
        _login_wait: Duration,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        Ok(uuid::Uuid::new_v4().to_string())
    }
}

pub struct Server {
    listen: String,
    protocol: Protocol,
    descriptor: ServiceDescriptor,
    channels: Arc<ChannelMap>,
    acceptor: RwLock<Option<Arc<dyn Acceptor>>>,
    message_listener: RwLock<Option<Arc<dyn MessageListener>>>,
    state_listener: RwLock<Option<Arc<dyn StateListener>>>,
    login_wait_ms: AtomicU64,
    read_wait_ms: AtomicU64,
    write_wait_ms: AtomicU64,
    quit: CancellationToken,
    local_addr: OnceCell<SocketAddr>,
    shutdown_once: AtomicBool,
}

impl Server {
    pub fn new(listen: &str, protocol: Protocol, descriptor: ServiceDescriptor) -> Self {
        Server {
            listen: listen.to_owned(),
            protocol,
            descriptor,
            channels: Arc::new(ChannelMap::new()),
            acceptor: RwLock::new(None),
            message_listener: RwLock::new(None),
            state_listener: RwLock::new(None),
            login_wait_ms: AtomicU64::new(DEFAULT_LOGIN_WAIT.as_millis() as u64),
            read_wait_ms: AtomicU64::new(DEFAULT_READ_WAIT.as_millis() as u64),
            write_wait_ms: AtomicU64::new(DEFAULT_WRITE_WAIT.as_millis() as u64),
            quit: CancellationToken::new(),
            local_addr: OnceCell::new(),
            shutdown_once: AtomicBool::new(false),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn service_name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn set_acceptor(&self, acceptor: Arc<dyn Acceptor>) {
        *self.acceptor.write() = Some(acceptor);
    }

    pub fn set_message_listener(&self, listener: Arc<dyn MessageListener>) {
        *self.message_listener.write() = Some(listener);
    }

    pub fn set_state_listener(&self, listener: Arc<dyn StateListener>) {
        *self.state_listener.write() = Some(listener);
    }

    pub fn set_read_wait(&self, wait: Duration) {
        if !wait.is_zero() {
            self.read_wait_ms.store(wait.as_millis() as u64, Ordering::Relaxed);
        }
    }

    pub fn channels(&self) -> &ChannelMap {
        &self.channels
    }

    /// Bound address, available once `start` has passed the bind.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Bind and run the accept loop until shutdown. Each accepted connection
    /// runs its handshake and read loop on its own task.
    pub async fn start(self: Arc<Self>) -> Result<(), ServerError> {
        if self.state_listener.read().is_none() {
            return Err(ServerError::StateListenerRequired);
        }
        if self.message_listener.read().is_none() {
            return Err(ServerError::MessageListenerRequired);
        }
        if self.acceptor.read().is_none() {
            *self.acceptor.write() = Some(Arc::new(DefaultAcceptor));
        }

        let listener = TcpListener::bind(&self.listen)
            .await
            .map_err(|e| ServerError::Bind(self.listen.clone(), e))?;
        if let Ok(addr) = listener.local_addr() {
            let _ = self.local_addr.set(addr);
        }
        info!(listen = %self.listen, id = %self.descriptor.id, protocol = self.protocol.as_str(), "started");

        loop {
            tokio::select! {
                _ = self.quit.cancelled() => return Err(ServerError::ListenExited),
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer).await;
                    });
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let mut conn = match self.protocol {
            Protocol::Tcp => FramedConn::stream(stream),
            Protocol::Ws => match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => FramedConn::ws(ws),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "websocket upgrade failed");
                    return;
                }
            },
        };

        let acceptor = self.acceptor.read().clone();
        let message_listener = self.message_listener.read().clone();
        let state_listener = self.state_listener.read().clone();
        let (Some(acceptor), Some(message_listener), Some(state_listener)) =
            (acceptor, message_listener, state_listener)
        else {
            return;
        };

        let login_wait = Duration::from_millis(self.login_wait_ms.load(Ordering::Relaxed));
        let id = match acceptor.accept(&mut conn, login_wait).await {
            Ok(id) => id,
            Err(e) => {
                let _ = conn.write_frame(OpCode::Close, e.to_string().as_bytes()).await;
                let _ = conn.flush().await;
                return;
            }
        };

        if self.channels.get(&id).is_some() {
            warn!(id = %id, "channel existed");
            let _ = conn
                .write_frame(OpCode::Close, REASON_DUPLICATE_CHANNEL.as_bytes())
                .await;
            let _ = conn.flush().await;
            return;
        }

        let channel = Channel::new(&id, conn);
        channel.set_read_wait(Duration::from_millis(self.read_wait_ms.load(Ordering::Relaxed)));
        channel.set_write_wait(Duration::from_millis(self.write_wait_ms.load(Ordering::Relaxed)));
        self.channels.add(channel.clone());
        info!(id = %id, peer = %peer, "accept");

        if let Err(e) = channel.clone().read_loop(message_listener).await {
            debug!(id = %id, error = %e, "read loop ended");
        }
        self.channels.remove(&id);
        state_listener.disconnect(&id).await;
        channel.close();
    }

    /// At-most-once. Closes every channel, giving the whole sweep at most
    /// `wait`; the iteration aborts when the deadline expires.
    pub async fn shutdown(&self, wait: Duration) -> Result<(), ServerError> {
        if self.shutdown_once.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.quit.cancel();

        let deadline = tokio::time::Instant::now() + wait;
        for channel in self.channels.all() {
            channel.close();
            self.channels.remove(channel.id());
            if tokio::time::Instant::now() >= deadline {
                warn!("shutdown deadline expired before all channels closed");
                break;
            }
        }
        info!(id = %self.descriptor.id, "shutdown");
        Ok(())
    }

    /// Deliver a payload to the channel registered under `channel_id`.
    pub async fn push(&self, channel_id: &str, payload: Vec<u8>) -> Result<(), ServerError> {
        let channel = self.channels.get(channel_id).ok_or(ServerError::ChannelNotFound)?;
        channel.push(payload).await?;
        Ok(())
    }
}
