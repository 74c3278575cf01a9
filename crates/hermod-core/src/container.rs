//! Node composition and lifecycle: one hosted Server, a naming client, a
//! pool of outbound clients per dependency service, a selector, and the
//! forward/push plumbing between them.
//!
//! The lifecycle is a CAS-guarded state machine: Uninitialized ->
//! Initialized -> Started -> Closed. Duplicate transitions fail loudly.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use hermod_proto::{metakey, Packet, WireError};

use crate::client::{Client, ClientError, ClientOptions, Dialer};
use crate::clients::ClientMap;
use crate::naming::{Naming, NamingError, ServiceDescriptor};
use crate::selector::{HashSelector, Selector};
use crate::server::{Server, ServerError};
use crate::{DEFAULT_HEARTBEAT, DEFAULT_READ_WAIT, DEFAULT_WRITE_WAIT};

const STATE_UNINITIALIZED: u8 = 0;
const STATE_INITIALIZED: u8 = 1;
const STATE_STARTED: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// Metadata key tracking a discovered peer's readiness phase.
pub const KEY_SERVICE_STATE: &str = "service_state";
/// Freshly discovered; excluded from routing while registry propagation
/// settles.
pub const STATE_YOUNG: &str = "young";
/// Eligible for routing.
pub const STATE_ADULT: &str = "adult";

/// How long a discovered peer stays young.
pub const DEFAULT_YOUNG_GRACE: Duration = Duration::from_secs(10);

/// Budget for a graceful shutdown sweep.
pub const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("has initialized")]
    AlreadyInitialized,
    #[error("has started")]
    AlreadyStarted,
    #[error("has closed")]
    AlreadyClosed,
    #[error("naming is nil")]
    NamingRequired,
    #[error("dialer is nil")]
    DialerRequired,
    #[error("server is nil")]
    ServerRequired,
    #[error("command is empty in packet")]
    EmptyCommand,
    #[error("channel id is empty in packet")]
    EmptyChannelId,
    #[error("service {0} not found")]
    ServiceNotFound(String),
    #[error("no services found for {0}")]
    NoAvailableService(String),
    #[error("no client found for {0}")]
    ClientNotFound(String),
    #[error("unexpected service protocol: {0}")]
    UnexpectedProtocol(String),
    #[error("dest_server is incorrect, {got} != {expected}")]
    DestServerMismatch { expected: String, got: String },
    #[error("dest_channels is nil")]
    MissingDestChannels,
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Naming(#[from] NamingError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("signal handler: {0}")]
    Signal(std::io::Error),
}

pub struct Container {
    /// Self-handle so spawned tasks can hold the container alive.
    me: Weak<Container>,
    state: AtomicU8,
    srv: RwLock<Option<Arc<Server>>>,
    naming: RwLock<Option<Arc<dyn Naming>>>,
    dialer: RwLock<Option<Arc<dyn Dialer>>>,
    selector: RwLock<Arc<dyn Selector>>,
    deps: RwLock<HashSet<String>>,
    pools: RwLock<HashMap<String, Arc<ClientMap>>>,
    build_lock: Mutex<()>,
    young_grace_ms: AtomicU64,
}

impl Container {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Container {
            me: me.clone(),
            state: AtomicU8::new(STATE_UNINITIALIZED),
            srv: RwLock::new(None),
            naming: RwLock::new(None),
            dialer: RwLock::new(None),
            selector: RwLock::new(Arc::new(HashSelector)),
            deps: RwLock::new(HashSet::new()),
            pools: RwLock::new(HashMap::new()),
            build_lock: Mutex::new(()),
            young_grace_ms: AtomicU64::new(DEFAULT_YOUNG_GRACE.as_millis() as u64),
        })
    }

    fn handle(&self) -> Arc<Self> {
        self.me.upgrade().expect("container outlives its tasks")
    }

    /// Record the hosted server and the dependency service names. Must run
    /// exactly once before `start`.
    pub fn init(&self, srv: Arc<Server>, deps: &[&str]) -> Result<(), ContainerError> {
        if self
            .state
            .compare_exchange(
                STATE_UNINITIALIZED,
                STATE_INITIALIZED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(ContainerError::AlreadyInitialized);
        }
        info!(
            id = %srv.service_id(),
            name = %srv.service_name(),
            deps = ?deps,
            "container init"
        );
        *self.srv.write() = Some(srv);
        let mut set = self.deps.write();
        for dep in deps {
            set.insert((*dep).to_owned());
        }
        Ok(())
    }

    pub fn set_service_naming(&self, naming: Arc<dyn Naming>) {
        *self.naming.write() = Some(naming);
    }

    pub fn set_dialer(&self, dialer: Arc<dyn Dialer>) {
        *self.dialer.write() = Some(dialer);
    }

    pub fn set_selector(&self, selector: Arc<dyn Selector>) {
        *self.selector.write() = selector;
    }

    /// Shrink the young-to-adult window; tests use millisecond graces.
    pub fn set_young_grace(&self, grace: Duration) {
        self.young_grace_ms.store(grace.as_millis() as u64, Ordering::Relaxed);
    }

    fn young_grace(&self) -> Duration {
        Duration::from_millis(self.young_grace_ms.load(Ordering::Relaxed))
    }

    fn server(&self) -> Result<Arc<Server>, ContainerError> {
        self.srv.read().clone().ok_or(ContainerError::ServerRequired)
    }

    fn naming_client(&self) -> Result<Arc<dyn Naming>, ContainerError> {
        self.naming.read().clone().ok_or(ContainerError::NamingRequired)
    }

    /// Non-blocking half of `start`: spawn the server, connect to every
    /// dependency and register with the naming backend.
    pub async fn serve(&self) -> Result<(), ContainerError> {
        let naming = self.naming_client()?;
        let srv = self.server()?;

        if self
            .state
            .compare_exchange(
                STATE_INITIALIZED,
                STATE_STARTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(ContainerError::AlreadyStarted);
        }

        {
            let srv = srv.clone();
            tokio::spawn(async move {
                if let Err(e) = srv.start().await {
                    error!(error = %e, "server stopped");
                }
            });
        }

        let deps: Vec<String> = self.deps.read().iter().cloned().collect();
        for dep in deps {
            let container = self.handle();
            tokio::spawn(async move {
                if let Err(e) = container.connect_to_service(&dep).await {
                    error!(service = %dep, error = %e, "connect to service failed");
                }
            });
        }

        let descriptor = srv.descriptor();
        if !descriptor.address.is_empty() && descriptor.port != 0 {
            if let Err(e) = naming.register(descriptor).await {
                error!(error = %e, "service registration failed");
            }
        }
        Ok(())
    }

    /// Full lifecycle: serve, then block until a termination signal arrives
    /// and shut down.
    pub async fn start(self: Arc<Self>) -> Result<(), ContainerError> {
        self.serve().await?;
        let signal = wait_for_shutdown_signal()
            .await
            .map_err(ContainerError::Signal)?;
        info!(signal, "shutdown");
        self.shutdown().await
    }

    /// Graceful teardown: close the server, deregister, unsubscribe.
    pub async fn shutdown(&self) -> Result<(), ContainerError> {
        if self
            .state
            .compare_exchange(
                STATE_STARTED,
                STATE_CLOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(ContainerError::AlreadyClosed);
        }

        let srv = self.server()?;
        if let Err(e) = srv.shutdown(SHUTDOWN_WAIT).await {
            error!(error = %e, "server shutdown failed");
        }

        let naming = self.naming_client()?;
        if let Err(e) = naming.deregister(srv.service_id()).await {
            warn!(error = %e, "deregister failed");
        }
        let deps: Vec<String> = self.deps.read().iter().cloned().collect();
        for dep in deps {
            let _ = naming.unsubscribe(&dep).await;
        }
        info!("shutdown complete");
        Ok(())
    }

    /// Watch one dependency: every membership change lands new peers in the
    /// pool as `young` and evicts dropped ones; current members found right
    /// after subscribing count as `adult`.
    async fn connect_to_service(&self, service_name: &str) -> Result<(), ContainerError> {
        let naming = self.naming_client()?;
        let pool = Arc::new(ClientMap::new());
        self.pools.write().insert(service_name.to_owned(), pool.clone());

        let container = self.handle();
        let watch_pool = pool.clone();
        naming
            .subscribe(
                service_name,
                Box::new(move |services| {
                    let container = container.clone();
                    let pool = watch_pool.clone();
                    Box::pin(async move {
                        container.on_services_changed(&pool, services).await;
                    })
                }),
            )
            .await?;

        let services = naming.find(service_name, &[]).await?;
        info!(service = %service_name, count = services.len(), "find service");
        for mut service in services {
            service.meta.insert(KEY_SERVICE_STATE.to_owned(), STATE_ADULT.to_owned());
            if let Err(e) = self.build_client(&pool, service).await {
                warn!(error = %e, "build client failed");
            }
        }
        Ok(())
    }

    /// Reconcile a pool against the full current member set from a watch
    /// callback.
    async fn on_services_changed(
        &self,
        pool: &Arc<ClientMap>,
        services: Vec<ServiceDescriptor>,
    ) {
        let live: HashSet<&str> = services.iter().map(|s| s.id.as_str()).collect();

        // Members the registry no longer lists stop receiving traffic now;
        // their read loops would notice eventually, but a deregistration is
        // authoritative.
        for member in pool.all() {
            if !live.contains(member.service_id()) {
                info!(id = %member.service_id(), "service deregistered");
                pool.remove(member.service_id());
                member.close().await;
            }
        }

        for mut service in services {
            if pool.get(&service.id).is_some() {
                continue;
            }
            info!(service = %service, "watch a new service");
            service.meta.insert(KEY_SERVICE_STATE.to_owned(), STATE_YOUNG.to_owned());
            match self.build_client(pool, service).await {
                Ok(Some(client)) => {
                    let grace = self.young_grace();
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        client.set_meta(KEY_SERVICE_STATE, STATE_ADULT);
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "build client failed"),
            }
        }
    }

    /// Dial one discovered peer and start its read loop. Returns `None` when
    /// the client already exists.
    async fn build_client(
        &self,
        pool: &Arc<ClientMap>,
        service: ServiceDescriptor,
    ) -> Result<Option<Arc<Client>>, ContainerError> {
        let _guard = self.build_lock.lock().await;

        if pool.get(&service.id).is_some() {
            return Ok(None);
        }
        // The inter-service link is TCP only.
        if service.protocol != "tcp" {
            return Err(ContainerError::UnexpectedProtocol(service.protocol.clone()));
        }
        let dialer = self
            .dialer
            .read()
            .clone()
            .ok_or(ContainerError::DialerRequired)?;

        let client = Arc::new(Client::with_meta(
            &service.id,
            &service.name,
            service.meta.clone(),
            ClientOptions {
                heartbeat: DEFAULT_HEARTBEAT,
                read_wait: DEFAULT_READ_WAIT,
                write_wait: DEFAULT_WRITE_WAIT,
            },
        ));
        client.set_dialer(dialer);
        client.connect(&service.dial_url()).await?;

        {
            let container = self.handle();
            let pool = pool.clone();
            let client = client.clone();
            tokio::spawn(async move {
                if let Err(e) = container.client_read_loop(&client).await {
                    debug!(id = %client.service_id(), error = %e, "client read loop ended");
                }
                pool.remove(client.service_id());
                client.close().await;
            });
        }

        pool.add(client.clone());
        Ok(Some(client))
    }

    /// Inbound side of an outbound link: responses and pushes from the peer
    /// come back as Binary logic packets.
    async fn client_read_loop(&self, client: &Arc<Client>) -> Result<(), ContainerError> {
        info!(id = %client.service_id(), name = %client.service_name(), "read loop started");
        loop {
            let frame = client.read().await?;
            if frame.opcode != hermod_proto::OpCode::Binary {
                continue;
            }
            match Packet::decode(&frame.payload) {
                Ok(packet) => {
                    if let Err(e) = self.push_message(packet).await {
                        info!(error = %e, "push message failed");
                    }
                }
                Err(e) => info!(error = %e, "discarding undecodable packet"),
            }
        }
    }

    /// Fan a packet out to the local channels listed in its routing
    /// metadata. Per-channel failures are logged, never aborting the sweep.
    pub async fn push_message(&self, mut packet: Packet) -> Result<(), ContainerError> {
        let srv = self.server()?;
        match packet.get_meta(metakey::DEST_SERVER) {
            Some(dest) if dest == srv.service_id() => {}
            other => {
                return Err(ContainerError::DestServerMismatch {
                    expected: srv.service_id().to_owned(),
                    got: other.unwrap_or_default().to_owned(),
                })
            }
        }
        let channel_ids = packet
            .dest_channels()
            .ok_or(ContainerError::MissingDestChannels)?;

        packet.del_meta(metakey::DEST_SERVER);
        packet.del_meta(metakey::DEST_CHANNELS);
        let payload = packet.encode();
        debug!(channels = ?channel_ids, command = %packet.header.command, "push to channels");

        for channel_id in &channel_ids {
            if let Err(e) = srv.push(channel_id, payload.clone()).await {
                debug!(channel = %channel_id, error = %e, "channel push failed");
            }
        }
        Ok(())
    }

    /// Route a packet to the dependency service owning its command, pinned
    /// by the configured selector.
    pub async fn forward(&self, service_name: &str, packet: Packet) -> Result<(), ContainerError> {
        if packet.header.command.is_empty() {
            return Err(ContainerError::EmptyCommand);
        }
        if packet.header.channel_id.is_empty() {
            return Err(ContainerError::EmptyChannelId);
        }
        let selector = self.selector.read().clone();
        self.forward_with_selector(service_name, packet, selector.as_ref())
            .await
    }

    pub async fn forward_with_selector(
        &self,
        service_name: &str,
        mut packet: Packet,
        selector: &dyn Selector,
    ) -> Result<(), ContainerError> {
        let client = self.lookup(service_name, &packet, selector)?;
        // Stamp the reply-to address: responses come back to this node.
        let srv = self.server()?;
        packet.set_meta(metakey::DEST_SERVER, srv.service_id());
        debug!(to = %client.service_id(), command = %packet.header.command, "forward");
        client.send(&packet.encode()).await?;
        Ok(())
    }

    /// Push a packet to a gateway node: it rides the inter-service link as
    /// the payload of the gateway's own channel on this server.
    pub async fn push(&self, gateway: &str, mut packet: Packet) -> Result<(), ContainerError> {
        packet.set_meta(metakey::DEST_SERVER, gateway);
        let srv = self.server()?;
        srv.push(gateway, packet.encode()).await?;
        Ok(())
    }

    fn lookup(
        &self,
        service_name: &str,
        packet: &Packet,
        selector: &dyn Selector,
    ) -> Result<Arc<Client>, ContainerError> {
        let pool = self
            .pools
            .read()
            .get(service_name)
            .cloned()
            .ok_or_else(|| ContainerError::ServiceNotFound(service_name.to_owned()))?;
        let services = pool.services(Some((KEY_SERVICE_STATE, STATE_ADULT)));
        if services.is_empty() {
            return Err(ContainerError::NoAvailableService(service_name.to_owned()));
        }
        let id = selector
            .lookup(&packet.header, &services)
            .ok_or_else(|| ContainerError::NoAvailableService(service_name.to_owned()))?;
        pool.get(&id)
            .ok_or_else(|| ContainerError::ClientNotFound(id))
    }
}


#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    tokio::select! {
        _ = hangup.recv() => Ok("SIGHUP"),
        _ = interrupt.recv() => Ok("SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
        _ = quit.recv() => Ok("SIGQUIT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
