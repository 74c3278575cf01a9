//! Glue between the inter-service link and the router: gateway handshake,
//! session resolution, and the dispatcher handlers respond through.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use hermod_core::{
    Acceptor, Agent, Container, ContainerError, Dispatcher, FramedConn, MessageListener, Router,
    SessionStorage, StateListener,
};
use hermod_proto::messages::{InnerHandshakeReq, Session};
use hermod_proto::{command, metakey, Packet, Status};

/// Pushes response packets back through this node's container: the
/// destination channel list is stamped here, the destination server inside
/// `Container::push`.
pub struct ContainerDispatcher {
    container: Arc<Container>,
}

impl ContainerDispatcher {
    pub fn new(container: Arc<Container>) -> Arc<Self> {
        Arc::new(ContainerDispatcher { container })
    }
}

#[async_trait]
impl Dispatcher for ContainerDispatcher {
    async fn push(
        &self,
        gateway: &str,
        channels: &[String],
        mut packet: Packet,
    ) -> Result<(), ContainerError> {
        packet.set_meta(metakey::DEST_CHANNELS, &channels.join(","));
        self.container.push(gateway, packet).await
    }
}

/// The logic node's server-side handler set.
pub struct ServHandler {
    router: Arc<Router>,
    storage: Arc<dyn SessionStorage>,
    dispatcher: Arc<ContainerDispatcher>,
}

impl ServHandler {
    pub fn new(
        router: Arc<Router>,
        storage: Arc<dyn SessionStorage>,
        container: Arc<Container>,
    ) -> Arc<Self> {
        Arc::new(ServHandler {
            router,
            storage,
            dispatcher: ContainerDispatcher::new(container),
        })
    }

    /// The session a packet runs under. Sign-in carries its own identity;
    /// everything else must already be in the session store.
    async fn resolve_session(
        &self,
        gateway_id: &str,
        packet: &Packet,
    ) -> Result<Option<Session>, ContainerError> {
        if packet.header.command == command::LOGIN_SIGN_IN {
            let req: hermod_proto::messages::LoginReq = packet.read_body()?;
            return Ok(Some(Session {
                channel_id: packet.header.channel_id.clone(),
                gate_id: gateway_id.to_owned(),
                account: req.account,
                device: req.device,
                login_at: chrono::Utc::now().timestamp(),
            }));
        }
        match self.storage.get(&packet.header.channel_id).await {
            Ok(session) => Ok(session),
            Err(e) => {
                warn!(error = %e, "session lookup failed");
                Ok(None)
            }
        }
    }

    /// Missing session: answer `SessionLost` straight through the
    /// dispatcher, since there is no context yet.
    async fn reply_session_lost(&self, gateway_id: &str, packet: &Packet) {
        let mut resp = Packet::from_header(&packet.header);
        resp.set_status(Status::SessionLost);
        resp.write_body(&hermod_proto::messages::ErrorResp {
            message: "session lost".to_owned(),
        });
        if let Err(e) = self
            .dispatcher
            .push(gateway_id, &[packet.header.channel_id.clone()], resp)
            .await
        {
            debug!(error = %e, "session-lost reply failed");
        }
    }
}

#[async_trait]
impl Acceptor for ServHandler {
    /// Only gateways dial in here; the handshake frame names the calling
    /// gateway and that name becomes the channel id of the link.
    async fn accept(
        &self,
        conn: &mut FramedConn,
        login_wait: Duration,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let frame = timeout(login_wait, conn.read_frame()).await??;
        let req = InnerHandshakeReq::decode(frame.payload.as_slice())?;
        if req.service_id.is_empty() {
            return Err("service id is empty".into());
        }
        info!(gateway = %req.service_id, "inter-service link established");
        Ok(req.service_id)
    }
}

#[async_trait]
impl MessageListener for ServHandler {
    async fn receive(&self, agent: Arc<dyn Agent>, payload: Vec<u8>) {
        let packet = match Packet::decode(&payload) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(error = %e, "discarding undecodable packet");
                return;
            }
        };
        if packet.header.channel_id.is_empty() {
            debug!(command = %packet.header.command, "packet without channel id");
            return;
        }

        let session = match self.resolve_session(agent.id(), &packet).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                debug!(channel = %packet.header.channel_id, "session lost");
                self.reply_session_lost(agent.id(), &packet).await;
                return;
            }
            Err(e) => {
                debug!(error = %e, "session resolution failed");
                return;
            }
        };

        if let Err(e) = self
            .router
            .serve(
                packet,
                self.dispatcher.clone(),
                self.storage.clone(),
                session,
            )
            .await
        {
            warn!(error = %e, "router serve failed");
        }
    }
}

#[async_trait]
impl StateListener for ServHandler {
    async fn disconnect(&self, channel_id: &str) {
        info!(gateway = %channel_id, "inter-service link dropped");
    }
}
