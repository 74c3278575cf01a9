//! Echo server demo: the first frame's payload becomes the channel id and
//! every message comes back with a ` from server` suffix.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{info, warn};

use hermod_core::{
    Acceptor, Agent, FramedConn, MessageListener, Protocol, Server, ServerError,
    ServiceDescriptor, StateListener,
};

pub struct ServerDemo;

impl ServerDemo {
    /// Run an echo server until the process dies.
    pub async fn start(id: &str, protocol: Protocol, listen: &str) -> Result<(), ServerError> {
        let mut descriptor = ServiceDescriptor::new(id, "mock");
        descriptor.protocol = protocol.as_str().to_owned();

        let server = Arc::new(Server::new(listen, protocol, descriptor));
        let handler = Arc::new(EchoHandler);
        server.set_read_wait(Duration::from_secs(60));
        server.set_acceptor(handler.clone());
        server.set_message_listener(handler.clone());
        server.set_state_listener(handler);
        server.start().await
    }
}

pub struct EchoHandler;

#[async_trait]
impl Acceptor for EchoHandler {
    async fn accept(
        &self,
        conn: &mut FramedConn,
        login_wait: Duration,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        // The handshake payload is the user id; a fake non-empty check
        // stands in for authentication.
        let frame = timeout(login_wait, conn.read_frame()).await??;
        let user_id = String::from_utf8(frame.payload)?;
        if user_id.is_empty() {
            return Err("user id is invalid".into());
        }
        Ok(user_id)
    }
}

#[async_trait]
impl MessageListener for EchoHandler {
    async fn receive(&self, agent: Arc<dyn Agent>, payload: Vec<u8>) {
        let mut ack = payload;
        ack.extend_from_slice(b" from server");
        if let Err(e) = agent.push(ack).await {
            warn!(channel = %agent.id(), error = %e, "echo push failed");
        }
    }
}

#[async_trait]
impl StateListener for EchoHandler {
    async fn disconnect(&self, channel_id: &str) {
        info!(channel = %channel_id, "disconnect");
    }
}
