//! The gateway's edge handler: authenticates fresh connections, stamps and
//! forwards inbound logic packets to the owning logic service, and evicts
//! sessions when a channel drops.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, warn};

use hermod_core::{Acceptor, Agent, Container, FramedConn, MessageListener, StateListener};
use hermod_proto::{command, Packet};

pub struct Handler {
    container: Arc<Container>,
}

impl Handler {
    pub fn new(container: Arc<Container>) -> Arc<Self> {
        Arc::new(Handler { container })
    }
}

/// The logic service owning a command is named by its prefix:
/// `chat.talk` -> `chat`.
fn service_of(command: &str) -> &str {
    command.split('.').next().unwrap_or_default()
}

#[async_trait]
impl Acceptor for Handler {
    /// The client's first Binary frame carries its user id; the user id
    /// becomes the channel id.
    async fn accept(
        &self,
        conn: &mut FramedConn,
        login_wait: Duration,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let frame = timeout(login_wait, conn.read_frame()).await??;
        let user_id = String::from_utf8(frame.payload)?;
        if user_id.is_empty() {
            return Err("user id is invalid".into());
        }
        Ok(user_id)
    }
}

#[async_trait]
impl MessageListener for Handler {
    async fn receive(&self, agent: Arc<dyn Agent>, payload: Vec<u8>) {
        let mut packet = match Packet::decode(&payload) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(channel = %agent.id(), error = %e, "discarding undecodable packet");
                return;
            }
        };
        // The channel id on the wire is whatever the client claimed; the
        // authenticated channel is authoritative.
        packet.header.channel_id = agent.id().to_owned();

        let service = service_of(&packet.header.command).to_owned();
        if let Err(e) = self.container.forward(&service, packet).await {
            warn!(service = %service, channel = %agent.id(), error = %e, "forward failed");
        }
    }
}

#[async_trait]
impl StateListener for Handler {
    /// A dropped channel signs its session out so the logic side can evict
    /// it.
    async fn disconnect(&self, channel_id: &str) {
        debug!(channel = %channel_id, "disconnect");
        let mut packet = Packet::new(command::LOGIN_SIGN_OUT);
        packet.header.channel_id = channel_id.to_owned();
        let service = service_of(command::LOGIN_SIGN_OUT).to_owned();
        if let Err(e) = self.container.forward(&service, packet).await {
            debug!(channel = %channel_id, error = %e, "signout forward failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_route_by_their_prefix() {
        assert_eq!(service_of("chat.talk"), "chat");
        assert_eq!(service_of("login.signin"), "login");
        assert_eq!(service_of("bare"), "bare");
        assert_eq!(service_of(""), "");
    }
}
