// gateway: terminates long-lived client connections and shuttles logic
// packets to and from the logic services.

pub mod config;
pub mod handler;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use hermod_core::{Container, ContainerError, Protocol, Server, ServiceDescriptor, TcpDialer};
use hermod_naming::ConsulNaming;
use hermod_proto::service;

use crate::config::GatewayConfig;
use crate::handler::Handler;

/// Clients get a generous idle window; they are expected to ping.
const EDGE_READ_WAIT: Duration = Duration::from_secs(2 * 60);

/// Wire the gateway node together and run it until a shutdown signal.
pub async fn run(config: GatewayConfig, protocol: Protocol) -> Result<(), ContainerError> {
    let descriptor = ServiceDescriptor {
        id: config.service_id.clone(),
        name: config.service_name.clone(),
        address: config.public_address.clone(),
        port: config.public_port,
        protocol: protocol.as_str().to_owned(),
        tags: config.tags.clone(),
        meta: Default::default(),
    };

    let server = Arc::new(Server::new(&config.listen, protocol, descriptor));
    server.set_read_wait(EDGE_READ_WAIT);

    let container = Container::new();
    let handler = Handler::new(container.clone());
    server.set_acceptor(handler.clone());
    server.set_message_listener(handler.clone());
    server.set_state_listener(handler);

    container.init(server, &[service::CHAT, service::LOGIN])?;
    container.set_service_naming(Arc::new(ConsulNaming::new(&config.naming_url)));
    container.set_dialer(Arc::new(TcpDialer::new(&config.service_id)));

    info!(id = %config.service_id, listen = %config.listen, protocol = protocol.as_str(), "gateway starting");
    container.start().await
}
