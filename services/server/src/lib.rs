// server: a logic node hosting command handlers, reached from gateways over
// the inter-service TCP link.

pub mod config;
pub mod handler;
pub mod serv;

use std::sync::Arc;

use tracing::info;

use hermod_core::{
    Container, ContainerError, MemoryStorage, Protocol, Router, Server, ServiceDescriptor,
};
use hermod_naming::ConsulNaming;
use hermod_proto::command;

use crate::config::ServerConfig;
use crate::handler::{SignInHandler, SignOutHandler, TalkHandler};
use crate::serv::ServHandler;

/// Handler registrations for a logic node. Both command namespaces are
/// always mounted; the service name controls only what the node registers
/// as.
pub fn build_router() -> Router {
    let mut router = Router::new();
    router.handle(command::LOGIN_SIGN_IN, vec![Arc::new(SignInHandler)]);
    router.handle(command::LOGIN_SIGN_OUT, vec![Arc::new(SignOutHandler)]);
    router.handle(command::CHAT_TALK, vec![Arc::new(TalkHandler)]);
    router
}

/// Wire a logic node together and run it until a shutdown signal.
pub async fn run(config: ServerConfig, service_name: &str) -> Result<(), ContainerError> {
    let descriptor = ServiceDescriptor {
        id: config.service_id.clone(),
        name: service_name.to_owned(),
        address: config.public_address.clone(),
        port: config.public_port,
        protocol: "tcp".to_owned(),
        tags: config.tags.clone(),
        meta: Default::default(),
    };

    let server = Arc::new(Server::new(&config.listen, Protocol::Tcp, descriptor));

    let container = Container::new();
    let router = Arc::new(build_router());
    let storage = Arc::new(MemoryStorage::new());
    let handler = ServHandler::new(router, storage, container.clone());
    server.set_acceptor(handler.clone());
    server.set_message_listener(handler.clone());
    server.set_state_listener(handler);

    container.init(server, &[])?;
    container.set_service_naming(Arc::new(ConsulNaming::new(&config.naming_url)));

    info!(id = %config.service_id, name = %service_name, listen = %config.listen, "logic node starting");
    container.start().await
}
