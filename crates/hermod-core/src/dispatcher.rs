//! How a logic handler pushes packets back out to gateways.

use async_trait::async_trait;

use hermod_proto::Packet;

use crate::container::ContainerError;

/// Dispatches a packet to one gateway for fan-out onto the listed channels.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn push(
        &self,
        gateway: &str,
        channels: &[String],
        packet: Packet,
    ) -> Result<(), ContainerError>;
}
