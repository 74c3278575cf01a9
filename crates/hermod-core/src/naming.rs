//! The service-registry contract: register, deregister, point-in-time find,
//! and long-lived membership subscriptions.
//!
//! Backends live in `hermod-naming`; the fabric only depends on this trait.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use thiserror::Error;

/// Metadata key carrying the transport protocol of a registered service.
pub const KEY_PROTOCOL: &str = "protocol";
/// Metadata key pointing at an HTTP health endpoint, when the backend
/// supports health checks.
pub const KEY_HEALTH_URL: &str = "health_url";

#[derive(Debug, Error)]
pub enum NamingError {
    #[error("service not found")]
    NotFound,
    #[error("already subscribed to {0}")]
    AlreadySubscribed(String),
    #[error("naming backend: {0}")]
    Backend(String),
}

/// One registered service instance. Tags are opaque to the fabric and only
/// interpreted by naming queries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceDescriptor {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub protocol: String,
    pub tags: Vec<String>,
    pub meta: HashMap<String, String>,
}

impl ServiceDescriptor {
    pub fn new(id: &str, name: &str) -> Self {
        ServiceDescriptor {
            id: id.to_owned(),
            name: name.to_owned(),
            ..ServiceDescriptor::default()
        }
    }

    /// Address an outbound client dials to reach this instance.
    pub fn dial_url(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl std::fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} ({}) {}:{}",
            self.name, self.id, self.protocol, self.address, self.port
        )
    }
}

/// Invoked with the full current member set whenever it changes, never a
/// delta.
pub type WatchCallback = Box<dyn Fn(Vec<ServiceDescriptor>) -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait Naming: Send + Sync {
    async fn register(&self, service: &ServiceDescriptor) -> Result<(), NamingError>;

    async fn deregister(&self, service_id: &str) -> Result<(), NamingError>;

    /// Point-in-time query, filtered to healthy instances; tag arguments are
    /// AND-ed.
    async fn find(
        &self,
        service_name: &str,
        tags: &[String],
    ) -> Result<Vec<ServiceDescriptor>, NamingError>;

    /// At most one active subscription per name per process; a second
    /// subscribe on the same name is an error.
    async fn subscribe(
        &self,
        service_name: &str,
        callback: WatchCallback,
    ) -> Result<(), NamingError>;

    /// Tears down the watcher registered under `service_name`.
    async fn unsubscribe(&self, service_name: &str) -> Result<(), NamingError>;
}
