//! In-process naming backend.
//!
//! Registrations live in a table keyed by service name; every mutation
//! snapshots the member set and hands it to the name's watcher, mirroring
//! the full-set (never delta) callback contract of the long-poll backends.
//! Tests and single-host deployments use this; multi-host deployments use
//! the consul backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use hermod_core::{Naming, NamingError, ServiceDescriptor, WatchCallback};

#[derive(Default)]
pub struct MemoryNaming {
    services: RwLock<HashMap<String, Vec<ServiceDescriptor>>>,
    watches: Mutex<HashMap<String, Arc<WatchCallback>>>,
}

impl MemoryNaming {
    pub fn new() -> Self {
        MemoryNaming::default()
    }

    /// Snapshot the member set and hand it to the watcher for `name`, if
    /// any. Runs the callback on its own task so registry mutations never
    /// block on subscriber work.
    fn notify(&self, name: &str) {
        let callback = self.watches.lock().get(name).cloned();
        if let Some(callback) = callback {
            let members = self
                .services
                .read()
                .get(name)
                .cloned()
                .unwrap_or_default();
            tokio::spawn(async move {
                callback(members).await;
            });
        }
    }

    fn matches_tags(service: &ServiceDescriptor, tags: &[String]) -> bool {
        tags.iter().all(|tag| service.tags.contains(tag))
    }
}

#[async_trait]
impl Naming for MemoryNaming {
    async fn register(&self, service: &ServiceDescriptor) -> Result<(), NamingError> {
        {
            let mut table = self.services.write();
            let members = table.entry(service.name.clone()).or_default();
            members.retain(|s| s.id != service.id);
            members.push(service.clone());
        }
        self.notify(&service.name);
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<(), NamingError> {
        let mut changed = Vec::new();
        {
            let mut table = self.services.write();
            for (name, members) in table.iter_mut() {
                let before = members.len();
                members.retain(|s| s.id != service_id);
                if members.len() != before {
                    changed.push(name.clone());
                }
            }
        }
        for name in changed {
            self.notify(&name);
        }
        Ok(())
    }

    async fn find(
        &self,
        service_name: &str,
        tags: &[String],
    ) -> Result<Vec<ServiceDescriptor>, NamingError> {
        Ok(self
            .services
            .read()
            .get(service_name)
            .map(|members| {
                members
                    .iter()
                    .filter(|s| Self::matches_tags(s, tags))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn subscribe(
        &self,
        service_name: &str,
        callback: WatchCallback,
    ) -> Result<(), NamingError> {
        let mut watches = self.watches.lock();
        if watches.contains_key(service_name) {
            return Err(NamingError::AlreadySubscribed(service_name.to_owned()));
        }
        watches.insert(service_name.to_owned(), Arc::new(callback));
        Ok(())
    }

    async fn unsubscribe(&self, service_name: &str) -> Result<(), NamingError> {
        self.watches.lock().remove(service_name);
        Ok(())
    }
}
