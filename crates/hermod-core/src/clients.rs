//! Per-dependency pool of outbound clients, keyed by service id.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::error;

use crate::client::Client;
use crate::naming::ServiceDescriptor;

#[derive(Default)]
pub struct ClientMap {
    clients: DashMap<String, Arc<Client>>,
}

impl ClientMap {
    pub fn new() -> Self {
        ClientMap::default()
    }

    pub fn add(&self, client: Arc<Client>) {
        if client.service_id().is_empty() {
            error!("client id is required");
            return;
        }
        self.clients.insert(client.service_id().to_owned(), client);
    }

    pub fn remove(&self, id: &str) {
        self.clients.remove(id);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Client>> {
        if id.is_empty() {
            error!("client id is required");
            return None;
        }
        self.clients.get(id).map(|entry| entry.value().clone())
    }

    pub fn all(&self) -> Vec<Arc<Client>> {
        self.clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Member descriptors, optionally filtered by a metadata equality (used
    /// to select only `adult` peers for routing).
    pub fn services(&self, filter: Option<(&str, &str)>) -> Vec<ServiceDescriptor> {
        self.clients
            .iter()
            .filter(|entry| match filter {
                Some((key, value)) => entry.value().get_meta(key).as_deref() == Some(value),
                None => true,
            })
            .map(|entry| entry.value().descriptor())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientOptions;
    use crate::container::{KEY_SERVICE_STATE, STATE_ADULT, STATE_YOUNG};

    fn client(id: &str, state: &str) -> Arc<Client> {
        let client = Client::new(id, "chat", ClientOptions::default());
        client.set_meta(KEY_SERVICE_STATE, state);
        Arc::new(client)
    }

    #[test]
    fn services_filters_by_metadata_equality() {
        let pool = ClientMap::new();
        pool.add(client("chat_1", STATE_ADULT));
        pool.add(client("chat_2", STATE_YOUNG));
        pool.add(client("chat_3", STATE_ADULT));

        let adults = pool.services(Some((KEY_SERVICE_STATE, STATE_ADULT)));
        let mut ids: Vec<_> = adults.iter().map(|s| s.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["chat_1", "chat_3"]);

        assert_eq!(pool.services(None).len(), 3);
    }

    #[test]
    fn empty_ids_are_rejected() {
        let pool = ClientMap::new();
        pool.add(client("", STATE_ADULT));
        assert!(pool.services(None).is_empty());
        assert!(pool.get("").is_none());
    }
}
