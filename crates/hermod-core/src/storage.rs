//! Session storage contract plus the in-memory backend.
//!
//! Logic nodes look sessions up by channel id on every request and resolve
//! accounts to Locations when they need to deliver. The production backend
//! is external to the fabric; the memory backend serves tests and
//! single-host runs.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use hermod_proto::messages::{Location, Session};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("session storage backend: {0}")]
    Backend(String),
}

#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn add(&self, session: &Session) -> Result<(), StorageError>;

    async fn delete(&self, account: &str, channel_id: &str) -> Result<(), StorageError>;

    async fn get(&self, channel_id: &str) -> Result<Option<Session>, StorageError>;

    async fn get_location(
        &self,
        account: &str,
        device: &str,
    ) -> Result<Option<Location>, StorageError>;

    /// Bulk location lookup, one entry per account that is online. Used to
    /// fan a message out to a set of members.
    async fn get_locations(&self, accounts: &[String]) -> Result<Vec<Location>, StorageError>;
}

#[derive(Default)]
pub struct MemoryStorage {
    /// channel id -> session
    sessions: DashMap<String, Session>,
    /// account -> device -> location
    locations: DashMap<String, HashMap<String, Location>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn add(&self, session: &Session) -> Result<(), StorageError> {
        self.sessions.insert(session.channel_id.clone(), session.clone());
        self.locations
            .entry(session.account.clone())
            .or_default()
            .insert(
                session.device.clone(),
                Location {
                    channel_id: session.channel_id.clone(),
                    gate_id: session.gate_id.clone(),
                },
            );
        Ok(())
    }

    async fn delete(&self, account: &str, channel_id: &str) -> Result<(), StorageError> {
        self.sessions.remove(channel_id);
        if let Some(mut devices) = self.locations.get_mut(account) {
            devices.retain(|_, location| location.channel_id != channel_id);
        }
        self.locations.retain(|_, devices| !devices.is_empty());
        Ok(())
    }

    async fn get(&self, channel_id: &str) -> Result<Option<Session>, StorageError> {
        Ok(self.sessions.get(channel_id).map(|entry| entry.value().clone()))
    }

    async fn get_location(
        &self,
        account: &str,
        device: &str,
    ) -> Result<Option<Location>, StorageError> {
        Ok(self
            .locations
            .get(account)
            .and_then(|devices| devices.get(device).cloned()))
    }

    async fn get_locations(&self, accounts: &[String]) -> Result<Vec<Location>, StorageError> {
        let mut found = Vec::new();
        for account in accounts {
            if let Some(devices) = self.locations.get(account) {
                // Deterministic pick: the default device first, else the
                // lexicographically smallest.
                let mut keys: Vec<&String> = devices.keys().collect();
                keys.sort();
                let key = if devices.contains_key("") {
                    ""
                } else if let Some(first) = keys.first() {
                    first.as_str()
                } else {
                    continue;
                };
                if let Some(location) = devices.get(key) {
                    found.push(location.clone());
                }
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(account: &str, channel: &str, gate: &str) -> Session {
        Session {
            channel_id: channel.to_owned(),
            gate_id: gate.to_owned(),
            account: account.to_owned(),
            device: String::new(),
            login_at: 0,
        }
    }

    #[tokio::test]
    async fn add_then_lookup_by_channel_and_account() {
        let storage = MemoryStorage::new();
        storage.add(&session("acc1", "ch1", "gateway_1")).await.unwrap();

        let by_channel = storage.get("ch1").await.unwrap().unwrap();
        assert_eq!(by_channel.account, "acc1");

        let location = storage.get_location("acc1", "").await.unwrap().unwrap();
        assert_eq!(location.channel_id, "ch1");
        assert_eq!(location.gate_id, "gateway_1");
    }

    #[tokio::test]
    async fn delete_removes_both_indexes() {
        let storage = MemoryStorage::new();
        storage.add(&session("acc1", "ch1", "gateway_1")).await.unwrap();
        storage.delete("acc1", "ch1").await.unwrap();

        assert!(storage.get("ch1").await.unwrap().is_none());
        assert!(storage.get_location("acc1", "").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bulk_locations_skip_offline_accounts() {
        let storage = MemoryStorage::new();
        storage.add(&session("acc1", "ch1", "gateway_1")).await.unwrap();
        storage.add(&session("acc2", "ch2", "gateway_2")).await.unwrap();

        let locations = storage
            .get_locations(&["acc1".to_owned(), "ghost".to_owned(), "acc2".to_owned()])
            .await
            .unwrap();
        assert_eq!(locations.len(), 2);
        assert_eq!(locations[0].channel_id, "ch1");
        assert_eq!(locations[1].channel_id, "ch2");
    }
}
