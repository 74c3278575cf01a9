//! Server-side channel registry: a concurrent id -> channel map.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::error;

use crate::channel::Channel;

#[derive(Default)]
pub struct ChannelMap {
    channels: DashMap<String, Arc<Channel>>,
}

impl ChannelMap {
    pub fn new() -> Self {
        ChannelMap::default()
    }

    pub fn add(&self, channel: Arc<Channel>) {
        if channel.id().is_empty() {
            error!("channel id is required");
            return;
        }
        self.channels.insert(channel.id().to_owned(), channel);
    }

    pub fn remove(&self, id: &str) {
        self.channels.remove(id);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Channel>> {
        if id.is_empty() {
            error!("channel id is required");
            return None;
        }
        self.channels.get(id).map(|entry| entry.value().clone())
    }

    pub fn all(&self) -> Vec<Arc<Channel>> {
        self.channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
