//! Consul-backed naming.
//!
//! Registration goes through the local agent; discovery queries the health
//! API filtered to passing instances; subscriptions ride Consul's blocking
//! queries, long-polling with the `X-Consul-Index` cursor until the member
//! set changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hermod_core::naming::{KEY_HEALTH_URL, KEY_PROTOCOL};
use hermod_core::{Naming, NamingError, ServiceDescriptor, WatchCallback};

/// How long one blocking query may hang before the agent answers anyway.
const WATCH_WAIT: &str = "55s";
/// Pause between failed watch polls so a dead agent is not hammered.
const WATCH_RETRY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Consul HTTP API payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags")]
    tags: Vec<String>,
    #[serde(rename = "Meta")]
    meta: HashMap<String, String>,
    #[serde(rename = "Check", skip_serializing_if = "Option::is_none")]
    check: Option<AgentServiceCheck>,
}

#[derive(Debug, Serialize)]
struct AgentServiceCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(rename = "HTTP")]
    http: String,
    #[serde(rename = "Timeout")]
    timeout: String,
    #[serde(rename = "Interval")]
    interval: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    deregister_critical_service_after: String,
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Service")]
    service: AgentService,
}

#[derive(Debug, Deserialize)]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
    #[serde(rename = "Meta", default)]
    meta: HashMap<String, String>,
}

impl AgentService {
    fn into_descriptor(self) -> ServiceDescriptor {
        let protocol = self.meta.get(KEY_PROTOCOL).cloned().unwrap_or_default();
        ServiceDescriptor {
            id: self.id,
            name: self.service,
            address: self.address,
            port: self.port,
            protocol,
            tags: self.tags,
            meta: self.meta,
        }
    }
}

// ---------------------------------------------------------------------------
// ConsulNaming
// ---------------------------------------------------------------------------

pub struct ConsulNaming {
    base_url: String,
    http: reqwest::Client,
    watches: Mutex<HashMap<String, CancellationToken>>,
}

impl ConsulNaming {
    /// `consul_url` is the agent address, e.g. `http://127.0.0.1:8500`.
    pub fn new(consul_url: &str) -> Self {
        ConsulNaming {
            base_url: consul_url.trim_end_matches('/').to_owned(),
            http: reqwest::Client::new(),
            watches: Mutex::new(HashMap::new()),
        }
    }

    fn health_url(&self, service_name: &str) -> String {
        format!("{}/v1/health/service/{}", self.base_url, service_name)
    }

    /// One health query. `wait_index > 0` turns it into a blocking query;
    /// the returned index is the cursor for the next one.
    async fn load(
        http: &reqwest::Client,
        url: &str,
        wait_index: u64,
        tags: &[String],
    ) -> Result<(Vec<ServiceDescriptor>, u64), NamingError> {
        let mut query: Vec<(String, String)> = vec![("passing".to_owned(), "true".to_owned())];
        for tag in tags {
            query.push(("tag".to_owned(), tag.clone()));
        }
        if wait_index > 0 {
            query.push(("index".to_owned(), wait_index.to_string()));
            query.push(("wait".to_owned(), WATCH_WAIT.to_owned()));
        }

        let response = http
            .get(url)
            .query(&query)
            .send()
            .await
            .map_err(|e| NamingError::Backend(e.to_string()))?;

        let index = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let entries: Vec<HealthEntry> = response
            .error_for_status()
            .map_err(|e| NamingError::Backend(e.to_string()))?
            .json()
            .await
            .map_err(|e| NamingError::Backend(e.to_string()))?;

        let services = entries
            .into_iter()
            .map(|entry| entry.service.into_descriptor())
            .collect();
        Ok((services, index))
    }

    async fn watch(
        http: reqwest::Client,
        url: String,
        callback: WatchCallback,
        quit: CancellationToken,
    ) {
        // Prime the cursor without invoking the callback: subscribers get
        // changes, the initial set comes from the find() that follows
        // subscribe().
        let mut wait_index = match Self::load(&http, &url, 0, &[]).await {
            Ok((_, index)) => index,
            Err(e) => {
                warn!(url = %url, error = %e, "initial watch query failed");
                0
            }
        };

        loop {
            let poll = tokio::select! {
                _ = quit.cancelled() => {
                    info!(url = %url, "watch stopped");
                    return;
                }
                poll = Self::load(&http, &url, wait_index.max(1), &[]) => poll,
            };
            match poll {
                Ok((services, index)) => {
                    // An unchanged index means the wait elapsed quietly.
                    if index == wait_index {
                        continue;
                    }
                    // Consul resets its index on restarts; restart the
                    // cursor rather than long-poll on a stale one.
                    wait_index = if index < wait_index { 0 } else { index };
                    debug!(url = %url, count = services.len(), "watch delivered");
                    callback(services).await;
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "watch query failed");
                    tokio::time::sleep(WATCH_RETRY).await;
                }
            }
        }
    }
}

#[async_trait]
impl Naming for ConsulNaming {
    async fn register(&self, service: &ServiceDescriptor) -> Result<(), NamingError> {
        let mut meta = service.meta.clone();
        meta.insert(KEY_PROTOCOL.to_owned(), service.protocol.clone());

        // Agents reap instances whose HTTP check stays critical, so a
        // health_url doubles as automatic deregistration.
        let check = meta.get(KEY_HEALTH_URL).cloned().map(|http| AgentServiceCheck {
            check_id: format!("{}_normal", service.id),
            http,
            timeout: "1s".to_owned(),
            interval: "10s".to_owned(),
            deregister_critical_service_after: "20s".to_owned(),
        });

        let registration = AgentServiceRegistration {
            id: service.id.clone(),
            name: service.name.clone(),
            address: service.address.clone(),
            port: service.port,
            tags: service.tags.clone(),
            meta,
            check,
        };

        self.http
            .put(format!("{}/v1/agent/service/register", self.base_url))
            .json(&registration)
            .send()
            .await
            .map_err(|e| NamingError::Backend(e.to_string()))?
            .error_for_status()
            .map_err(|e| NamingError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<(), NamingError> {
        self.http
            .put(format!(
                "{}/v1/agent/service/deregister/{}",
                self.base_url, service_id
            ))
            .send()
            .await
            .map_err(|e| NamingError::Backend(e.to_string()))?
            .error_for_status()
            .map_err(|e| NamingError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn find(
        &self,
        service_name: &str,
        tags: &[String],
    ) -> Result<Vec<ServiceDescriptor>, NamingError> {
        let (services, _) = Self::load(&self.http, &self.health_url(service_name), 0, tags).await?;
        Ok(services)
    }

    async fn subscribe(
        &self,
        service_name: &str,
        callback: WatchCallback,
    ) -> Result<(), NamingError> {
        let quit = {
            let mut watches = self.watches.lock();
            if watches.contains_key(service_name) {
                return Err(NamingError::AlreadySubscribed(service_name.to_owned()));
            }
            let quit = CancellationToken::new();
            watches.insert(service_name.to_owned(), quit.clone());
            quit
        };

        let http = self.http.clone();
        let url = self.health_url(service_name);
        tokio::spawn(Self::watch(http, url, callback, quit));
        Ok(())
    }

    async fn unsubscribe(&self, service_name: &str) -> Result<(), NamingError> {
        if let Some(quit) = self.watches.lock().remove(service_name) {
            quit.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_entries_decode_into_descriptors() {
        let body = r#"[
            {
                "Node": {"Node": "agent-1"},
                "Service": {
                    "ID": "chat_1",
                    "Service": "chat",
                    "Address": "10.0.0.5",
                    "Port": 8005,
                    "Tags": ["im"],
                    "Meta": {"protocol": "tcp", "service_state": "adult"}
                }
            }
        ]"#;

        let entries: Vec<HealthEntry> = serde_json::from_str(body).unwrap();
        let descriptor = entries.into_iter().next().unwrap().service.into_descriptor();
        assert_eq!(descriptor.id, "chat_1");
        assert_eq!(descriptor.name, "chat");
        assert_eq!(descriptor.protocol, "tcp");
        assert_eq!(descriptor.dial_url(), "10.0.0.5:8005");
        assert_eq!(descriptor.tags, vec!["im"]);
    }

    #[test]
    fn registration_payload_carries_protocol_and_check() {
        let mut service = ServiceDescriptor::new("gateway_1", "gateway");
        service.address = "10.0.0.1".to_owned();
        service.port = 8000;
        service.protocol = "ws".to_owned();
        service
            .meta
            .insert(KEY_HEALTH_URL.to_owned(), "http://10.0.0.1:8100/health".to_owned());

        let mut meta = service.meta.clone();
        meta.insert(KEY_PROTOCOL.to_owned(), service.protocol.clone());
        let registration = AgentServiceRegistration {
            id: service.id.clone(),
            name: service.name.clone(),
            address: service.address.clone(),
            port: service.port,
            tags: service.tags.clone(),
            meta,
            check: Some(AgentServiceCheck {
                check_id: "gateway_1_normal".to_owned(),
                http: "http://10.0.0.1:8100/health".to_owned(),
                timeout: "1s".to_owned(),
                interval: "10s".to_owned(),
                deregister_critical_service_after: "20s".to_owned(),
            }),
        };

        let json = serde_json::to_value(&registration).unwrap();
        assert_eq!(json["ID"], "gateway_1");
        assert_eq!(json["Meta"]["protocol"], "ws");
        assert_eq!(json["Check"]["HTTP"], "http://10.0.0.1:8100/health");
        assert_eq!(json["Check"]["DeregisterCriticalServiceAfter"], "20s");
    }
}
