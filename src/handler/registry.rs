//! Host to handler resolution
//!
//! Handlers are built on first use and cached for the life of the process,
//! so every request for a host shares one connection and one working
//! directory.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use super::ServerHandler;
use crate::config::{Config, HandlerSettings, Protocol, ServerConfig, LOCALHOST};
use crate::error::{GatewayError, Result};
use crate::local::LocalHandler;
use crate::ssh::SshHandler;
use crate::ssm::SsmHandler;

type Slot = Arc<OnceCell<Arc<dyn ServerHandler>>>;

/// Lazily constructed, cached handlers keyed by host
#[derive(Debug)]
pub struct HandlerRegistry {
    servers: Vec<ServerConfig>,
    settings: HandlerSettings,
    handlers: Mutex<HashMap<String, Slot>>,
}

impl HandlerRegistry {
    pub fn new(servers: Vec<ServerConfig>, settings: HandlerSettings) -> Self {
        Self {
            servers,
            settings,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.servers.clone(), config.settings)
    }

    /// Inventory entry for `host`; `localhost` always resolves
    pub fn server(&self, host: &str) -> Result<ServerConfig> {
        if let Some(server) = self.servers.iter().find(|s| s.host == host) {
            return Ok(server.clone());
        }
        if host == LOCALHOST {
            return Ok(ServerConfig::localhost());
        }
        Err(GatewayError::config(format!("Unknown host '{}'", host)))
    }

    /// Configured hosts, with `localhost` listed even when implicit
    pub fn servers(&self) -> Vec<ServerConfig> {
        let mut servers = self.servers.clone();
        if !servers.iter().any(|s| s.host == LOCALHOST) {
            servers.insert(0, ServerConfig::localhost());
        }
        servers
    }

    /// Handler for `host`, constructing it on first use.
    ///
    /// Concurrent first requests for one host wait on that host's cell and
    /// share a single handler; other hosts are not held up. A failed
    /// construction leaves the cell empty for the next request.
    pub async fn get(&self, host: &str) -> Result<Arc<dyn ServerHandler>> {
        let server = self.server(host)?;
        let slot = self.slot(host).await;

        let handler = slot
            .get_or_try_init(|| async {
                let handler = build_handler(server, self.settings).await?;
                info!("Created {} handler for {}", handler.protocol(), host);
                Ok::<_, GatewayError>(handler)
            })
            .await?;
        Ok(handler.clone())
    }

    async fn slot(&self, host: &str) -> Slot {
        self.handlers
            .lock()
            .await
            .entry(host.to_string())
            .or_default()
            .clone()
    }

    /// Close every handler built so far
    pub async fn close_all(&self) {
        let slots: Vec<_> = self.handlers.lock().await.drain().collect();
        for (host, slot) in slots {
            if let Some(handler) = slot.get() {
                debug!("Closing handler for {}", host);
                handler.close().await;
            }
        }
    }
}

async fn build_handler(mut server: ServerConfig, settings: HandlerSettings) -> Result<Arc<dyn ServerHandler>> {
    if server.host == LOCALHOST {
        server.protocol = Protocol::Local;
    }

    server.validate()?;

    Ok(match server.protocol {
        Protocol::Local => Arc::new(LocalHandler::new(server, settings)),
        Protocol::Ssh => Arc::new(SshHandler::new(server, settings)?),
        Protocol::Ssm => Arc::new(SsmHandler::connect(server, settings).await?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_localhost_without_inventory() {
        let registry = HandlerRegistry::new(Vec::new(), HandlerSettings::default());
        let handler = registry.get("localhost").await.unwrap();
        assert_eq!(handler.protocol(), Protocol::Local);
    }

    #[tokio::test]
    async fn test_handlers_are_cached() {
        let registry = HandlerRegistry::new(Vec::new(), HandlerSettings::default());
        let first = registry.get("localhost").await.unwrap();
        let second = registry.get("localhost").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_share_a_handler() {
        let registry = HandlerRegistry::new(Vec::new(), HandlerSettings::default());
        let (first, second) = tokio::join!(registry.get("localhost"), registry.get("localhost"));
        assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
    }

    #[tokio::test]
    async fn test_pending_construction_does_not_block_other_hosts() {
        let registry = HandlerRegistry::new(Vec::new(), HandlerSettings::default());
        let slot = registry.slot("slow-host").await;
        let stuck = tokio::spawn(async move {
            slot.get_or_init(|| std::future::pending::<Arc<dyn ServerHandler>>())
                .await;
        });
        tokio::task::yield_now().await;

        let local = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            registry.get("localhost"),
        )
        .await;
        assert!(matches!(local, Ok(Ok(_))));
        stuck.abort();
    }

    #[tokio::test]
    async fn test_close_all_skips_unbuilt_slots() {
        let registry = HandlerRegistry::new(Vec::new(), HandlerSettings::default());
        let _empty = registry.slot("never-built").await;
        registry.get("localhost").await.unwrap();
        registry.close_all().await;
        assert!(registry.handlers.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_host() {
        let registry = HandlerRegistry::new(Vec::new(), HandlerSettings::default());
        let err = registry.get("nowhere").await.unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[tokio::test]
    async fn test_invalid_entry_fails_construction() {
        let servers = vec![ServerConfig::new("web-1", Protocol::Ssh)];
        let registry = HandlerRegistry::new(servers, HandlerSettings::default());
        let err = registry.get("web-1").await.unwrap_err();
        assert!(err.to_string().contains("requires a username"));

        // Nothing is cached, so the next request tries again
        assert!(registry.get("web-1").await.is_err());
    }

    #[tokio::test]
    async fn test_unreadable_key_fails_construction() {
        let servers = vec![ServerConfig::new("web-1", Protocol::Ssh)
            .with_username("deploy")
            .with_private_key_path("/nonexistent/id_rsa")];
        let registry = HandlerRegistry::new(servers, HandlerSettings::default());
        assert!(matches!(
            registry.get("web-1").await,
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn test_servers_lists_implicit_localhost() {
        let registry = HandlerRegistry::new(
            vec![ServerConfig::new("web-1", Protocol::Ssh).with_username("u")],
            HandlerSettings::default(),
        );
        let hosts: Vec<_> = registry.servers().into_iter().map(|s| s.host).collect();
        assert_eq!(hosts, vec!["localhost", "web-1"]);
    }
}
