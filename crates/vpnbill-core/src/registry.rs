//! Server registry
//!
//! Owns the provisioning endpoints, their load counters and health, and the
//! per-server panel client cache.
//!
//! Selection order among active, online servers:
//! 1. Lowest `current_load / capacity` (zero capacity ranks last)
//! 2. Higher capacity
//! 3. Lower priority value
//!
//! With nothing online the first active server by priority is used.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vpnbill_panel::{PanelFactory, ProvisioningPanel};
use vpnbill_store::{Server, ServerHealth, Store};

use crate::error::{CoreError, CoreResult};

pub struct ServerRegistry {
    store: Arc<dyn Store>,
    factory: Arc<dyn PanelFactory>,
    panels: DashMap<Uuid, Arc<dyn ProvisioningPanel>>,
}

/// Ordering used to rank online servers, best first
fn compare_candidates(a: &Server, b: &Server) -> Ordering {
    let by_load = match (a.load_fraction(), b.load_fraction()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_load
        .then_with(|| b.capacity.cmp(&a.capacity))
        .then_with(|| a.priority.cmp(&b.priority))
}

/// Pick the best server from `servers` (expected in priority order)
pub fn rank_best(servers: &[Server]) -> Option<&Server> {
    servers
        .iter()
        .filter(|s| s.is_online())
        .min_by(|a, b| compare_candidates(a, b))
        .or_else(|| servers.iter().find(|s| s.is_active))
}

impl ServerRegistry {
    pub fn new(store: Arc<dyn Store>, factory: Arc<dyn PanelFactory>) -> Self {
        Self {
            store,
            factory,
            panels: DashMap::new(),
        }
    }

    pub async fn add_server(&self, server: Server) -> CoreResult<Server> {
        self.store.insert_server(server.clone()).await?;
        info!("Registered server {} ({})", server.name, server.id);
        Ok(server)
    }

    pub async fn update_server(&self, server: &Server) -> CoreResult<()> {
        self.store.update_server(server).await?;
        self.panels.remove(&server.id);
        Ok(())
    }

    pub async fn delete_server(&self, id: Uuid) -> CoreResult<()> {
        self.store.delete_server(id).await?;
        self.panels.remove(&id);
        info!("Removed server {}", id);
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> CoreResult<Server> {
        Ok(self.store.get_server(id).await?)
    }

    /// All servers in priority order
    pub async fn list(&self) -> CoreResult<Vec<Server>> {
        Ok(self.store.servers().await?)
    }

    /// Active servers in priority order
    pub async fn active(&self) -> CoreResult<Vec<Server>> {
        let mut servers = self.list().await?;
        servers.retain(|s| s.is_active);
        Ok(servers)
    }

    pub async fn select_best(&self) -> CoreResult<Server> {
        let servers = self.list().await?;
        rank_best(&servers)
            .cloned()
            .ok_or(CoreError::NoServersAvailable)
    }

    /// The requested server when given and active, otherwise the best one
    pub async fn pick(&self, preferred: Option<Uuid>) -> CoreResult<Server> {
        match preferred {
            Some(id) => {
                let server = self.get(id).await?;
                if !server.is_active {
                    return Err(CoreError::InvalidState(format!(
                        "server {} is not active",
                        server.name
                    )));
                }
                Ok(server)
            }
            None => self.select_best().await,
        }
    }

    /// Panel client for a server, built once and cached
    pub fn panel_for(&self, server: &Server) -> CoreResult<Arc<dyn ProvisioningPanel>> {
        if let Some(panel) = self.panels.get(&server.id) {
            return Ok(panel.clone());
        }
        let panel = self.factory.connect(&server.panel)?;
        self.panels.insert(server.id, panel.clone());
        debug!("Panel client built for server {}", server.name);
        Ok(panel)
    }

    pub async fn panel(&self, server_id: Uuid) -> CoreResult<Arc<dyn ProvisioningPanel>> {
        let server = self.get(server_id).await?;
        self.panel_for(&server)
    }

    pub async fn increment_load(&self, id: Uuid) -> CoreResult<u32> {
        Ok(self.store.adjust_server_load(id, 1).await?)
    }

    pub async fn decrement_load(&self, id: Uuid) -> CoreResult<u32> {
        Ok(self.store.adjust_server_load(id, -1).await?)
    }

    /// Best-effort decrement used by cleanup paths
    pub async fn release(&self, id: Uuid) {
        if let Err(e) = self.decrement_load(id).await {
            warn!("Failed to decrement load of server {}: {}", id, e);
        }
    }

    /// Reset every load counter to the number of active subscriptions on it
    pub async fn sync_loads(&self) -> CoreResult<()> {
        for server in self.list().await? {
            let count = self.store.count_active_on_server(server.id).await?;
            if count != server.current_load {
                debug!(
                    "Server {} load {} -> {}",
                    server.name, server.current_load, count
                );
            }
            self.store.set_server_load(server.id, count).await?;
        }
        Ok(())
    }

    pub async fn record_health(
        &self,
        id: Uuid,
        health: ServerHealth,
        ping_ms: Option<u32>,
        at: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.store
            .record_server_health(id, health, ping_ms, at)
            .await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn cached_panels(&self) -> usize {
        self.panels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{server, MockFactory};
    use vpnbill_store::MemoryStore;

    fn registry(store: Arc<MemoryStore>) -> (ServerRegistry, Arc<MockFactory>) {
        let factory = Arc::new(MockFactory::default());
        (ServerRegistry::new(store, factory.clone()), factory)
    }

    #[test]
    fn test_lowest_load_fraction_wins() {
        let mut a = server("a", 0, 100);
        a.current_load = 50;
        let mut b = server("b", 1, 10);
        b.current_load = 1;
        let servers = vec![a, b];

        assert_eq!(rank_best(&servers).unwrap().name, "b");
    }

    #[test]
    fn test_ties_prefer_capacity_then_priority() {
        let mut a = server("a", 0, 10);
        a.current_load = 1;
        let mut b = server("b", 1, 20);
        b.current_load = 2;
        assert_eq!(rank_best(&[a.clone(), b.clone()]).unwrap().name, "b");

        b.capacity = 10;
        b.current_load = 1;
        assert_eq!(rank_best(&[a, b]).unwrap().name, "a");
    }

    #[test]
    fn test_zero_capacity_ranks_last() {
        let zero = server("zero", 0, 0);
        let mut full = server("full", 1, 10);
        full.current_load = 9;

        assert_eq!(rank_best(&[zero, full]).unwrap().name, "full");
    }

    #[test]
    fn test_offline_falls_back_to_first_active() {
        let mut a = server("a", 0, 10);
        a.health = ServerHealth::Offline;
        a.is_active = false;
        let mut b = server("b", 1, 10);
        b.health = ServerHealth::Unknown;
        let mut c = server("c", 2, 10);
        c.health = ServerHealth::Offline;

        assert_eq!(rank_best(&[a.clone(), b, c]).unwrap().name, "b");
        assert!(rank_best(&[a]).is_none());
    }

    #[tokio::test]
    async fn test_no_servers() {
        let (registry, _) = registry(Arc::new(MemoryStore::new()));
        assert!(matches!(
            registry.select_best().await,
            Err(CoreError::NoServersAvailable)
        ));
    }

    #[tokio::test]
    async fn test_load_sync_and_saturation() {
        let store = Arc::new(MemoryStore::new());
        let (registry, _) = registry(store.clone());
        let s = registry.add_server(server("a", 0, 10)).await.unwrap();

        assert_eq!(registry.decrement_load(s.id).await.unwrap(), 0);
        registry.increment_load(s.id).await.unwrap();
        registry.increment_load(s.id).await.unwrap();
        assert_eq!(registry.get(s.id).await.unwrap().current_load, 2);

        registry.sync_loads().await.unwrap();
        assert_eq!(registry.get(s.id).await.unwrap().current_load, 0);
    }

    #[tokio::test]
    async fn test_panel_cache_invalidated_on_update() {
        let store = Arc::new(MemoryStore::new());
        let (registry, factory) = registry(store.clone());
        let mut s = registry.add_server(server("a", 0, 10)).await.unwrap();

        registry.panel(s.id).await.unwrap();
        registry.panel(s.id).await.unwrap();
        assert_eq!(factory.connects(), 1);
        assert_eq!(registry.cached_panels(), 1);

        s.priority = 5;
        registry.update_server(&s).await.unwrap();
        assert_eq!(registry.cached_panels(), 0);
        registry.panel(s.id).await.unwrap();
        assert_eq!(factory.connects(), 2);

        registry.delete_server(s.id).await.unwrap();
        assert_eq!(registry.cached_panels(), 0);
    }
}
