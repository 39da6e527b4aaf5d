//! Server reachability and load resync

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;
use vpnbill_store::ServerHealth;

use super::Worker;
use crate::error::CoreResult;
use crate::registry::ServerRegistry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthSummary {
    pub online: usize,
    pub offline: usize,
}

/// TCP connect round trip in milliseconds, None when unreachable
pub async fn tcp_ping(host: &str, port: u16, limit: Duration) -> Option<u32> {
    let started = Instant::now();
    match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => Some(started.elapsed().as_millis().min(u32::MAX as u128) as u32),
        Ok(Err(e)) => {
            debug!("Ping {}:{} failed: {}", host, port, e);
            None
        }
        Err(_) => {
            debug!("Ping {}:{} timed out", host, port);
            None
        }
    }
}

/// Pings every active server concurrently, records the result, then
/// resyncs load counters
pub struct HealthWorker {
    registry: Arc<ServerRegistry>,
    interval: Duration,
    ping_timeout: Duration,
}

impl HealthWorker {
    pub fn new(registry: Arc<ServerRegistry>, interval: Duration, ping_timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            ping_timeout,
        }
    }

    pub async fn run_once(&self) -> CoreResult<HealthSummary> {
        let mut pings: JoinSet<(Uuid, String, Option<u32>)> = JoinSet::new();
        for server in self.registry.active().await? {
            let limit = self.ping_timeout;
            pings.spawn(async move {
                let ping = tcp_ping(&server.address, server.port, limit).await;
                (server.id, server.name, ping)
            });
        }

        let mut summary = HealthSummary::default();
        let checked_at = Utc::now();
        while let Some(joined) = pings.join_next().await {
            let (id, name, ping) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!("Health ping task failed: {}", e);
                    continue;
                }
            };

            let health = if ping.is_some() {
                summary.online += 1;
                ServerHealth::Online
            } else {
                summary.offline += 1;
                warn!("Server {} is unreachable", name);
                ServerHealth::Offline
            };
            if let Err(e) = self.registry.record_health(id, health, ping, checked_at).await {
                warn!("Failed to record health of {}: {}", name, e);
            }
        }

        self.registry.sync_loads().await?;
        Ok(summary)
    }
}

#[async_trait]
impl Worker for HealthWorker {
    fn name(&self) -> &'static str {
        "health"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&self) -> CoreResult<()> {
        self.run_once().await.map(|_| ())
    }
}
