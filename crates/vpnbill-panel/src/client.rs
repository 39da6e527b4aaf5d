//! Provisioning panel contract

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vpnbill_store::PanelEndpoint;

use crate::error::PanelResult;

/// Device limit applied when a caller passes zero
pub const DEFAULT_DEVICE_LIMIT: u32 = 3;

/// Parameters for a new credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSpec {
    /// Reuse this credential id instead of generating one
    pub id: Option<String>,
    pub email: String,
    /// Traffic quota in bytes (0 = unlimited)
    pub quota_bytes: i64,
    /// Validity from now (0 = no expiry)
    pub duration_days: u32,
    pub device_limit: u32,
}

/// A credential as known by the panel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub email: String,
}

/// Traffic counters reported by the panel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub up: i64,
    pub down: i64,
}

impl Usage {
    pub fn total(&self) -> i64 {
        self.up + self.down
    }
}

/// Remote panel that owns metered credentials on one server
#[async_trait]
pub trait ProvisioningPanel: Send + Sync {
    async fn create(&self, spec: &CredentialSpec) -> PanelResult<Credential>;

    /// Replace quota, expiry (unix millis) and device limit of a credential
    async fn extend(
        &self,
        id: &str,
        email: &str,
        quota_bytes: i64,
        expiry_ms: i64,
        device_limit: u32,
    ) -> PanelResult<()>;

    async fn delete(&self, id: &str) -> PanelResult<()>;

    async fn usage(&self, email: &str) -> PanelResult<Usage>;
}

/// Builds a panel client for a server's endpoint
pub trait PanelFactory: Send + Sync {
    fn connect(&self, endpoint: &PanelEndpoint) -> PanelResult<Arc<dyn ProvisioningPanel>>;
}
