//! 3x-ui panel client
//!
//! Talks to the panel's session-cookie HTTP API:
//! - `POST /login` establishes the session
//! - `POST /panel/api/inbounds/addClient` creates a credential
//! - `POST /panel/api/inbounds/updateClient/{id}` replaces limits
//! - `POST /panel/api/inbounds/{inbound}/delClient/{id}` deletes
//! - `GET  /panel/api/inbounds/getClientTraffics/{email}` reads counters
//!
//! A rejected session is re-established once per call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vpnbill_store::PanelEndpoint;

use crate::client::{
    Credential, CredentialSpec, PanelFactory, ProvisioningPanel, Usage, DEFAULT_DEVICE_LIMIT,
};
use crate::error::{PanelError, PanelResult};

/// Flow advertised for every credential
const FLOW: &str = "xtls-rprx-vision";

/// Response envelope shared by every panel endpoint
#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    obj: Value,
}

#[derive(Debug, Deserialize)]
struct Traffic {
    #[serde(default)]
    up: i64,
    #[serde(default)]
    down: i64,
}

/// Session-authenticated panel client for one inbound
pub struct XuiPanel {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    inbound_id: u32,
    logged_in: AtomicBool,
}

impl XuiPanel {
    pub fn new(endpoint: &PanelEndpoint, timeout: Duration) -> PanelResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .build()
            .map_err(|e| PanelError::Api(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: endpoint.base_url.trim_end_matches('/').to_string(),
            username: endpoint.username.clone(),
            password: endpoint.password.clone(),
            inbound_id: endpoint.inbound_id,
            logged_in: AtomicBool::new(false),
        })
    }

    async fn login(&self) -> PanelResult<()> {
        info!("Logging in to panel {}", self.base_url);

        let response = self
            .client
            .post(format!("{}/login", self.base_url))
            .json(&json!({ "username": self.username, "password": self.password }))
            .send()
            .await?;

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| PanelError::Api(format!("Failed to parse login response: {}", e)))?;

        if !envelope.success {
            return Err(PanelError::Api(format!("Login failed: {}", envelope.msg)));
        }

        self.logged_in.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn call(&self, method: Method, path: &str, body: Option<&Value>) -> PanelResult<Value> {
        for attempt in 0..2 {
            if !self.logged_in.load(Ordering::SeqCst) {
                self.login().await?;
            }

            let url = format!("{}{}", self.base_url, path);
            debug!("Panel call: {} {}", method, url);

            let mut request = self.client.request(method.clone(), &url);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;
            let status = response.status();
            let text = response.text().await?;

            if status == StatusCode::NOT_FOUND {
                return Err(PanelError::NotFound(path.to_string()));
            }

            let session_rejected = status == StatusCode::UNAUTHORIZED
                || status == StatusCode::FORBIDDEN
                || status.is_redirection()
                || text.is_empty();
            if session_rejected {
                self.logged_in.store(false, Ordering::SeqCst);
                if attempt == 0 {
                    warn!("Panel session rejected (status={}), re-logging in", status);
                    continue;
                }
                return Err(PanelError::Api(format!(
                    "Session rejected after re-login: status={}",
                    status
                )));
            }

            if !status.is_success() {
                return Err(PanelError::Api(format!("Panel returned status: {}", status)));
            }

            let envelope: Envelope = serde_json::from_str(&text)
                .map_err(|e| PanelError::Api(format!("Failed to parse response: {}", e)))?;
            if !envelope.success {
                return Err(PanelError::from_message(&envelope.msg));
            }
            return Ok(envelope.obj);
        }

        Err(PanelError::Api("Panel call retries exhausted".into()))
    }
}

/// Serialized `settings` field for add/update requests
fn client_settings(
    id: &str,
    email: &str,
    quota_bytes: i64,
    expiry_ms: i64,
    device_limit: u32,
) -> String {
    let limit = if device_limit == 0 {
        DEFAULT_DEVICE_LIMIT
    } else {
        device_limit
    };

    json!({
        "clients": [{
            "id": id,
            "email": email,
            "enable": true,
            "flow": FLOW,
            "limitIp": limit,
            "totalGB": quota_bytes.max(0),
            "expiryTime": expiry_ms.max(0),
        }]
    })
    .to_string()
}

/// Expiry timestamp for a credential valid `days` from now (0 = never)
pub fn expiry_after_days(days: u32) -> i64 {
    if days == 0 {
        0
    } else {
        (Utc::now() + chrono::Duration::days(days as i64)).timestamp_millis()
    }
}

#[async_trait]
impl ProvisioningPanel for XuiPanel {
    async fn create(&self, spec: &CredentialSpec) -> PanelResult<Credential> {
        let id = spec
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let settings = client_settings(
            &id,
            &spec.email,
            spec.quota_bytes,
            expiry_after_days(spec.duration_days),
            spec.device_limit,
        );
        let body = json!({ "id": self.inbound_id, "settings": settings });

        self.call(Method::POST, "/panel/api/inbounds/addClient", Some(&body))
            .await?;

        info!("Panel credential {} created for {}", id, spec.email);
        Ok(Credential {
            id,
            email: spec.email.clone(),
        })
    }

    async fn extend(
        &self,
        id: &str,
        email: &str,
        quota_bytes: i64,
        expiry_ms: i64,
        device_limit: u32,
    ) -> PanelResult<()> {
        let settings = client_settings(id, email, quota_bytes, expiry_ms, device_limit);
        let body = json!({ "id": self.inbound_id, "settings": settings });
        let path = format!("/panel/api/inbounds/updateClient/{}", id);

        self.call(Method::POST, &path, Some(&body)).await?;
        debug!("Panel credential {} updated", id);
        Ok(())
    }

    async fn delete(&self, id: &str) -> PanelResult<()> {
        let path = format!("/panel/api/inbounds/{}/delClient/{}", self.inbound_id, id);
        self.call(Method::POST, &path, None).await?;
        info!("Panel credential {} deleted", id);
        Ok(())
    }

    async fn usage(&self, email: &str) -> PanelResult<Usage> {
        let path = format!("/panel/api/inbounds/getClientTraffics/{}", email);
        let obj = self.call(Method::GET, &path, None).await?;

        if obj.is_null() {
            return Err(PanelError::NotFound(email.to_string()));
        }
        let traffic: Traffic = serde_json::from_value(obj)
            .map_err(|e| PanelError::Api(format!("Invalid traffic response: {}", e)))?;

        Ok(Usage {
            up: traffic.up,
            down: traffic.down,
        })
    }
}

/// Builds `XuiPanel` clients sharing one request timeout
#[derive(Debug, Clone)]
pub struct XuiFactory {
    timeout: Duration,
}

impl XuiFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl PanelFactory for XuiFactory {
    fn connect(&self, endpoint: &PanelEndpoint) -> PanelResult<Arc<dyn ProvisioningPanel>> {
        Ok(Arc::new(XuiPanel::new(endpoint, self.timeout)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_settings_shape() {
        let raw = client_settings("abc", "user_1_100", 1024, 1_700_000_000_000, 0);
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        let client = &parsed["clients"][0];

        assert_eq!(client["id"], "abc");
        assert_eq!(client["email"], "user_1_100");
        assert_eq!(client["flow"], FLOW);
        assert_eq!(client["limitIp"], DEFAULT_DEVICE_LIMIT);
        assert_eq!(client["totalGB"], 1024);
        assert_eq!(client["expiryTime"], 1_700_000_000_000i64);
    }

    #[test]
    fn test_expiry_after_days() {
        assert_eq!(expiry_after_days(0), 0);

        let now = Utc::now().timestamp_millis();
        let expiry = expiry_after_days(30);
        let thirty_days = 30 * 24 * 3600 * 1000;
        assert!(expiry >= now + thirty_days - 1000);
        assert!(expiry <= now + thirty_days + 1000);
    }

    #[test]
    fn test_base_url_trimmed() {
        let endpoint = PanelEndpoint {
            base_url: "http://panel.local:2053/".into(),
            username: "admin".into(),
            password: "secret".into(),
            inbound_id: 4,
        };
        let panel = XuiPanel::new(&endpoint, Duration::from_secs(5)).unwrap();
        assert_eq!(panel.base_url, "http://panel.local:2053");
        assert_eq!(panel.inbound_id, 4);
    }
}
