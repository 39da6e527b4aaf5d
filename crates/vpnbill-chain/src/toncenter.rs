//! TON Center HTTP API source
//!
//! Reads a wallet's latest transactions through `GET /getTransactions` and
//! keeps the ones carrying an internal inbound message with a sender.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ChainError, ChainResult};
use crate::verifier::{TransferInfo, TransferSource};

/// Public mainnet endpoint
pub const MAINNET_API: &str = "https://toncenter.com/api/v2";

/// Public testnet endpoint
pub const TESTNET_API: &str = "https://testnet.toncenter.com/api/v2";

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<RawTransaction>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTransaction {
    utime: i64,
    transaction_id: RawTransactionId,
    #[serde(default)]
    in_msg: Option<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct RawTransactionId {
    hash: String,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    source: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    message: Option<String>,
}

/// TON Center client
pub struct TonCenterSource {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl TonCenterSource {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> ChainResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    pub fn for_network(
        testnet: bool,
        api_key: Option<String>,
        timeout: Duration,
    ) -> ChainResult<Self> {
        Self::new(
            if testnet { TESTNET_API } else { MAINNET_API },
            api_key,
            timeout,
        )
    }
}

/// Inbound transfers contained in an API response, in response order
fn parse_transfers(body: ApiResponse) -> ChainResult<Vec<TransferInfo>> {
    if !body.ok {
        return Err(ChainError::ApiError(
            body.error.unwrap_or_else(|| "request rejected".into()),
        ));
    }

    let mut transfers = Vec::with_capacity(body.result.len());
    for tx in body.result {
        let Some(msg) = tx.in_msg else { continue };
        if msg.source.is_empty() {
            continue;
        }

        let amount: i64 = match msg.value.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("Skipping transaction {} with value {:?}", tx.transaction_id.hash, msg.value);
                continue;
            }
        };
        let Some(timestamp) = Utc.timestamp_opt(tx.utime, 0).single() else {
            continue;
        };

        transfers.push(TransferInfo {
            hash: tx.transaction_id.hash,
            sender: msg.source,
            amount,
            timestamp,
            comment: msg.message.filter(|m| !m.trim().is_empty()),
        });
    }
    Ok(transfers)
}

#[async_trait]
impl TransferSource for TonCenterSource {
    async fn recent_inbound(&self, address: &str, limit: usize) -> ChainResult<Vec<TransferInfo>> {
        if address.is_empty() {
            return Err(ChainError::InvalidAddress("empty address".into()));
        }

        let url = format!("{}/getTransactions", self.endpoint);
        let limit = limit.to_string();
        let mut request = self
            .client
            .get(&url)
            .query(&[("address", address), ("limit", limit.as_str()), ("archival", "true")]);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        debug!("TON Center getTransactions for {}", address);
        let response = request
            .send()
            .await
            .map_err(|e| ChainError::NetworkError(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ChainError::ApiError(format!(
                "TON Center returned status: {}",
                response.status()
            )));
        }

        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| ChainError::ApiError(format!("Failed to parse response: {}", e)))?;

        parse_transfers(body)
    }
}
