//! Inbound transfer matching
//!
//! A payment is confirmed by finding a recent inbound transfer to the service
//! wallet whose amount covers the expected amount:
//! 1. Fetch the latest `window` inbound transfers
//! 2. Drop anything older than `recency`
//! 3. Accept the first transfer with `amount >= expected - tolerance`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ChainResult;

/// An inbound transfer observed on chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInfo {
    pub hash: String,
    pub sender: String,
    /// Amount in nanoTON
    pub amount: i64,
    pub timestamp: DateTime<Utc>,
    pub comment: Option<String>,
}

/// Source of recent inbound transfers for an address
#[async_trait]
pub trait TransferSource: Send + Sync {
    /// Latest inbound transfers, newest first
    async fn recent_inbound(&self, address: &str, limit: usize) -> ChainResult<Vec<TransferInfo>>;
}

#[async_trait]
impl<S: TransferSource + ?Sized> TransferSource for Arc<S> {
    async fn recent_inbound(&self, address: &str, limit: usize) -> ChainResult<Vec<TransferInfo>> {
        (**self).recent_inbound(address, limit).await
    }
}

/// Finds a transfer that settles an expected amount
#[async_trait]
pub trait TransferVerifier: Send + Sync {
    async fn find_match(
        &self,
        destination: &str,
        expected: i64,
    ) -> ChainResult<Option<TransferInfo>>;
}

/// Matching parameters
#[derive(Debug, Clone, Copy)]
pub struct MatchPolicy {
    /// Number of latest transfers inspected
    pub window: usize,
    /// Maximum transfer age
    pub recency: Duration,
    /// Accepted shortfall in nanoTON
    pub tolerance: i64,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            window: 20,
            recency: Duration::from_secs(600),
            tolerance: 1_000_000,
        }
    }
}

/// Pick the first transfer in `transfers` that settles `expected` at `now`.
///
/// Matching is by amount only. Two payments awaiting the same amount in the
/// same window can both match one transfer.
pub fn select_match<'a>(
    transfers: &'a [TransferInfo],
    expected: i64,
    now: DateTime<Utc>,
    policy: &MatchPolicy,
) -> Option<&'a TransferInfo> {
    let horizon = chrono::Duration::seconds(policy.recency.as_secs() as i64);
    let floor = expected.saturating_sub(policy.tolerance);

    transfers
        .iter()
        .take(policy.window)
        .filter(|t| now - t.timestamp <= horizon)
        .find(|t| t.amount >= floor)
}

/// `TransferVerifier` over any `TransferSource`
pub struct ChainVerifier<S> {
    source: S,
    policy: MatchPolicy,
}

impl<S: TransferSource> ChainVerifier<S> {
    pub fn new(source: S) -> Self {
        Self::with_policy(source, MatchPolicy::default())
    }

    pub fn with_policy(source: S, policy: MatchPolicy) -> Self {
        Self { source, policy }
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }
}

#[async_trait]
impl<S: TransferSource> TransferVerifier for ChainVerifier<S> {
    async fn find_match(
        &self,
        destination: &str,
        expected: i64,
    ) -> ChainResult<Option<TransferInfo>> {
        let transfers = self
            .source
            .recent_inbound(destination, self.policy.window)
            .await?;
        debug!(
            "Fetched {} recent transfers to {}, expecting {} nano",
            transfers.len(),
            destination,
            expected
        );

        let found = select_match(&transfers, expected, Utc::now(), &self.policy).cloned();
        if let Some(transfer) = &found {
            info!(
                "Matched transfer {} from {} ({} nano)",
                transfer.hash, transfer.sender, transfer.amount
            );
        }
        Ok(found)
    }
}
