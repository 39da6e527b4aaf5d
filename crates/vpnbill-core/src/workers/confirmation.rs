//! On-chain payment confirmation

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use vpnbill_store::{PaymentStatus, Store};

use super::Worker;
use crate::error::CoreResult;
use crate::payment::PaymentEngine;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfirmationSummary {
    pub checked: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Completes awaiting payments once a settling transfer shows up and fails
/// them after the confirmation timeout
pub struct ConfirmationWorker {
    store: Arc<dyn Store>,
    payments: Arc<PaymentEngine>,
    interval: Duration,
}

impl ConfirmationWorker {
    pub fn new(store: Arc<dyn Store>, payments: Arc<PaymentEngine>, interval: Duration) -> Self {
        Self {
            store,
            payments,
            interval,
        }
    }

    /// Check every awaiting payment once, in order
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> CoreResult<ConfirmationSummary> {
        let awaiting = self
            .store
            .payments_with_status(PaymentStatus::AwaitingConfirmation)
            .await?;
        let mut summary = ConfirmationSummary::default();

        for payment in &awaiting {
            summary.checked += 1;
            match self.payments.check_awaiting(payment, now).await {
                Ok(PaymentStatus::Completed) => summary.completed += 1,
                Ok(PaymentStatus::Failed) => summary.failed += 1,
                Ok(_) => {}
                Err(e) => warn!("Confirmation of payment {} failed: {}", payment.id, e),
            }
        }

        if summary.checked > 0 {
            debug!(
                "Confirmation pass: {} checked, {} completed, {} failed",
                summary.checked, summary.completed, summary.failed
            );
        }
        Ok(summary)
    }
}

#[async_trait]
impl Worker for ConfirmationWorker {
    fn name(&self) -> &'static str {
        "confirmation"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&self) -> CoreResult<()> {
        self.run_once_at(Utc::now()).await.map(|_| ())
    }
}
