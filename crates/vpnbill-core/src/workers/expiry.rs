//! Subscription expiry sweep

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use vpnbill_store::Store;

use super::Worker;
use crate::error::CoreResult;
use crate::notifier::{send_quietly, Notification, Notifier};
use crate::subscription::SubscriptionEngine;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpirySummary {
    pub notified: usize,
    pub expired: usize,
}

/// Expires lapsed subscriptions and warns users ahead of expiry.
///
/// A warning for `d` days is sent on the tick where the remaining time first
/// drops to `d` days or less, so each threshold fires once as long as ticks
/// arrive every `interval`.
pub struct ExpiryWorker {
    store: Arc<dyn Store>,
    subscriptions: Arc<SubscriptionEngine>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    notice_days: Vec<u32>,
}

impl ExpiryWorker {
    pub fn new(
        store: Arc<dyn Store>,
        subscriptions: Arc<SubscriptionEngine>,
        notifier: Arc<dyn Notifier>,
        interval: Duration,
        notice_days: Vec<u32>,
    ) -> Self {
        Self {
            store,
            subscriptions,
            notifier,
            interval,
            notice_days,
        }
    }

    pub async fn run_once_at(&self, now: DateTime<Utc>) -> CoreResult<ExpirySummary> {
        let mut summary = ExpirySummary::default();

        for sub in self.store.lapsed_subscriptions(now).await? {
            match self.subscriptions.expire(sub.id, now).await {
                Ok(None) => {}
                Ok(Some(_)) => {
                    summary.expired += 1;
                    send_quietly(
                        self.notifier.as_ref(),
                        sub.user_id,
                        Notification::SubscriptionExpired,
                    )
                    .await;
                }
                Err(e) => warn!("Failed to expire subscription {}: {}", sub.id, e),
            }
        }

        let window = chrono::Duration::seconds(self.interval.as_secs() as i64);
        for sub in self.store.active_subscriptions().await? {
            let left = sub.expires_at - now;
            let due = self.notice_days.iter().copied().find(|&days| {
                let threshold = chrono::Duration::days(days as i64);
                left <= threshold && left > threshold - window
            });
            if let Some(days_left) = due {
                summary.notified += 1;
                send_quietly(
                    self.notifier.as_ref(),
                    sub.user_id,
                    Notification::SubscriptionExpiring { days_left },
                )
                .await;
            }
        }

        if summary.expired > 0 || summary.notified > 0 {
            info!(
                "Expiry sweep: {} expired, {} notified",
                summary.expired, summary.notified
            );
        }
        Ok(summary)
    }
}

#[async_trait]
impl Worker for ExpiryWorker {
    fn name(&self) -> &'static str {
        "expiry"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn tick(&self) -> CoreResult<()> {
        self.run_once_at(Utc::now()).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::Harness;
    use vpnbill_store::{SubscriptionStatus, NANO_PER_TON};

    fn worker(h: &Harness) -> ExpiryWorker {
        ExpiryWorker::new(
            h.store.clone(),
            h.subscriptions.clone(),
            h.notifier.clone(),
            Duration::from_secs(3600),
            vec![3, 1],
        )
    }

    #[tokio::test]
    async fn test_expires_lapsed_and_notifies() {
        let h = Harness::new();
        h.user(1).await;
        let (server, panel) = h.server("nl").await;
        let plan = h.plan(30, NANO_PER_TON, 100).await;
        let sub = h.subscriptions.create(1, &plan, None).await.unwrap();

        let summary = worker(&h)
            .run_once_at(sub.expires_at + chrono::Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(summary.expired, 1);
        assert_eq!(
            h.subscriptions.get(sub.id).await.unwrap().status,
            SubscriptionStatus::Expired
        );
        assert_eq!(panel.credential_count(), 0);
        assert_eq!(h.registry.get(server.id).await.unwrap().current_load, 0);
        assert_eq!(h.notifier.sent(), vec![(1, Notification::SubscriptionExpired)]);
    }

    #[tokio::test]
    async fn test_sweep_leaves_extended_subscription() {
        let h = Harness::new();
        h.user(1).await;
        let (_server, panel) = h.server("nl").await;
        let plan = h.plan(30, NANO_PER_TON, 100).await;
        let sub = h.subscriptions.create(1, &plan, None).await.unwrap();

        let now = sub.expires_at + chrono::Duration::seconds(1);
        h.subscriptions.extend(sub.id, 7).await.unwrap();
        let summary = worker(&h).run_once_at(now).await.unwrap();

        assert_eq!(summary.expired, 0);
        assert_eq!(
            h.subscriptions.get(sub.id).await.unwrap().status,
            SubscriptionStatus::Active
        );
        assert_eq!(panel.credential_count(), 1);
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_expiring_notice_once_per_threshold() {
        let h = Harness::new();
        h.user(1).await;
        h.server("nl").await;
        let plan = h.plan(30, NANO_PER_TON, 100).await;
        let sub = h.subscriptions.create(1, &plan, None).await.unwrap();
        let w = worker(&h);

        let three_days_before = sub.expires_at - chrono::Duration::days(3);
        let first = w
            .run_once_at(three_days_before + chrono::Duration::minutes(10))
            .await
            .unwrap();
        let next_tick = w
            .run_once_at(three_days_before + chrono::Duration::minutes(70))
            .await
            .unwrap();
        let day_before = w
            .run_once_at(sub.expires_at - chrono::Duration::minutes(23 * 60 + 30))
            .await
            .unwrap();

        assert_eq!(first.notified, 1);
        assert_eq!(next_tick.notified, 0);
        assert_eq!(day_before.notified, 1);
        assert_eq!(
            h.notifier.sent(),
            vec![
                (1, Notification::SubscriptionExpiring { days_left: 3 }),
                (1, Notification::SubscriptionExpiring { days_left: 1 }),
            ]
        );
    }
}
