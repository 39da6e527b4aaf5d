//! Outbound user notifications
//!
//! Delivery is fire-and-forget: failures are logged and never affect the
//! operation that produced the notification.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::json;
use tracing::{info, warn};
use vpnbill_chain::format_ton;
use vpnbill_store::UserId;

use crate::error::{CoreError, CoreResult};

/// Events users are told about
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    SubscriptionActivated { expires_at: DateTime<Utc> },
    BalanceToppedUp { amount: i64, balance: i64 },
    ReferralBonus { amount: i64, days: u32 },
    SubscriptionExpiring { days_left: u32 },
    SubscriptionExpired,
}

impl Notification {
    pub fn text(&self) -> String {
        match self {
            Self::SubscriptionActivated { expires_at } => format!(
                "<b>Subscription activated</b>\n\nYour access is valid until {}.",
                expires_at.format("%Y-%m-%d %H:%M UTC")
            ),
            Self::BalanceToppedUp { amount, balance } => format!(
                "<b>Balance topped up</b>\n\n+{} TON\nBalance: {} TON",
                format_ton(*amount),
                format_ton(*balance)
            ),
            Self::ReferralBonus { amount, days } => {
                let mut text = String::from("<b>Referral bonus</b>\n");
                if *amount > 0 {
                    text.push_str(&format!("\n+{} TON", format_ton(*amount)));
                }
                if *days > 0 {
                    text.push_str(&format!("\n+{} days of access", days));
                }
                text
            }
            Self::SubscriptionExpiring { days_left } => format!(
                "<b>Subscription expires soon</b>\n\nDays left: {}",
                days_left
            ),
            Self::SubscriptionExpired => {
                "<b>Subscription expired</b>\n\nRenew to restore access.".to_string()
            }
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user: UserId, notification: Notification) -> CoreResult<()>;
}

/// Deliver and log any failure
pub async fn send_quietly(notifier: &dyn Notifier, user: UserId, notification: Notification) {
    if let Err(e) = notifier.notify(user, notification).await {
        warn!("Failed to notify user {}: {}", user, e);
    }
}

/// Writes notifications to the log only
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user: UserId, notification: Notification) -> CoreResult<()> {
        info!("Notification for user {}: {:?}", user, notification);
        Ok(())
    }
}

/// Sends notifications through the Telegram Bot API
pub struct TelegramNotifier {
    client: Client,
    endpoint: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str) -> CoreResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CoreError::Notify(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("https://api.telegram.org/bot{}/sendMessage", bot_token),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, user: UserId, notification: Notification) -> CoreResult<()> {
        let body = json!({
            "chat_id": user,
            "text": notification.text(),
            "parse_mode": "HTML",
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Notify(format!("sendMessage failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(CoreError::Notify(format!(
                "sendMessage returned status: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_referral_text_lists_parts() {
        let text = Notification::ReferralBonus {
            amount: 50_000_000,
            days: 0,
        }
        .text();
        assert!(text.contains("+0.050000000 TON"));
        assert!(!text.contains("days"));

        let text = Notification::ReferralBonus { amount: 0, days: 3 }.text();
        assert!(text.contains("+3 days"));
        assert!(!text.contains("TON"));
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        LogNotifier
            .notify(1, Notification::SubscriptionExpired)
            .await
            .unwrap();
    }
}
