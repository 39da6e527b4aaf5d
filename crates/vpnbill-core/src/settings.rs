//! Runtime settings
//!
//! Operator-tunable values live in the store as strings. Missing or
//! unparsable values fall back to defaults.

use std::sync::Arc;

use tracing::warn;
use vpnbill_store::Store;

use crate::error::CoreResult;

pub const TOPUP_BONUS_PERCENT: &str = "topup_bonus_percent";
pub const REFERRAL_BONUS_PERCENT: &str = "referral_bonus_percent";
pub const REFERRAL_BONUS_DAYS: &str = "referral_bonus_days";

/// Typed view over the store's key/value settings
#[derive(Clone)]
pub struct Settings {
    store: Arc<dyn Store>,
}

impl Settings {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn number(&self, key: &str, default: f64) -> f64 {
        match self.store.setting(key).await {
            Ok(Some(raw)) => match raw.trim().parse::<f64>() {
                Ok(v) if v.is_finite() => v,
                _ => {
                    warn!("Setting {} has invalid value {:?}, using {}", key, raw, default);
                    default
                }
            },
            Ok(None) => default,
            Err(e) => {
                warn!("Failed to read setting {}: {}", key, e);
                default
            }
        }
    }

    /// Extra percentage credited on top-ups (default 0)
    pub async fn topup_bonus_percent(&self) -> f64 {
        self.number(TOPUP_BONUS_PERCENT, 0.0).await.max(0.0)
    }

    /// Share of each referred payment credited to the referrer (default 5)
    pub async fn referral_bonus_percent(&self) -> f64 {
        self.number(REFERRAL_BONUS_PERCENT, 5.0).await.max(0.0)
    }

    /// Days added to the referrer's subscription on the first referred payment (default 0)
    pub async fn referral_bonus_days(&self) -> u32 {
        self.number(REFERRAL_BONUS_DAYS, 0.0).await.max(0.0) as u32
    }

    pub async fn set(&self, key: &str, value: &str) -> CoreResult<()> {
        self.store.put_setting(key, value).await?;
        Ok(())
    }
}

/// `percent` of `amount`, rounded down to whole nano units
pub fn percent_of(amount: i64, percent: f64) -> i64 {
    let basis_points = (percent * 100.0).round() as i128;
    (amount as i128 * basis_points / 10_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpnbill_store::MemoryStore;

    #[tokio::test]
    async fn test_defaults_when_absent() {
        let settings = Settings::new(Arc::new(MemoryStore::new()));
        assert_eq!(settings.topup_bonus_percent().await, 0.0);
        assert_eq!(settings.referral_bonus_percent().await, 5.0);
        assert_eq!(settings.referral_bonus_days().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_value_falls_back() {
        let settings = Settings::new(Arc::new(MemoryStore::new()));
        settings.set(REFERRAL_BONUS_PERCENT, "lots").await.unwrap();
        settings.set(REFERRAL_BONUS_DAYS, "7").await.unwrap();
        settings.set(TOPUP_BONUS_PERCENT, "2.5").await.unwrap();

        assert_eq!(settings.referral_bonus_percent().await, 5.0);
        assert_eq!(settings.referral_bonus_days().await, 7);
        assert_eq!(settings.topup_bonus_percent().await, 2.5);
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(1_000_000_000, 5.0), 50_000_000);
        assert_eq!(percent_of(1_000_000_000, 2.5), 25_000_000);
        assert_eq!(percent_of(999, 5.0), 49);
        assert_eq!(percent_of(1_000, 0.0), 0);
    }
}
