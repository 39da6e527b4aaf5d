//! Referral program
//!
//! A referrer earns a share of every completed subscription payment made by
//! the users they referred. The first such payment additionally claims the
//! referral and may add bonus days to the referrer's subscription.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use vpnbill_chain::stars_to_nano;
use vpnbill_store::{
    Currency, Payment, PaymentPurpose, Referral, ReferralStats, ReferralStatus, Store,
    StoreError, UserId,
};

use crate::error::{CoreError, CoreResult};
use crate::ledger::Ledger;
use crate::notifier::{send_quietly, Notification, Notifier};
use crate::settings::{percent_of, Settings};
use crate::subscription::SubscriptionEngine;

/// Bonuses below 0.0001 TON are not credited
pub const MIN_BONUS_NANO: i64 = 100_000;

/// What a payment earned its referrer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferralCredit {
    pub referrer: UserId,
    pub amount: i64,
    pub days: u32,
}

pub struct ReferralService {
    store: Arc<dyn Store>,
    ledger: Arc<Ledger>,
    subscriptions: Arc<SubscriptionEngine>,
    settings: Settings,
    notifier: Arc<dyn Notifier>,
    stars_per_ton: i64,
}

impl ReferralService {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<Ledger>,
        subscriptions: Arc<SubscriptionEngine>,
        settings: Settings,
        notifier: Arc<dyn Notifier>,
        stars_per_ton: i64,
    ) -> Self {
        Self {
            store,
            ledger,
            subscriptions,
            settings,
            notifier,
            stars_per_ton,
        }
    }

    /// Attach `user` to the owner of `code`
    pub async fn apply_code(&self, user: UserId, code: &str) -> CoreResult<Referral> {
        let referred = self.store.get_user(user).await?;
        if referred.referred_by.is_some()
            || self.store.referral_for_referred(user).await?.is_some()
        {
            return Err(CoreError::InvalidReferral(format!(
                "user {} was already referred",
                user
            )));
        }

        let referrer = self
            .store
            .user_by_referral_code(code.trim())
            .await
            .map_err(|e| match e {
                e if e.is_not_found() => {
                    CoreError::InvalidReferral(format!("unknown code {}", code))
                }
                e => e.into(),
            })?;
        if referrer.id == user {
            return Err(CoreError::InvalidReferral("own referral code".into()));
        }

        let referral = Referral::new(referrer.id, user);
        match self.store.insert_referral(referral.clone()).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                return Err(CoreError::InvalidReferral(format!(
                    "user {} was already referred",
                    user
                )))
            }
            Err(e) => return Err(e.into()),
        }
        self.store.set_referrer(user, referrer.id).await?;

        info!("User {} referred by {}", user, referrer.id);
        Ok(referral)
    }

    pub async fn stats(&self, referrer: UserId) -> CoreResult<ReferralStats> {
        let referrals = self.store.referrals_by_referrer(referrer).await?;
        Ok(ReferralStats {
            total: referrals.len(),
            pending: referrals
                .iter()
                .filter(|r| r.status == ReferralStatus::Pending)
                .count(),
            bonus_total: referrals.iter().map(|r| r.bonus_accrued).sum(),
        })
    }

    /// Ledger value of a payment in nanoTON
    fn nano_value(&self, payment: &Payment) -> i64 {
        match payment.currency {
            Currency::Ton => payment.amount,
            Currency::Stars => stars_to_nano(payment.amount, self.stars_per_ton),
        }
    }

    /// Reward the referrer of a completed subscription payment.
    ///
    /// Never fails; problems are logged.
    pub async fn credit_for_payment(&self, payment: &Payment) -> Option<ReferralCredit> {
        match self.try_credit(payment).await {
            Ok(credit) => credit,
            Err(e) => {
                warn!("Referral crediting for payment {} failed: {}", payment.id, e);
                None
            }
        }
    }

    async fn try_credit(&self, payment: &Payment) -> CoreResult<Option<ReferralCredit>> {
        if payment.purpose != PaymentPurpose::Subscription {
            return Ok(None);
        }
        let referral = match self.store.referral_for_referred(payment.user_id).await? {
            Some(r) => r,
            None => return Ok(None),
        };

        let mut credit = ReferralCredit {
            referrer: referral.referrer_id,
            ..Default::default()
        };

        let percent = self.settings.referral_bonus_percent().await;
        let bonus = percent_of(self.nano_value(payment), percent);
        if bonus >= MIN_BONUS_NANO {
            self.ledger
                .credit_referral_bonus(referral.referrer_id, bonus, referral.id)
                .await?;
            if let Err(e) = self.store.add_referral_bonus(referral.id, bonus).await {
                warn!("Failed to accrue bonus on referral {}: {}", referral.id, e);
            }
            credit.amount = bonus;
        } else {
            debug!("Referral bonus {} for payment {} below minimum", bonus, payment.id);
        }

        if self.store.claim_referral(referral.id, Utc::now()).await? {
            credit.days = self.grant_days(referral.referrer_id).await;
        }

        if credit.amount > 0 || credit.days > 0 {
            info!(
                "Referrer {} credited {} nano and {} days for payment {}",
                credit.referrer, credit.amount, credit.days, payment.id
            );
            send_quietly(
                self.notifier.as_ref(),
                credit.referrer,
                Notification::ReferralBonus {
                    amount: credit.amount,
                    days: credit.days,
                },
            )
            .await;
        }
        Ok(Some(credit))
    }

    /// Add the first-payment bonus days; returns the days actually added
    async fn grant_days(&self, referrer: UserId) -> u32 {
        let days = self.settings.referral_bonus_days().await;
        if days == 0 {
            return 0;
        }

        let sub = match self.subscriptions.active_for(referrer).await {
            Ok(Some(sub)) => sub,
            Ok(None) => {
                info!("Referrer {} has no active subscription, skipping bonus days", referrer);
                return 0;
            }
            Err(e) => {
                warn!("Failed to look up subscription of referrer {}: {}", referrer, e);
                return 0;
            }
        };

        match self.subscriptions.extend(sub.id, days).await {
            Ok(_) => days,
            Err(e) => {
                warn!("Failed to add {} bonus days for referrer {}: {}", days, referrer, e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::Harness;
    use chrono::Duration;
    use vpnbill_store::{PaymentProvider, PaymentStatus, NANO_PER_TON};

    fn completed(user: UserId, amount: i64, currency: Currency) -> Payment {
        let mut payment = Payment::new(
            user,
            PaymentPurpose::Subscription,
            PaymentProvider::OnChain,
            amount,
            currency,
        );
        payment.status = PaymentStatus::Completed;
        payment
    }

    async fn referred_pair(h: &Harness) {
        let referrer = h.user(1).await;
        h.user(2).await;
        h.referrals.apply_code(2, &referrer.referral_code).await.unwrap();
    }

    #[tokio::test]
    async fn test_apply_code_rejections() {
        let h = Harness::new();
        let alice = h.user(1).await;
        let bob = h.user(2).await;

        assert!(matches!(
            h.referrals.apply_code(1, &alice.referral_code).await,
            Err(CoreError::InvalidReferral(_))
        ));
        assert!(matches!(
            h.referrals.apply_code(1, "ZZZZZZZZ").await,
            Err(CoreError::InvalidReferral(_))
        ));

        h.referrals.apply_code(2, &alice.referral_code).await.unwrap();
        assert_eq!(h.users.get(2).await.unwrap().referred_by, Some(1));
        assert!(matches!(
            h.referrals.apply_code(2, &alice.referral_code).await,
            Err(CoreError::InvalidReferral(_))
        ));
        assert!(h.referrals.apply_code(1, &bob.referral_code).await.is_ok());
    }

    #[tokio::test]
    async fn test_days_once_percentage_every_time() {
        let h = Harness::new();
        referred_pair(&h).await;
        h.server("nl").await;
        let plan = h.plan(30, NANO_PER_TON, 100).await;
        let referrer_sub = h.subscriptions.create(1, &plan, None).await.unwrap();
        h.store.put_setting("referral_bonus_days", "3").await.unwrap();

        let first = h
            .referrals
            .credit_for_payment(&completed(2, NANO_PER_TON, Currency::Ton))
            .await
            .unwrap();
        let second = h
            .referrals
            .credit_for_payment(&completed(2, NANO_PER_TON, Currency::Ton))
            .await
            .unwrap();

        assert_eq!(first.amount, NANO_PER_TON / 20);
        assert_eq!(first.days, 3);
        assert_eq!(second.amount, NANO_PER_TON / 20);
        assert_eq!(second.days, 0);

        assert_eq!(h.ledger.balance(1).await.unwrap(), NANO_PER_TON / 10);
        let sub = h.subscriptions.get(referrer_sub.id).await.unwrap();
        assert_eq!(sub.expires_at, referrer_sub.expires_at + Duration::days(3));

        let stats = h.referrals.stats(1).await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.bonus_total, NANO_PER_TON / 10);
        assert_eq!(h.notifier.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_stars_converted_and_tiny_bonus_skipped() {
        let h = Harness::new();
        referred_pair(&h).await;

        let credit = h
            .referrals
            .credit_for_payment(&completed(2, 100, Currency::Stars))
            .await
            .unwrap();
        assert_eq!(credit.amount, NANO_PER_TON / 20);

        let tiny = h
            .referrals
            .credit_for_payment(&completed(2, NANO_PER_TON / 1000, Currency::Ton))
            .await
            .unwrap();
        assert_eq!(tiny.amount, 0);
        assert_eq!(h.ledger.balance(1).await.unwrap(), NANO_PER_TON / 20);
    }

    #[tokio::test]
    async fn test_unreferred_and_top_up_ignored() {
        let h = Harness::new();
        h.user(1).await;
        assert!(h
            .referrals
            .credit_for_payment(&completed(1, NANO_PER_TON, Currency::Ton))
            .await
            .is_none());

        referred_pair(&h).await;
        let mut top_up = completed(2, NANO_PER_TON, Currency::Ton);
        top_up.purpose = PaymentPurpose::TopUp;
        assert!(h.referrals.credit_for_payment(&top_up).await.is_none());
        assert_eq!(h.ledger.balance(1).await.unwrap(), 0);
    }
}
