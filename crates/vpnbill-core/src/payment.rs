//! Payment engine
//!
//! Payment states:
//! - `Pending` on creation
//! - `AwaitingConfirmation` once an on-chain proof was submitted
//! - `Completed` when the provider settled and the purchase was fulfilled
//! - `Failed` when confirmation timed out or a balance debit failed
//! - `Refunded` after an explicit Stars refund
//!
//! `Completed`, `Failed` and `Refunded` are terminal apart from
//! `Completed -> Refunded`. Completion fulfils the purchase first and only
//! then marks the payment, so a failed fulfilment leaves the payment where it
//! was. A balance purchase whose fulfilment failed is refunded and failed so
//! it cannot be completed later without a debit. Operations on one payment
//! are serialized.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vpnbill_chain::{format_ton, stars_to_nano, TransferVerifier, NANO_PER_TON};
use vpnbill_store::{
    Currency, Payment, PaymentProvider, PaymentPurpose, PaymentStatus, Plan, Store, UserId,
};

use crate::config::BillingConfig;
use crate::error::{CoreError, CoreResult};
use crate::ledger::Ledger;
use crate::locks::{KeyedGuard, KeyedLocks};
use crate::notifier::{send_quietly, Notification, Notifier};
use crate::referral::ReferralService;
use crate::subscription::SubscriptionEngine;

/// What the user needs to send an on-chain payment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainInvoice {
    pub wallet: String,
    /// Decimal TON amount
    pub amount: String,
    pub amount_nano: i64,
    /// Transfer comment identifying the payment
    pub comment: String,
    pub deep_link: String,
}

pub struct PaymentEngine {
    store: Arc<dyn Store>,
    ledger: Arc<Ledger>,
    subscriptions: Arc<SubscriptionEngine>,
    referrals: Arc<ReferralService>,
    verifier: Arc<dyn TransferVerifier>,
    notifier: Arc<dyn Notifier>,
    wallet: String,
    stars_per_ton: i64,
    timeout: Duration,
    locks: KeyedLocks<Uuid>,
}

/// Stars needed to cover `nano`, rounded up
fn nano_to_stars(nano: i64, stars_per_ton: i64) -> i64 {
    let scaled = nano as i128 * stars_per_ton as i128;
    let per = NANO_PER_TON as i128;
    ((scaled + per - 1) / per) as i64
}

impl PaymentEngine {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<Ledger>,
        subscriptions: Arc<SubscriptionEngine>,
        referrals: Arc<ReferralService>,
        verifier: Arc<dyn TransferVerifier>,
        notifier: Arc<dyn Notifier>,
        config: &BillingConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            subscriptions,
            referrals,
            verifier,
            notifier,
            wallet: config.ton.wallet_address.clone(),
            stars_per_ton: config.pricing.stars_per_ton,
            timeout: config.workers.payment_timeout(),
            locks: KeyedLocks::new(),
        }
    }

    /// Age after which an awaiting payment fails
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn lock(&self, id: Uuid) -> KeyedGuard<'_, Uuid> {
        self.locks.lock(id).await
    }

    pub async fn get(&self, id: Uuid) -> CoreResult<Payment> {
        Ok(self.store.get_payment(id).await?)
    }

    /// Newest first
    pub async fn user_payments(&self, user: UserId) -> CoreResult<Vec<Payment>> {
        Ok(self.store.user_payments(user).await?)
    }

    async fn active_plan(&self, plan_id: Uuid) -> CoreResult<Plan> {
        let plan = self.store.get_plan(plan_id).await?;
        if !plan.is_active || plan.is_trial {
            return Err(CoreError::InvalidState(format!(
                "plan {} is not for sale",
                plan.name
            )));
        }
        Ok(plan)
    }

    /// Ledger value of a payment in nanoTON
    fn nano_value(&self, payment: &Payment) -> i64 {
        match payment.currency {
            Currency::Ton => payment.amount,
            Currency::Stars => stars_to_nano(payment.amount, self.stars_per_ton),
        }
    }

    /// Start buying `plan_id` through `provider`
    pub async fn create_subscription_payment(
        &self,
        user: UserId,
        plan_id: Uuid,
        provider: PaymentProvider,
        server: Option<Uuid>,
    ) -> CoreResult<Payment> {
        if provider == PaymentProvider::Balance {
            return self.purchase_with_balance(user, plan_id, server).await;
        }

        self.store.get_user(user).await?;
        let plan = self.active_plan(plan_id).await?;
        let (amount, currency) = match provider {
            PaymentProvider::PlatformStars => (plan.price_stars, Currency::Stars),
            _ => (plan.price_ton, Currency::Ton),
        };
        if amount <= 0 {
            return Err(CoreError::InvalidAmount(format!(
                "plan {} has no {} price",
                plan.name,
                currency.code()
            )));
        }

        let mut payment =
            Payment::new(user, PaymentPurpose::Subscription, provider, amount, currency);
        payment.plan_id = Some(plan.id);
        payment.server_id = server;
        self.store.insert_payment(payment.clone()).await?;

        info!(
            "Payment {} created: user {} plan {} ({} {})",
            payment.id,
            user,
            plan.name,
            amount,
            currency.code()
        );
        Ok(payment)
    }

    /// Start a balance top-up worth `amount_nano`
    pub async fn create_top_up(
        &self,
        user: UserId,
        amount_nano: i64,
        provider: PaymentProvider,
    ) -> CoreResult<Payment> {
        if amount_nano <= 0 {
            return Err(CoreError::InvalidAmount(format!("top-up of {}", amount_nano)));
        }
        self.store.get_user(user).await?;

        let (amount, currency) = match provider {
            PaymentProvider::OnChain => (amount_nano, Currency::Ton),
            PaymentProvider::PlatformStars => {
                (nano_to_stars(amount_nano, self.stars_per_ton), Currency::Stars)
            }
            PaymentProvider::Balance => {
                return Err(CoreError::InvalidState(
                    "balance cannot be topped up from itself".into(),
                ))
            }
        };

        let payment = Payment::new(user, PaymentPurpose::TopUp, provider, amount, currency);
        self.store.insert_payment(payment.clone()).await?;

        info!(
            "Top-up {} created: user {} for {} TON",
            payment.id,
            user,
            format_ton(amount_nano)
        );
        Ok(payment)
    }

    pub async fn on_chain_invoice(&self, id: Uuid) -> CoreResult<OnChainInvoice> {
        let payment = self.get(id).await?;
        if payment.provider != PaymentProvider::OnChain {
            return Err(CoreError::InvalidState(format!(
                "payment {} is not an on-chain payment",
                id
            )));
        }
        if !matches!(
            payment.status,
            PaymentStatus::Pending | PaymentStatus::AwaitingConfirmation
        ) {
            return Err(CoreError::InvalidState(format!(
                "payment {} is {}",
                id,
                payment.status.as_str()
            )));
        }

        let comment = match payment.purpose {
            PaymentPurpose::TopUp => format!("topup_{}", payment.id),
            PaymentPurpose::Subscription => payment.id.to_string(),
        };
        let deep_link = format!(
            "ton://transfer/{}?amount={}&text={}",
            self.wallet, payment.amount, comment
        );

        Ok(OnChainInvoice {
            wallet: self.wallet.clone(),
            amount: format_ton(payment.amount),
            amount_nano: payment.amount,
            comment,
            deep_link,
        })
    }

    /// Move an on-chain payment to `AwaitingConfirmation` and try to
    /// confirm it right away
    pub async fn submit_on_chain_proof(&self, id: Uuid, proof: &str) -> CoreResult<Payment> {
        {
            let _guard = self.lock(id).await;
            let mut payment = self.get(id).await?;
            if payment.provider != PaymentProvider::OnChain {
                return Err(CoreError::InvalidState(format!(
                    "payment {} is not an on-chain payment",
                    id
                )));
            }
            match payment.status {
                PaymentStatus::Pending => {
                    payment.status = PaymentStatus::AwaitingConfirmation;
                    payment.awaiting_since = Some(Utc::now());
                    self.store.update_payment(&payment).await?;
                    debug!("Payment {} awaiting confirmation (proof {})", id, proof);
                }
                PaymentStatus::AwaitingConfirmation => {}
                PaymentStatus::Completed => return Err(CoreError::AlreadyComplete(id)),
                status => {
                    return Err(CoreError::InvalidState(format!(
                        "payment {} is {}",
                        id,
                        status.as_str()
                    )))
                }
            }
        }

        let payment = self.get(id).await?;
        if let Err(e) = self.confirm(&payment).await {
            warn!("Immediate confirmation of payment {} failed: {}", id, e);
        }
        self.get(id).await
    }

    /// Look for a settling transfer and complete on a match.
    ///
    /// Returns true when the payment was completed.
    async fn confirm(&self, payment: &Payment) -> CoreResult<bool> {
        let found = self
            .verifier
            .find_match(&self.wallet, payment.amount)
            .await?;
        match found {
            Some(transfer) => {
                self.complete_with(payment.id, Some(transfer.hash)).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// One confirmation step for an awaiting payment at `now`
    pub async fn check_awaiting(
        &self,
        payment: &Payment,
        now: DateTime<Utc>,
    ) -> CoreResult<PaymentStatus> {
        let since = payment.awaiting_since.unwrap_or(payment.created_at);
        let timeout = chrono::Duration::seconds(self.timeout.as_secs() as i64);
        if now - since >= timeout {
            let failed = self.fail(payment.id).await?;
            info!("Payment {} timed out awaiting confirmation", payment.id);
            return Ok(failed.status);
        }

        if self.confirm(payment).await? {
            Ok(PaymentStatus::Completed)
        } else {
            Ok(PaymentStatus::AwaitingConfirmation)
        }
    }

    /// Settle a Stars payment with the platform's charge id
    pub async fn settle_stars(&self, id: Uuid, charge_id: &str) -> CoreResult<Payment> {
        let payment = self.get(id).await?;
        if payment.provider != PaymentProvider::PlatformStars {
            return Err(CoreError::InvalidState(format!(
                "payment {} is not a Stars payment",
                id
            )));
        }
        self.complete_with(id, Some(charge_id.to_string())).await
    }

    /// Buy a plan from the internal balance
    pub async fn purchase_with_balance(
        &self,
        user: UserId,
        plan_id: Uuid,
        server: Option<Uuid>,
    ) -> CoreResult<Payment> {
        let plan = self.active_plan(plan_id).await?;
        let price = plan.price_ton;
        if price <= 0 {
            return Err(CoreError::InvalidAmount(format!(
                "plan {} has no TON price",
                plan.name
            )));
        }

        let available = self.ledger.balance(user).await?;
        if available < price {
            return Err(CoreError::InsufficientFunds {
                needed: price,
                available,
            });
        }

        let mut payment = Payment::new(
            user,
            PaymentPurpose::Subscription,
            PaymentProvider::Balance,
            price,
            Currency::Ton,
        );
        payment.plan_id = Some(plan.id);
        payment.server_id = server;
        self.store.insert_payment(payment.clone()).await?;

        if let Err(e) = self.ledger.debit_for_subscription(user, price, payment.id).await {
            if let Err(fail_err) = self.fail(payment.id).await {
                warn!("Failed to mark payment {} failed: {}", payment.id, fail_err);
            }
            return Err(e);
        }

        match self.complete(payment.id).await {
            Ok(done) => Ok(done),
            Err(e) => {
                error!("Balance purchase {} not fulfilled: {}", payment.id, e);
                match self.ledger.credit_refund(user, price, payment.id).await {
                    Ok(_) => {
                        if let Err(fail_err) = self.fail(payment.id).await {
                            warn!("Failed to mark payment {} failed: {}", payment.id, fail_err);
                        }
                    }
                    // The debit stands, so the payment stays completable
                    Err(refund_err) => error!(
                        "Failed to return {} nano to user {} for payment {}: {}",
                        price, user, payment.id, refund_err
                    ),
                }
                Err(e)
            }
        }
    }

    /// Fulfil and mark completed
    pub async fn complete(&self, id: Uuid) -> CoreResult<Payment> {
        self.complete_with(id, None).await
    }

    async fn complete_with(&self, id: Uuid, external_id: Option<String>) -> CoreResult<Payment> {
        let _guard = self.lock(id).await;
        let mut payment = self.get(id).await?;
        match payment.status {
            PaymentStatus::Pending | PaymentStatus::AwaitingConfirmation => {}
            PaymentStatus::Completed => return Err(CoreError::AlreadyComplete(id)),
            status => {
                return Err(CoreError::InvalidState(format!(
                    "payment {} is {}",
                    id,
                    status.as_str()
                )))
            }
        }

        if let Some(external) = external_id {
            payment.external_id = Some(external);
            self.store.update_payment(&payment).await?;
        }

        let notification = match payment.purpose {
            PaymentPurpose::Subscription => {
                let plan_id = payment.plan_id.ok_or_else(|| {
                    CoreError::InvalidState(format!("payment {} has no plan", id))
                })?;
                let plan = self.store.get_plan(plan_id).await?;
                let sub = self
                    .subscriptions
                    .create(payment.user_id, &plan, payment.server_id)
                    .await?;
                payment.subscription_id = Some(sub.id);
                Notification::SubscriptionActivated {
                    expires_at: sub.expires_at,
                }
            }
            PaymentPurpose::TopUp => {
                let credit = self
                    .ledger
                    .credit_top_up(payment.user_id, self.nano_value(&payment), payment.id)
                    .await?;
                Notification::BalanceToppedUp {
                    amount: credit.credited,
                    balance: credit.balance,
                }
            }
        };

        payment.status = PaymentStatus::Completed;
        payment.completed_at = Some(Utc::now());
        self.store.update_payment(&payment).await?;
        info!(
            "Payment {} completed for user {} via {:?}",
            id, payment.user_id, payment.provider
        );

        if payment.purpose == PaymentPurpose::Subscription {
            self.referrals.credit_for_payment(&payment).await;
        }
        send_quietly(self.notifier.as_ref(), payment.user_id, notification).await;

        Ok(payment)
    }

    /// Terminal failure; idempotent for already failed payments
    pub async fn fail(&self, id: Uuid) -> CoreResult<Payment> {
        let _guard = self.lock(id).await;
        let mut payment = self.get(id).await?;
        match payment.status {
            PaymentStatus::Pending | PaymentStatus::AwaitingConfirmation => {}
            PaymentStatus::Failed => return Ok(payment),
            PaymentStatus::Completed => return Err(CoreError::AlreadyComplete(id)),
            PaymentStatus::Refunded => {
                return Err(CoreError::InvalidState(format!("payment {} is refunded", id)))
            }
        }

        payment.status = PaymentStatus::Failed;
        self.store.update_payment(&payment).await?;
        info!("Payment {} failed", id);
        Ok(payment)
    }

    /// Mark a settled Stars payment refunded
    pub async fn refund(&self, id: Uuid) -> CoreResult<Payment> {
        let _guard = self.lock(id).await;
        let mut payment = self.get(id).await?;
        if payment.provider != PaymentProvider::PlatformStars {
            return Err(CoreError::InvalidState(format!(
                "payment {} is not a Stars payment",
                id
            )));
        }
        if payment.status != PaymentStatus::Completed {
            return Err(CoreError::InvalidState(format!(
                "payment {} is {}",
                id,
                payment.status.as_str()
            )));
        }
        if payment.external_id.is_none() {
            return Err(CoreError::InvalidState(format!(
                "payment {} has no charge id",
                id
            )));
        }

        payment.status = PaymentStatus::Refunded;
        self.store.update_payment(&payment).await?;
        info!("Payment {} refunded", id);
        Ok(payment)
    }

    pub async fn record_external_id(&self, id: Uuid, external_id: &str) -> CoreResult<Payment> {
        let _guard = self.lock(id).await;
        let mut payment = self.get(id).await?;
        payment.external_id = Some(external_id.to_string());
        self.store.update_payment(&payment).await?;
        Ok(payment)
    }
}
