//! Balance ledger
//!
//! Every balance movement is an immutable `BalanceTransaction`. The user's
//! balance always equals the `balance_after` of their latest entry, and no
//! entry takes it below zero.
//!
//! Movements for one user are serialized by a per-user async mutex held
//! across the balance read and the append. The store append additionally
//! rejects an entry whose `balance_before` no longer matches.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;
use vpnbill_chain::format_ton;
use vpnbill_store::{BalanceTransaction, Store, TransactionKind, UserId};

use crate::error::{CoreError, CoreResult};
use crate::locks::KeyedLocks;
use crate::settings::{percent_of, Settings};

/// Default page size for `transactions`
pub const DEFAULT_PAGE: usize = 20;

/// Largest page `transactions` returns
pub const MAX_PAGE: usize = 100;

/// Result of a top-up credit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopUpCredit {
    /// Amount credited including any bonus
    pub credited: i64,
    pub bonus: i64,
    pub balance: i64,
}

pub struct Ledger {
    store: Arc<dyn Store>,
    settings: Settings,
    locks: KeyedLocks<UserId>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>, settings: Settings) -> Self {
        Self {
            store,
            settings,
            locks: KeyedLocks::new(),
        }
    }

    /// Apply a signed movement and return the new balance.
    ///
    /// A debit larger than the balance fails with `InsufficientFunds` and
    /// records nothing.
    pub async fn apply_delta(
        &self,
        user: UserId,
        amount: i64,
        kind: TransactionKind,
        reference: Option<Uuid>,
        description: Option<String>,
    ) -> CoreResult<i64> {
        if amount == 0 {
            return Err(CoreError::InvalidAmount("zero balance movement".into()));
        }

        let _guard = self.locks.lock(user).await;

        let balance = self.store.get_user(user).await?.balance;
        let after = balance
            .checked_add(amount)
            .ok_or_else(|| CoreError::InvalidAmount(format!("{} overflows balance", amount)))?;
        if amount < 0 && after < 0 {
            return Err(CoreError::InsufficientFunds {
                needed: -amount,
                available: balance,
            });
        }

        self.store
            .append_balance_transaction(BalanceTransaction {
                id: Uuid::new_v4(),
                user_id: user,
                amount,
                kind,
                description,
                reference_id: reference,
                balance_before: balance,
                balance_after: after,
                created_at: Utc::now(),
            })
            .await?;

        debug!(
            "Balance of user {} moved {} -> {} ({})",
            user,
            balance,
            after,
            kind.as_str()
        );
        Ok(after)
    }

    pub async fn credit_referral_bonus(
        &self,
        user: UserId,
        amount: i64,
        referral: Uuid,
    ) -> CoreResult<i64> {
        let description = format!("Referral bonus: +{} TON", format_ton(amount));
        self.apply_delta(
            user,
            amount,
            TransactionKind::ReferralBonus,
            Some(referral),
            Some(description),
        )
        .await
    }

    /// Credit a top-up plus the configured bonus percentage
    pub async fn credit_top_up(
        &self,
        user: UserId,
        amount: i64,
        payment: Uuid,
    ) -> CoreResult<TopUpCredit> {
        if amount <= 0 {
            return Err(CoreError::InvalidAmount(format!("top-up of {}", amount)));
        }

        let percent = self.settings.topup_bonus_percent().await;
        let bonus = percent_of(amount, percent);
        let credited = amount + bonus;
        let description = if bonus > 0 {
            format!(
                "Top-up: +{} TON (+{}% bonus = {} TON)",
                format_ton(amount),
                percent,
                format_ton(credited)
            )
        } else {
            format!("Top-up: +{} TON", format_ton(amount))
        };

        let balance = self
            .apply_delta(
                user,
                credited,
                TransactionKind::TopUp,
                Some(payment),
                Some(description),
            )
            .await?;

        info!(
            "Topped up user {} by {} nano (bonus {})",
            user, credited, bonus
        );
        Ok(TopUpCredit {
            credited,
            bonus,
            balance,
        })
    }

    pub async fn debit_for_subscription(
        &self,
        user: UserId,
        amount: i64,
        payment: Uuid,
    ) -> CoreResult<i64> {
        if amount <= 0 {
            return Err(CoreError::InvalidAmount(format!("debit of {}", amount)));
        }
        let description = format!("Subscription payment: -{} TON", format_ton(amount));
        self.apply_delta(
            user,
            -amount,
            TransactionKind::SubscriptionPayment,
            Some(payment),
            Some(description),
        )
        .await
    }

    pub async fn credit_refund(&self, user: UserId, amount: i64, payment: Uuid) -> CoreResult<i64> {
        let description = format!("Refund: +{} TON", format_ton(amount));
        self.apply_delta(
            user,
            amount,
            TransactionKind::Refund,
            Some(payment),
            Some(description),
        )
        .await
    }

    /// Operator adjustment; may be negative
    pub async fn credit_manual(
        &self,
        user: UserId,
        amount: i64,
        description: &str,
    ) -> CoreResult<i64> {
        self.apply_delta(
            user,
            amount,
            TransactionKind::Manual,
            None,
            Some(description.to_string()),
        )
        .await
    }

    pub async fn credit_promo_code(
        &self,
        user: UserId,
        amount: i64,
        promo: Uuid,
        code: &str,
    ) -> CoreResult<i64> {
        let description = format!("Promo code {}: +{} TON", code, format_ton(amount));
        self.apply_delta(
            user,
            amount,
            TransactionKind::PromoCode,
            Some(promo),
            Some(description),
        )
        .await
    }

    pub async fn balance(&self, user: UserId) -> CoreResult<i64> {
        Ok(self.store.get_user(user).await?.balance)
    }

    /// Newest first. `limit` defaults to 20 and is clamped to 1..=100.
    pub async fn transactions(
        &self,
        user: UserId,
        limit: Option<usize>,
        offset: usize,
    ) -> CoreResult<Vec<BalanceTransaction>> {
        let limit = limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
        Ok(self
            .store
            .balance_transactions(user, limit, offset)
            .await?)
    }

    pub async fn can_afford(&self, user: UserId, amount: i64) -> CoreResult<bool> {
        Ok(self.balance(user).await? >= amount)
    }

    /// Replay the user's ledger in creation order and return the total.
    ///
    /// Fails when an entry does not chain from the previous one, a running
    /// total goes negative, or the total differs from the stored balance.
    pub async fn replay_check(&self, user: UserId) -> CoreResult<i64> {
        let history = self.store.ledger_history(user).await?;
        let mut running = 0i64;

        for tx in &history {
            if tx.balance_before != running || tx.balance_after != running + tx.amount {
                return Err(CoreError::InvalidState(format!(
                    "ledger entry {} of user {} does not chain",
                    tx.id, user
                )));
            }
            running = tx.balance_after;
            if running < 0 {
                return Err(CoreError::InvalidState(format!(
                    "ledger entry {} of user {} goes negative",
                    tx.id, user
                )));
            }
        }

        let stored = self.balance(user).await?;
        if stored != running {
            return Err(CoreError::InvalidState(format!(
                "user {} balance {} differs from ledger total {}",
                user, stored, running
            )));
        }
        Ok(running)
    }
}
