//! Persistence seam

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::model::*;

/// Storage for every billing record.
///
/// Each method is atomic on its own. Multi-record atomicity is only promised
/// by `append_balance_transaction`, which updates the user's balance and
/// appends the entry together.
#[async_trait]
pub trait Store: Send + Sync {
    // ---- users ----

    async fn insert_user(&self, user: User) -> StoreResult<()>;

    async fn get_user(&self, id: UserId) -> StoreResult<User>;

    async fn user_by_referral_code(&self, code: &str) -> StoreResult<User>;

    async fn set_referrer(&self, id: UserId, referrer: UserId) -> StoreResult<()>;

    // ---- ledger ----

    /// Append a ledger entry and move the user's balance to `balance_after`.
    ///
    /// Fails with `Conflict` when the stored balance no longer equals
    /// `balance_before`.
    async fn append_balance_transaction(&self, tx: BalanceTransaction) -> StoreResult<()>;

    /// Newest first
    async fn balance_transactions(
        &self,
        user: UserId,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<BalanceTransaction>>;

    /// Creation order
    async fn ledger_history(&self, user: UserId) -> StoreResult<Vec<BalanceTransaction>>;

    // ---- payments ----

    async fn insert_payment(&self, payment: Payment) -> StoreResult<()>;

    async fn get_payment(&self, id: Uuid) -> StoreResult<Payment>;

    async fn update_payment(&self, payment: &Payment) -> StoreResult<()>;

    /// Oldest first
    async fn payments_with_status(&self, status: PaymentStatus) -> StoreResult<Vec<Payment>>;

    /// Newest first
    async fn user_payments(&self, user: UserId) -> StoreResult<Vec<Payment>>;

    // ---- subscriptions ----

    async fn insert_subscription(&self, sub: Subscription) -> StoreResult<()>;

    async fn get_subscription(&self, id: Uuid) -> StoreResult<Subscription>;

    async fn update_subscription(&self, sub: &Subscription) -> StoreResult<()>;

    /// Newest subscription with `Active` status for the user
    async fn active_subscription(&self, user: UserId) -> StoreResult<Option<Subscription>>;

    /// All subscriptions with `Active` status
    async fn active_subscriptions(&self) -> StoreResult<Vec<Subscription>>;

    /// `Active` status but `expires_at <= now`
    async fn lapsed_subscriptions(&self, now: DateTime<Utc>) -> StoreResult<Vec<Subscription>>;

    async fn count_active_on_server(&self, server: Uuid) -> StoreResult<u32>;

    /// Whether the user ever held a subscription on a trial plan, in any status
    async fn has_used_trial(&self, user: UserId) -> StoreResult<bool>;

    // ---- servers ----

    async fn insert_server(&self, server: Server) -> StoreResult<()>;

    async fn get_server(&self, id: Uuid) -> StoreResult<Server>;

    async fn update_server(&self, server: &Server) -> StoreResult<()>;

    async fn delete_server(&self, id: Uuid) -> StoreResult<()>;

    /// Sorted by priority, then name
    async fn servers(&self) -> StoreResult<Vec<Server>>;

    /// Add `delta` to the load counter, saturating at zero. Returns the new load.
    async fn adjust_server_load(&self, id: Uuid, delta: i32) -> StoreResult<u32>;

    async fn set_server_load(&self, id: Uuid, load: u32) -> StoreResult<()>;

    async fn record_server_health(
        &self,
        id: Uuid,
        health: ServerHealth,
        ping_ms: Option<u32>,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    // ---- referrals ----

    async fn insert_referral(&self, referral: Referral) -> StoreResult<()>;

    async fn referral_for_referred(&self, referred: UserId) -> StoreResult<Option<Referral>>;

    async fn referrals_by_referrer(&self, referrer: UserId) -> StoreResult<Vec<Referral>>;

    /// Move a referral from `Pending` to `Credited`.
    ///
    /// Returns false when it was already credited.
    async fn claim_referral(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<bool>;

    async fn add_referral_bonus(&self, id: Uuid, amount: i64) -> StoreResult<()>;

    // ---- plans ----

    async fn insert_plan(&self, plan: Plan) -> StoreResult<()>;

    async fn get_plan(&self, id: Uuid) -> StoreResult<Plan>;

    async fn plans(&self) -> StoreResult<Vec<Plan>>;

    /// An active trial plan, if one is configured
    async fn trial_plan(&self) -> StoreResult<Option<Plan>>;

    // ---- settings ----

    async fn setting(&self, key: &str) -> StoreResult<Option<String>>;

    async fn put_setting(&self, key: &str, value: &str) -> StoreResult<()>;
}
