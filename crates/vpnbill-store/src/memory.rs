//! In-process store
//!
//! Every table is a map behind its own `RwLock`. When an operation needs two
//! tables it takes them in declaration order (users before ledger,
//! subscriptions before plans).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::model::*;
use crate::store::Store;

/// In-memory `Store`
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<UserId, User>>,
    ledger: RwLock<Vec<BalanceTransaction>>,
    payments: RwLock<HashMap<Uuid, Payment>>,
    subscriptions: RwLock<HashMap<Uuid, Subscription>>,
    servers: RwLock<HashMap<Uuid, Server>>,
    referrals: RwLock<HashMap<Uuid, Referral>>,
    plans: RwLock<HashMap<Uuid, Plan>>,
    settings: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_user(&self, user: User) -> StoreResult<()> {
        let mut users = self.users.write().await;
        if users.contains_key(&user.id) {
            return Err(StoreError::Conflict(format!("user {} exists", user.id)));
        }
        if users.values().any(|u| u.referral_code == user.referral_code) {
            return Err(StoreError::Conflict(format!(
                "referral code {} taken",
                user.referral_code
            )));
        }
        users.insert(user.id, user);
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> StoreResult<User> {
        self.users
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("user", id))
    }

    async fn user_by_referral_code(&self, code: &str) -> StoreResult<User> {
        self.users
            .read()
            .await
            .values()
            .find(|u| u.referral_code == code)
            .cloned()
            .ok_or_else(|| StoreError::not_found("referral code", code))
    }

    async fn set_referrer(&self, id: UserId, referrer: UserId) -> StoreResult<()> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("user", id))?;
        user.referred_by = Some(referrer);
        Ok(())
    }

    async fn append_balance_transaction(&self, tx: BalanceTransaction) -> StoreResult<()> {
        let mut users = self.users.write().await;
        let user = users
            .get_mut(&tx.user_id)
            .ok_or_else(|| StoreError::not_found("user", tx.user_id))?;

        if user.balance != tx.balance_before {
            return Err(StoreError::Conflict(format!(
                "balance of user {} moved: stored {}, entry expects {}",
                tx.user_id, user.balance, tx.balance_before
            )));
        }

        let mut ledger = self.ledger.write().await;
        user.balance = tx.balance_after;
        debug!(
            "Ledger append: user={} kind={} amount={} balance={}",
            tx.user_id,
            tx.kind.as_str(),
            tx.amount,
            tx.balance_after
        );
        ledger.push(tx);
        Ok(())
    }

    async fn balance_transactions(
        &self,
        user: UserId,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<BalanceTransaction>> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .iter()
            .rev()
            .filter(|t| t.user_id == user)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ledger_history(&self, user: UserId) -> StoreResult<Vec<BalanceTransaction>> {
        let ledger = self.ledger.read().await;
        Ok(ledger.iter().filter(|t| t.user_id == user).cloned().collect())
    }

    async fn insert_payment(&self, payment: Payment) -> StoreResult<()> {
        self.payments.write().await.insert(payment.id, payment);
        Ok(())
    }

    async fn get_payment(&self, id: Uuid) -> StoreResult<Payment> {
        self.payments
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("payment", id))
    }

    async fn update_payment(&self, payment: &Payment) -> StoreResult<()> {
        let mut payments = self.payments.write().await;
        let slot = payments
            .get_mut(&payment.id)
            .ok_or_else(|| StoreError::not_found("payment", payment.id))?;
        *slot = payment.clone();
        Ok(())
    }

    async fn payments_with_status(&self, status: PaymentStatus) -> StoreResult<Vec<Payment>> {
        let payments = self.payments.read().await;
        let mut found: Vec<Payment> = payments
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|p| p.created_at);
        Ok(found)
    }

    async fn user_payments(&self, user: UserId) -> StoreResult<Vec<Payment>> {
        let payments = self.payments.read().await;
        let mut found: Vec<Payment> = payments
            .values()
            .filter(|p| p.user_id == user)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }

    async fn insert_subscription(&self, sub: Subscription) -> StoreResult<()> {
        self.subscriptions.write().await.insert(sub.id, sub);
        Ok(())
    }

    async fn get_subscription(&self, id: Uuid) -> StoreResult<Subscription> {
        self.subscriptions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("subscription", id))
    }

    async fn update_subscription(&self, sub: &Subscription) -> StoreResult<()> {
        let mut subs = self.subscriptions.write().await;
        let slot = subs
            .get_mut(&sub.id)
            .ok_or_else(|| StoreError::not_found("subscription", sub.id))?;
        *slot = sub.clone();
        Ok(())
    }

    async fn active_subscription(&self, user: UserId) -> StoreResult<Option<Subscription>> {
        let subs = self.subscriptions.read().await;
        Ok(subs
            .values()
            .filter(|s| s.user_id == user && s.status == SubscriptionStatus::Active)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn active_subscriptions(&self) -> StoreResult<Vec<Subscription>> {
        let subs = self.subscriptions.read().await;
        Ok(subs
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active)
            .cloned()
            .collect())
    }

    async fn lapsed_subscriptions(&self, now: DateTime<Utc>) -> StoreResult<Vec<Subscription>> {
        let subs = self.subscriptions.read().await;
        Ok(subs
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active && s.expires_at <= now)
            .cloned()
            .collect())
    }

    async fn count_active_on_server(&self, server: Uuid) -> StoreResult<u32> {
        let subs = self.subscriptions.read().await;
        Ok(subs
            .values()
            .filter(|s| s.server_id == server && s.status == SubscriptionStatus::Active)
            .count() as u32)
    }

    async fn has_used_trial(&self, user: UserId) -> StoreResult<bool> {
        let subs = self.subscriptions.read().await;
        let plans = self.plans.read().await;
        Ok(subs.values().any(|s| {
            s.user_id == user && plans.get(&s.plan_id).is_some_and(|p| p.is_trial)
        }))
    }

    async fn insert_server(&self, server: Server) -> StoreResult<()> {
        self.servers.write().await.insert(server.id, server);
        Ok(())
    }

    async fn get_server(&self, id: Uuid) -> StoreResult<Server> {
        self.servers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("server", id))
    }

    async fn update_server(&self, server: &Server) -> StoreResult<()> {
        let mut servers = self.servers.write().await;
        let slot = servers
            .get_mut(&server.id)
            .ok_or_else(|| StoreError::not_found("server", server.id))?;
        *slot = server.clone();
        Ok(())
    }

    async fn delete_server(&self, id: Uuid) -> StoreResult<()> {
        self.servers
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("server", id))
    }

    async fn servers(&self) -> StoreResult<Vec<Server>> {
        let servers = self.servers.read().await;
        let mut list: Vec<Server> = servers.values().cloned().collect();
        list.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(list)
    }

    async fn adjust_server_load(&self, id: Uuid, delta: i32) -> StoreResult<u32> {
        let mut servers = self.servers.write().await;
        let server = servers
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("server", id))?;
        server.current_load = server.current_load.saturating_add_signed(delta);
        Ok(server.current_load)
    }

    async fn set_server_load(&self, id: Uuid, load: u32) -> StoreResult<()> {
        let mut servers = self.servers.write().await;
        let server = servers
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("server", id))?;
        server.current_load = load;
        Ok(())
    }

    async fn record_server_health(
        &self,
        id: Uuid,
        health: ServerHealth,
        ping_ms: Option<u32>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut servers = self.servers.write().await;
        let server = servers
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("server", id))?;
        server.health = health;
        server.ping_ms = ping_ms;
        server.last_check_at = Some(at);
        Ok(())
    }

    async fn insert_referral(&self, referral: Referral) -> StoreResult<()> {
        let mut referrals = self.referrals.write().await;
        if referrals.values().any(|r| r.referred_id == referral.referred_id) {
            return Err(StoreError::Conflict(format!(
                "user {} already referred",
                referral.referred_id
            )));
        }
        referrals.insert(referral.id, referral);
        Ok(())
    }

    async fn referral_for_referred(&self, referred: UserId) -> StoreResult<Option<Referral>> {
        let referrals = self.referrals.read().await;
        Ok(referrals
            .values()
            .find(|r| r.referred_id == referred)
            .cloned())
    }

    async fn referrals_by_referrer(&self, referrer: UserId) -> StoreResult<Vec<Referral>> {
        let referrals = self.referrals.read().await;
        let mut list: Vec<Referral> = referrals
            .values()
            .filter(|r| r.referrer_id == referrer)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn claim_referral(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        let mut referrals = self.referrals.write().await;
        let referral = referrals
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("referral", id))?;
        if referral.status == ReferralStatus::Credited {
            return Ok(false);
        }
        referral.status = ReferralStatus::Credited;
        referral.credited_at = Some(at);
        Ok(true)
    }

    async fn add_referral_bonus(&self, id: Uuid, amount: i64) -> StoreResult<()> {
        let mut referrals = self.referrals.write().await;
        let referral = referrals
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("referral", id))?;
        referral.bonus_accrued += amount;
        Ok(())
    }

    async fn insert_plan(&self, plan: Plan) -> StoreResult<()> {
        self.plans.write().await.insert(plan.id, plan);
        Ok(())
    }

    async fn get_plan(&self, id: Uuid) -> StoreResult<Plan> {
        self.plans
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("plan", id))
    }

    async fn plans(&self) -> StoreResult<Vec<Plan>> {
        let plans = self.plans.read().await;
        let mut list: Vec<Plan> = plans.values().cloned().collect();
        list.sort_by_key(|p| p.price_ton);
        Ok(list)
    }

    async fn trial_plan(&self) -> StoreResult<Option<Plan>> {
        let plans = self.plans.read().await;
        Ok(plans
            .values()
            .filter(|p| p.is_trial && p.is_active)
            .min_by_key(|p| p.duration_days)
            .cloned())
    }

    async fn setting(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.settings.read().await.get(key).cloned())
    }

    async fn put_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        self.settings
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(user: UserId, before: i64, amount: i64) -> BalanceTransaction {
        BalanceTransaction {
            id: Uuid::new_v4(),
            user_id: user,
            amount,
            kind: TransactionKind::Manual,
            description: None,
            reference_id: None,
            balance_before: before,
            balance_after: before + amount,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_moves_balance() {
        let store = MemoryStore::new();
        store.insert_user(User::new(7, None, "AAAA".into())).await.unwrap();

        store.append_balance_transaction(entry(7, 0, 500)).await.unwrap();
        store.append_balance_transaction(entry(7, 500, -200)).await.unwrap();

        assert_eq!(store.get_user(7).await.unwrap().balance, 300);
        let newest = store.balance_transactions(7, 10, 0).await.unwrap();
        assert_eq!(newest[0].amount, -200);
        assert_eq!(store.ledger_history(7).await.unwrap()[0].amount, 500);
    }

    #[tokio::test]
    async fn test_append_rejects_stale_entry() {
        let store = MemoryStore::new();
        store.insert_user(User::new(7, None, "AAAA".into())).await.unwrap();
        store.append_balance_transaction(entry(7, 0, 500)).await.unwrap();

        let err = store
            .append_balance_transaction(entry(7, 0, 100))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.ledger_history(7).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_referral_claimed_once() {
        let store = MemoryStore::new();
        let referral = Referral::new(1, 2);
        let id = referral.id;
        store.insert_referral(referral).await.unwrap();

        assert!(store.claim_referral(id, Utc::now()).await.unwrap());
        assert!(!store.claim_referral(id, Utc::now()).await.unwrap());

        let duplicate = Referral::new(3, 2);
        assert!(store.insert_referral(duplicate).await.is_err());
    }

    #[tokio::test]
    async fn test_trial_use_survives_expiry() {
        let store = MemoryStore::new();
        let trial = Plan {
            id: Uuid::new_v4(),
            name: "trial".into(),
            duration_days: 3,
            traffic_gb: 0,
            device_limit: 1,
            price_ton: 0,
            price_stars: 0,
            is_active: true,
            is_trial: true,
        };
        store.insert_plan(trial.clone()).await.unwrap();
        assert_eq!(store.trial_plan().await.unwrap().unwrap().id, trial.id);
        assert!(!store.has_used_trial(7).await.unwrap());

        let now = Utc::now();
        store
            .insert_subscription(Subscription {
                id: Uuid::new_v4(),
                user_id: 7,
                plan_id: trial.id,
                server_id: Uuid::new_v4(),
                credential_id: "c".into(),
                email: "user_7".into(),
                connection_key: String::new(),
                status: SubscriptionStatus::Expired,
                started_at: now,
                expires_at: now,
                traffic_limit: 0,
                traffic_used: 0,
                device_limit: 1,
                created_at: now,
            })
            .await
            .unwrap();

        assert!(store.has_used_trial(7).await.unwrap());
        assert!(!store.has_used_trial(8).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_referral_code_rejected() {
        let store = MemoryStore::new();
        store.insert_user(User::new(1, None, "CODE".into())).await.unwrap();
        assert!(store.insert_user(User::new(2, None, "CODE".into())).await.is_err());
        assert_eq!(store.user_by_referral_code("CODE").await.unwrap().id, 1);
    }
}
