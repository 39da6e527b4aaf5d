//! Test doubles and fixtures shared by the core tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;
use vpnbill_chain::{ChainError, ChainResult, ChainVerifier, TransferInfo, TransferSource};
use vpnbill_panel::{
    Credential, CredentialSpec, PanelError, PanelFactory, PanelResult, ProvisioningPanel, Usage,
};
use vpnbill_store::*;

use crate::config::BillingConfig;
use crate::error::CoreResult;
use crate::ledger::Ledger;
use crate::notifier::{Notification, Notifier};
use crate::payment::PaymentEngine;
use crate::referral::ReferralService;
use crate::registry::ServerRegistry;
use crate::settings::Settings;
use crate::subscription::SubscriptionEngine;
use crate::users::UserService;

// =====================
// Provisioning panel
// =====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCredential {
    pub email: String,
    pub quota_bytes: i64,
    pub expiry_ms: i64,
    pub device_limit: u32,
}

#[derive(Default)]
struct PanelState {
    credentials: HashMap<String, RemoteCredential>,
    calls: Vec<String>,
    create_errors: VecDeque<PanelError>,
    extend_errors: VecDeque<PanelError>,
    delete_error: Option<PanelError>,
    usage: HashMap<String, Usage>,
}

/// In-memory panel recording every call
#[derive(Default)]
pub struct MockPanel {
    state: Mutex<PanelState>,
}

impl MockPanel {
    pub fn fail_next_create(&self, err: PanelError) {
        self.state.lock().unwrap().create_errors.push_back(err);
    }

    pub fn fail_next_extend(&self, err: PanelError) {
        self.state.lock().unwrap().extend_errors.push_back(err);
    }

    pub fn fail_deletes(&self, err: Option<PanelError>) {
        self.state.lock().unwrap().delete_error = err;
    }

    pub fn set_usage(&self, email: &str, up: i64, down: i64) {
        self.state
            .lock()
            .unwrap()
            .usage
            .insert(email.to_string(), Usage { up, down });
    }

    /// Drop a credential as if removed out of band
    pub fn forget(&self, id: &str) {
        self.state.lock().unwrap().credentials.remove(id);
    }

    pub fn credential(&self, id: &str) -> Option<RemoteCredential> {
        self.state.lock().unwrap().credentials.get(id).cloned()
    }

    pub fn credential_count(&self) -> usize {
        self.state.lock().unwrap().credentials.len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

#[async_trait]
impl ProvisioningPanel for MockPanel {
    async fn create(&self, spec: &CredentialSpec) -> PanelResult<Credential> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("create:{}", spec.email));
        if let Some(err) = state.create_errors.pop_front() {
            return Err(err);
        }
        if state.credentials.values().any(|c| c.email == spec.email) {
            return Err(PanelError::Duplicate(spec.email.clone()));
        }

        let id = spec.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let expiry_ms = if spec.duration_days == 0 {
            0
        } else {
            (Utc::now() + Duration::days(spec.duration_days as i64)).timestamp_millis()
        };
        state.credentials.insert(
            id.clone(),
            RemoteCredential {
                email: spec.email.clone(),
                quota_bytes: spec.quota_bytes,
                expiry_ms,
                device_limit: spec.device_limit,
            },
        );
        Ok(Credential {
            id,
            email: spec.email.clone(),
        })
    }

    async fn extend(
        &self,
        id: &str,
        email: &str,
        quota_bytes: i64,
        expiry_ms: i64,
        device_limit: u32,
    ) -> PanelResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("extend:{}", id));
        if let Some(err) = state.extend_errors.pop_front() {
            return Err(err);
        }
        match state.credentials.get_mut(id) {
            Some(c) => {
                c.email = email.to_string();
                c.quota_bytes = quota_bytes;
                c.expiry_ms = expiry_ms;
                c.device_limit = device_limit;
                Ok(())
            }
            None => Err(PanelError::NotFound(id.to_string())),
        }
    }

    async fn delete(&self, id: &str) -> PanelResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("delete:{}", id));
        if let Some(err) = state.delete_error.clone() {
            return Err(err);
        }
        match state.credentials.remove(id) {
            Some(_) => Ok(()),
            None => Err(PanelError::NotFound(id.to_string())),
        }
    }

    async fn usage(&self, email: &str) -> PanelResult<Usage> {
        let state = self.state.lock().unwrap();
        state
            .usage
            .get(email)
            .copied()
            .ok_or_else(|| PanelError::NotFound(email.to_string()))
    }
}

/// One `MockPanel` per panel base URL
#[derive(Default)]
pub struct MockFactory {
    panels: Mutex<HashMap<String, Arc<MockPanel>>>,
    connects: AtomicUsize,
}

impl MockFactory {
    pub fn panel(&self, base_url: &str) -> Arc<MockPanel> {
        self.panels
            .lock()
            .unwrap()
            .entry(base_url.to_string())
            .or_default()
            .clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl PanelFactory for MockFactory {
    fn connect(&self, endpoint: &PanelEndpoint) -> PanelResult<Arc<dyn ProvisioningPanel>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.panel(&endpoint.base_url))
    }
}

// =====================
// Chain
// =====================

/// Transfer source returning whatever the test pushed
#[derive(Default)]
pub struct ScriptedSource {
    transfers: Mutex<Vec<TransferInfo>>,
    offline: AtomicBool,
}

impl ScriptedSource {
    pub fn push(&self, amount: i64) -> String {
        let hash = format!("tx{}", Uuid::new_v4().simple());
        self.transfers.lock().unwrap().insert(
            0,
            TransferInfo {
                hash: hash.clone(),
                sender: "EQpayer".into(),
                amount,
                timestamp: Utc::now(),
                comment: None,
            },
        );
        hash
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransferSource for ScriptedSource {
    async fn recent_inbound(&self, _address: &str, limit: usize) -> ChainResult<Vec<TransferInfo>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ChainError::NetworkError("offline".into()));
        }
        let transfers = self.transfers.lock().unwrap();
        Ok(transfers.iter().take(limit).cloned().collect())
    }
}

// =====================
// Notifier
// =====================

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(UserId, Notification)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(UserId, Notification)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user: UserId, notification: Notification) -> CoreResult<()> {
        self.sent.lock().unwrap().push((user, notification));
        Ok(())
    }
}

// =====================
// Store with fault injection
// =====================

/// `MemoryStore` wrapper whose writes can be made to fail
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    pub fail_insert_subscription: AtomicBool,
    pub fail_update_subscription: AtomicBool,
    pub fail_update_payment: AtomicBool,
    pub fail_append: AtomicBool,
    fail_append_kind: Mutex<Option<TransactionKind>>,
}

impl FlakyStore {
    fn check(flag: &AtomicBool, what: &str) -> StoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Backend(format!("injected {} failure", what)))
        } else {
            Ok(())
        }
    }

    pub fn set(flag: &AtomicBool, on: bool) {
        flag.store(on, Ordering::SeqCst);
    }

    /// Fail only ledger appends of `kind`
    pub fn fail_appends_of(&self, kind: Option<TransactionKind>) {
        *self.fail_append_kind.lock().unwrap() = kind;
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn insert_user(&self, user: User) -> StoreResult<()> {
        self.inner.insert_user(user).await
    }

    async fn get_user(&self, id: UserId) -> StoreResult<User> {
        self.inner.get_user(id).await
    }

    async fn user_by_referral_code(&self, code: &str) -> StoreResult<User> {
        self.inner.user_by_referral_code(code).await
    }

    async fn set_referrer(&self, id: UserId, referrer: UserId) -> StoreResult<()> {
        self.inner.set_referrer(id, referrer).await
    }

    async fn append_balance_transaction(&self, tx: BalanceTransaction) -> StoreResult<()> {
        Self::check(&self.fail_append, "ledger append")?;
        if *self.fail_append_kind.lock().unwrap() == Some(tx.kind) {
            return Err(StoreError::Backend(format!(
                "injected {} append failure",
                tx.kind.as_str()
            )));
        }
        self.inner.append_balance_transaction(tx).await
    }

    async fn balance_transactions(
        &self,
        user: UserId,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<BalanceTransaction>> {
        self.inner.balance_transactions(user, limit, offset).await
    }

    async fn ledger_history(&self, user: UserId) -> StoreResult<Vec<BalanceTransaction>> {
        self.inner.ledger_history(user).await
    }

    async fn insert_payment(&self, payment: Payment) -> StoreResult<()> {
        self.inner.insert_payment(payment).await
    }

    async fn get_payment(&self, id: Uuid) -> StoreResult<Payment> {
        self.inner.get_payment(id).await
    }

    async fn update_payment(&self, payment: &Payment) -> StoreResult<()> {
        Self::check(&self.fail_update_payment, "payment update")?;
        self.inner.update_payment(payment).await
    }

    async fn payments_with_status(&self, status: PaymentStatus) -> StoreResult<Vec<Payment>> {
        self.inner.payments_with_status(status).await
    }

    async fn user_payments(&self, user: UserId) -> StoreResult<Vec<Payment>> {
        self.inner.user_payments(user).await
    }

    async fn insert_subscription(&self, sub: Subscription) -> StoreResult<()> {
        Self::check(&self.fail_insert_subscription, "subscription insert")?;
        self.inner.insert_subscription(sub).await
    }

    async fn get_subscription(&self, id: Uuid) -> StoreResult<Subscription> {
        self.inner.get_subscription(id).await
    }

    async fn update_subscription(&self, sub: &Subscription) -> StoreResult<()> {
        Self::check(&self.fail_update_subscription, "subscription update")?;
        self.inner.update_subscription(sub).await
    }

    async fn active_subscription(&self, user: UserId) -> StoreResult<Option<Subscription>> {
        self.inner.active_subscription(user).await
    }

    async fn active_subscriptions(&self) -> StoreResult<Vec<Subscription>> {
        self.inner.active_subscriptions().await
    }

    async fn lapsed_subscriptions(&self, now: DateTime<Utc>) -> StoreResult<Vec<Subscription>> {
        self.inner.lapsed_subscriptions(now).await
    }

    async fn count_active_on_server(&self, server: Uuid) -> StoreResult<u32> {
        self.inner.count_active_on_server(server).await
    }

    async fn has_used_trial(&self, user: UserId) -> StoreResult<bool> {
        self.inner.has_used_trial(user).await
    }

    async fn insert_server(&self, server: Server) -> StoreResult<()> {
        self.inner.insert_server(server).await
    }

    async fn get_server(&self, id: Uuid) -> StoreResult<Server> {
        self.inner.get_server(id).await
    }

    async fn update_server(&self, server: &Server) -> StoreResult<()> {
        self.inner.update_server(server).await
    }

    async fn delete_server(&self, id: Uuid) -> StoreResult<()> {
        self.inner.delete_server(id).await
    }

    async fn servers(&self) -> StoreResult<Vec<Server>> {
        self.inner.servers().await
    }

    async fn adjust_server_load(&self, id: Uuid, delta: i32) -> StoreResult<u32> {
        self.inner.adjust_server_load(id, delta).await
    }

    async fn set_server_load(&self, id: Uuid, load: u32) -> StoreResult<()> {
        self.inner.set_server_load(id, load).await
    }

    async fn record_server_health(
        &self,
        id: Uuid,
        health: ServerHealth,
        ping_ms: Option<u32>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.inner.record_server_health(id, health, ping_ms, at).await
    }

    async fn insert_referral(&self, referral: Referral) -> StoreResult<()> {
        self.inner.insert_referral(referral).await
    }

    async fn referral_for_referred(&self, referred: UserId) -> StoreResult<Option<Referral>> {
        self.inner.referral_for_referred(referred).await
    }

    async fn referrals_by_referrer(&self, referrer: UserId) -> StoreResult<Vec<Referral>> {
        self.inner.referrals_by_referrer(referrer).await
    }

    async fn claim_referral(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        self.inner.claim_referral(id, at).await
    }

    async fn add_referral_bonus(&self, id: Uuid, amount: i64) -> StoreResult<()> {
        self.inner.add_referral_bonus(id, amount).await
    }

    async fn insert_plan(&self, plan: Plan) -> StoreResult<()> {
        self.inner.insert_plan(plan).await
    }

    async fn get_plan(&self, id: Uuid) -> StoreResult<Plan> {
        self.inner.get_plan(id).await
    }

    async fn plans(&self) -> StoreResult<Vec<Plan>> {
        self.inner.plans().await
    }

    async fn trial_plan(&self) -> StoreResult<Option<Plan>> {
        self.inner.trial_plan().await
    }

    async fn setting(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.setting(key).await
    }

    async fn put_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        self.inner.put_setting(key, value).await
    }
}

// =====================
// Fixtures
// =====================

pub const WALLET: &str = "EQservicewallet";

/// Active, online server with its own panel URL
pub fn server(name: &str, priority: i32, capacity: u32) -> Server {
    Server {
        id: Uuid::new_v4(),
        name: name.to_string(),
        country: "NL".into(),
        panel: PanelEndpoint {
            base_url: format!("http://{}.panel", name),
            username: "admin".into(),
            password: "admin".into(),
            inbound_id: 1,
        },
        address: format!("{}.vpn.example", name),
        port: 443,
        public_key: "pbk".into(),
        short_id: "sid".into(),
        sni: "www.example.com".into(),
        is_active: true,
        priority,
        capacity,
        current_load: 0,
        health: ServerHealth::Online,
        ping_ms: Some(20),
        last_check_at: None,
        created_at: Utc::now(),
    }
}

pub fn plan(duration_days: u32, price_ton: i64, price_stars: i64) -> Plan {
    Plan {
        id: Uuid::new_v4(),
        name: format!("{} days", duration_days),
        duration_days,
        traffic_gb: 0,
        device_limit: 3,
        price_ton,
        price_stars,
        is_active: true,
        is_trial: false,
    }
}

/// Fully wired core over test doubles
pub struct Harness {
    pub store: Arc<FlakyStore>,
    pub factory: Arc<MockFactory>,
    pub source: Arc<ScriptedSource>,
    pub notifier: Arc<RecordingNotifier>,
    pub registry: Arc<ServerRegistry>,
    pub ledger: Arc<Ledger>,
    pub subscriptions: Arc<SubscriptionEngine>,
    pub referrals: Arc<ReferralService>,
    pub users: Arc<UserService>,
    pub payments: Arc<PaymentEngine>,
}

impl Harness {
    pub fn new() -> Self {
        let mut config = BillingConfig::default();
        config.ton.wallet_address = WALLET.into();

        let store = Arc::new(FlakyStore::default());
        let factory = Arc::new(MockFactory::default());
        let source = Arc::new(ScriptedSource::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let dyn_store: Arc<dyn Store> = store.clone();
        let settings = Settings::new(dyn_store.clone());
        let registry = Arc::new(ServerRegistry::new(dyn_store.clone(), factory.clone()));
        let ledger = Arc::new(Ledger::new(dyn_store.clone(), settings.clone()));
        let subscriptions = Arc::new(SubscriptionEngine::new(
            dyn_store.clone(),
            registry.clone(),
            config.panel.default_device_limit,
        ));
        let referrals = Arc::new(ReferralService::new(
            dyn_store.clone(),
            ledger.clone(),
            subscriptions.clone(),
            settings.clone(),
            notifier.clone(),
            config.pricing.stars_per_ton,
        ));
        let users = Arc::new(UserService::new(dyn_store.clone()));
        let verifier = Arc::new(ChainVerifier::new(source.clone()));
        let payments = Arc::new(PaymentEngine::new(
            dyn_store.clone(),
            ledger.clone(),
            subscriptions.clone(),
            referrals.clone(),
            verifier,
            notifier.clone(),
            &config,
        ));

        Self {
            store,
            factory,
            source,
            notifier,
            registry,
            ledger,
            subscriptions,
            referrals,
            users,
            payments,
        }
    }

    pub async fn user(&self, id: UserId) -> User {
        self.users.register(id, None).await.unwrap()
    }

    pub async fn server(&self, name: &str) -> (Server, Arc<MockPanel>) {
        let s = self.registry.add_server(server(name, 0, 100)).await.unwrap();
        let panel = self.factory.panel(&s.panel.base_url);
        (s, panel)
    }

    pub async fn plan(&self, days: u32, price_ton: i64, price_stars: i64) -> Plan {
        let p = plan(days, price_ton, price_stars);
        self.store.insert_plan(p.clone()).await.unwrap();
        p
    }

    pub async fn trial_plan(&self, days: u32) -> Plan {
        let mut p = plan(days, 0, 0);
        p.name = "trial".into();
        p.is_trial = true;
        self.store.insert_plan(p.clone()).await.unwrap();
        p
    }
}
