//! Domain records

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Numeric user identity supplied by the messaging platform
pub type UserId = i64;

/// nanoTON per TON
pub const NANO_PER_TON: i64 = 1_000_000_000;

/// Bytes per traffic gigabyte (panel convention, binary GB)
pub const BYTES_PER_GB: i64 = 1024 * 1024 * 1024;

// =====================
// Users and ledger
// =====================

/// A platform user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: Option<String>,
    /// Current balance in nanoTON, always the last ledger entry's `balance_after`
    pub balance: i64,
    /// Code other users apply to become this user's referrals
    pub referral_code: String,
    pub referred_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: UserId, username: Option<String>, referral_code: String) -> Self {
        Self {
            id,
            username,
            balance: 0,
            referral_code,
            referred_by: None,
            created_at: Utc::now(),
        }
    }
}

/// Ledger entry kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    ReferralBonus,
    TopUp,
    SubscriptionPayment,
    Refund,
    Manual,
    PromoCode,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReferralBonus => "referral_bonus",
            Self::TopUp => "top_up",
            Self::SubscriptionPayment => "subscription_payment",
            Self::Refund => "refund",
            Self::Manual => "manual",
            Self::PromoCode => "promo_code",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "referral_bonus" => Some(Self::ReferralBonus),
            "top_up" => Some(Self::TopUp),
            "subscription_payment" => Some(Self::SubscriptionPayment),
            "refund" => Some(Self::Refund),
            "manual" => Some(Self::Manual),
            "promo_code" => Some(Self::PromoCode),
            _ => None,
        }
    }
}

/// Immutable ledger entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceTransaction {
    pub id: Uuid,
    pub user_id: UserId,
    /// Signed amount in nanoTON (positive = credit)
    pub amount: i64,
    pub kind: TransactionKind,
    pub description: Option<String>,
    /// Payment, referral or promo code this movement belongs to
    pub reference_id: Option<Uuid>,
    pub balance_before: i64,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

// =====================
// Payments
// =====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentPurpose {
    Subscription,
    TopUp,
}

impl PaymentPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::TopUp => "top_up",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subscription" => Some(Self::Subscription),
            "top_up" => Some(Self::TopUp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentProvider {
    /// TON transfer to the service wallet
    OnChain,
    /// Telegram Stars invoice
    PlatformStars,
    /// Debit from the internal balance
    Balance,
}

impl PaymentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnChain => "on_chain",
            Self::PlatformStars => "platform_stars",
            Self::Balance => "balance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on_chain" => Some(Self::OnChain),
            "platform_stars" => Some(Self::PlatformStars),
            "balance" => Some(Self::Balance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    AwaitingConfirmation,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "awaiting_confirmation" => Some(Self::AwaitingConfirmation),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }
}

/// Settlement currency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    /// Amounts in nanoTON
    #[serde(rename = "TON")]
    Ton,
    /// Amounts in whole Stars
    #[serde(rename = "XTR")]
    Stars,
}

impl Currency {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Ton => "TON",
            Self::Stars => "XTR",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "TON" => Some(Self::Ton),
            "XTR" => Some(Self::Stars),
            _ => None,
        }
    }
}

/// A purchase or top-up attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: UserId,
    pub purpose: PaymentPurpose,
    pub provider: PaymentProvider,
    /// Amount in the currency's minor unit
    pub amount: i64,
    pub currency: Currency,
    pub status: PaymentStatus,
    pub plan_id: Option<Uuid>,
    pub server_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    /// On-chain transaction hash or Stars charge id
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// When the payment entered `AwaitingConfirmation`
    pub awaiting_since: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn new(
        user_id: UserId,
        purpose: PaymentPurpose,
        provider: PaymentProvider,
        amount: i64,
        currency: Currency,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            purpose,
            provider,
            amount,
            currency,
            status: PaymentStatus::Pending,
            plan_id: None,
            server_id: None,
            subscription_id: None,
            external_id: None,
            created_at: Utc::now(),
            awaiting_since: None,
            completed_at: None,
        }
    }
}

// =====================
// Plans and subscriptions
// =====================

/// A purchasable access plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub duration_days: u32,
    /// Traffic quota in GB (0 = unlimited)
    pub traffic_gb: u32,
    pub device_limit: u32,
    /// Price in nanoTON
    pub price_ton: i64,
    /// Price in Stars
    pub price_stars: i64,
    pub is_active: bool,
    /// Free plan granted once per user, never sold
    #[serde(default)]
    pub is_trial: bool,
}

impl Plan {
    /// Traffic quota in bytes (0 = unlimited)
    pub fn traffic_bytes(&self) -> i64 {
        self.traffic_gb as i64 * BYTES_PER_GB
    }

    pub fn duration(&self) -> Duration {
        Duration::days(self.duration_days as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// A user's access grant, backed by a credential on a provisioning panel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: UserId,
    pub plan_id: Uuid,
    pub server_id: Uuid,
    /// Credential id on the panel
    pub credential_id: String,
    /// External-facing credential identifier on the panel
    pub email: String,
    /// Client connection URI
    pub connection_key: String,
    pub status: SubscriptionStatus,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Quota in bytes (0 = unlimited)
    pub traffic_limit: i64,
    pub traffic_used: i64,
    pub device_limit: u32,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    /// Active status, not yet expired, and within quota when one is set
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        if self.status != SubscriptionStatus::Active {
            return false;
        }
        if self.expires_at <= now {
            return false;
        }
        self.traffic_limit == 0 || self.traffic_used < self.traffic_limit
    }

    pub fn is_active(&self) -> bool {
        self.is_active_at(Utc::now())
    }

    /// Whole days left before expiry (0 once expired)
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_days().max(0)
    }

    /// Bytes left in the quota (0 when unlimited)
    pub fn remaining_traffic(&self) -> i64 {
        if self.traffic_limit == 0 {
            0
        } else {
            (self.traffic_limit - self.traffic_used).max(0)
        }
    }
}

// =====================
// Servers
// =====================

/// Panel health as last observed by the health worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerHealth {
    Online,
    Offline,
    Unknown,
}

impl ServerHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Provisioning panel login
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelEndpoint {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub inbound_id: u32,
}

/// A provisioning endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: Uuid,
    pub name: String,
    pub country: String,
    pub panel: PanelEndpoint,
    /// Public host clients connect to
    pub address: String,
    pub port: u16,
    /// Reality public key
    pub public_key: String,
    pub short_id: String,
    /// TLS server name
    pub sni: String,
    pub is_active: bool,
    /// Lower sorts first
    pub priority: i32,
    pub capacity: u32,
    /// Approximate count of active subscriptions assigned here
    pub current_load: u32,
    pub health: ServerHealth,
    pub ping_ms: Option<u32>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Server {
    /// `current_load / capacity`, None when capacity is zero
    pub fn load_fraction(&self) -> Option<f64> {
        if self.capacity == 0 {
            None
        } else {
            Some(self.current_load as f64 / self.capacity as f64)
        }
    }

    pub fn is_online(&self) -> bool {
        self.is_active && self.health == ServerHealth::Online
    }
}

// =====================
// Referrals
// =====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralStatus {
    Pending,
    Credited,
}

impl ReferralStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Credited => "credited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "credited" => Some(Self::Credited),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Referral {
    pub id: Uuid,
    pub referrer_id: UserId,
    pub referred_id: UserId,
    pub status: ReferralStatus,
    /// Total bonus credited to the referrer so far, nanoTON
    pub bonus_accrued: i64,
    pub created_at: DateTime<Utc>,
    pub credited_at: Option<DateTime<Utc>>,
}

impl Referral {
    pub fn new(referrer_id: UserId, referred_id: UserId) -> Self {
        Self {
            id: Uuid::new_v4(),
            referrer_id,
            referred_id,
            status: ReferralStatus::Pending,
            bonus_accrued: 0,
            created_at: Utc::now(),
            credited_at: None,
        }
    }
}

/// Per-referrer summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralStats {
    pub total: usize,
    pub pending: usize,
    /// nanoTON credited across all referrals
    pub bonus_total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(expires_in: Duration, limit: i64, used: i64) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: Uuid::new_v4(),
            user_id: 1,
            plan_id: Uuid::new_v4(),
            server_id: Uuid::new_v4(),
            credential_id: "c".into(),
            email: "user_1".into(),
            connection_key: String::new(),
            status: SubscriptionStatus::Active,
            started_at: now,
            expires_at: now + expires_in,
            traffic_limit: limit,
            traffic_used: used,
            device_limit: 3,
            created_at: now,
        }
    }

    #[test]
    fn test_activity_predicate() {
        assert!(subscription(Duration::days(1), 0, 1 << 40).is_active());
        assert!(subscription(Duration::days(1), 100, 99).is_active());
        assert!(!subscription(Duration::days(1), 100, 100).is_active());
        assert!(!subscription(Duration::seconds(-1), 0, 0).is_active());

        let mut cancelled = subscription(Duration::days(1), 0, 0);
        cancelled.status = SubscriptionStatus::Cancelled;
        assert!(!cancelled.is_active());
    }

    #[test]
    fn test_load_fraction() {
        let mut server = Server {
            id: Uuid::new_v4(),
            name: "nl-1".into(),
            country: "NL".into(),
            panel: PanelEndpoint {
                base_url: "http://panel".into(),
                username: "admin".into(),
                password: "admin".into(),
                inbound_id: 1,
            },
            address: "nl.example.com".into(),
            port: 443,
            public_key: "pbk".into(),
            short_id: "sid".into(),
            sni: "www.example.com".into(),
            is_active: true,
            priority: 0,
            capacity: 0,
            current_load: 5,
            health: ServerHealth::Online,
            ping_ms: None,
            last_check_at: None,
            created_at: Utc::now(),
        };
        assert_eq!(server.load_fraction(), None);

        server.capacity = 20;
        assert_eq!(server.load_fraction(), Some(0.25));
        assert!(server.is_online());
    }

    #[test]
    fn test_plan_traffic_bytes() {
        let plan = Plan {
            id: Uuid::new_v4(),
            name: "month".into(),
            duration_days: 30,
            traffic_gb: 2,
            device_limit: 3,
            price_ton: NANO_PER_TON / 2,
            price_stars: 50,
            is_active: true,
            is_trial: false,
        };
        assert_eq!(plan.traffic_bytes(), 2 * BYTES_PER_GB);
        assert_eq!(plan.duration(), Duration::days(30));
    }

    #[test]
    fn test_status_text_matches_serde() {
        for status in [
            PaymentStatus::Pending,
            PaymentStatus::AwaitingConfirmation,
            PaymentStatus::Completed,
            PaymentStatus::Failed,
            PaymentStatus::Refunded,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json.trim_matches('"'), status.as_str());
            assert_eq!(PaymentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(Currency::parse("XTR"), Some(Currency::Stars));
        assert_eq!(PaymentProvider::parse("on_chain"), Some(PaymentProvider::OnChain));
        assert_eq!(SubscriptionStatus::parse("paused"), None);
    }
}
