//! VPN Billing Core
//!
//! Turns payments into VPN access:
//! - Balance ledger with per-user serialized movements
//! - Payment state machine over on-chain, Stars and balance providers
//! - Subscription lifecycle kept in step with the provisioning panels
//! - Server selection by load, health probing and load resync
//! - Referral bonuses
//! - Background confirmation, expiry and health workers

pub mod config;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod notifier;
pub mod payment;
pub mod referral;
pub mod registry;
pub mod settings;
pub mod subscription;
pub mod users;
pub mod workers;

#[cfg(test)]
mod testkit;

pub use config::{BillingConfig, PlanSeed, ServerSeed};
pub use error::{CoreError, CoreResult};
pub use ledger::{Ledger, TopUpCredit};
pub use notifier::{LogNotifier, Notification, Notifier, TelegramNotifier};
pub use payment::{OnChainInvoice, PaymentEngine};
pub use referral::{ReferralCredit, ReferralService};
pub use registry::ServerRegistry;
pub use settings::Settings;
pub use subscription::{ProvisionedCredential, SubscriptionEngine};
pub use users::UserService;
pub use workers::{ConfirmationWorker, ExpiryWorker, HealthWorker};
