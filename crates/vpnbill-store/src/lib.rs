//! VPN Billing Storage
//!
//! Domain records shared by every billing component and the `Store` seam
//! they persist through:
//! - Users and their derived balance
//! - Balance transactions (append-only ledger)
//! - Payments, subscriptions, referrals, plans
//! - Provisioning servers and their load/health
//!
//! `PgStore` persists to PostgreSQL; `MemoryStore` keeps everything in
//! process for tests and tooling.

pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use model::*;
pub use postgres::PgStore;
pub use store::Store;
