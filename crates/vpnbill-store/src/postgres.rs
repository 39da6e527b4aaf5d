//! PostgreSQL store
//!
//! Enums are stored as their snake_case text. Unsigned counters are stored
//! as BIGINT and range-checked on the way out.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::model::*;
use crate::store::Store;

/// `Store` over a PostgreSQL connection pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        info!("Connecting to PostgreSQL (max {} connections)", max_connections);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("Migration failed: {}", e)))?;
        info!("Database schema is up to date");
        Ok(())
    }
}

fn decode<T>(row: &PgRow, column: &str, parse: fn(&str) -> Option<T>) -> StoreResult<T> {
    let text: String = row.try_get(column)?;
    parse(&text).ok_or_else(|| StoreError::Backend(format!("Unknown {} '{}'", column, text)))
}

fn unsigned(row: &PgRow, column: &str) -> StoreResult<u32> {
    let value: i64 = row.try_get(column)?;
    u32::try_from(value)
        .map_err(|_| StoreError::Backend(format!("{} out of range: {}", column, value)))
}

fn user_row(row: &PgRow) -> StoreResult<User> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        balance: row.try_get("balance")?,
        referral_code: row.try_get("referral_code")?,
        referred_by: row.try_get("referred_by")?,
        created_at: row.try_get("created_at")?,
    })
}

fn entry_row(row: &PgRow) -> StoreResult<BalanceTransaction> {
    Ok(BalanceTransaction {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        amount: row.try_get("amount")?,
        kind: decode(row, "kind", TransactionKind::parse)?,
        description: row.try_get("description")?,
        reference_id: row.try_get("reference_id")?,
        balance_before: row.try_get("balance_before")?,
        balance_after: row.try_get("balance_after")?,
        created_at: row.try_get("created_at")?,
    })
}

fn payment_row(row: &PgRow) -> StoreResult<Payment> {
    Ok(Payment {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        purpose: decode(row, "purpose", PaymentPurpose::parse)?,
        provider: decode(row, "provider", PaymentProvider::parse)?,
        amount: row.try_get("amount")?,
        currency: decode(row, "currency", Currency::parse)?,
        status: decode(row, "status", PaymentStatus::parse)?,
        plan_id: row.try_get("plan_id")?,
        server_id: row.try_get("server_id")?,
        subscription_id: row.try_get("subscription_id")?,
        external_id: row.try_get("external_id")?,
        created_at: row.try_get("created_at")?,
        awaiting_since: row.try_get("awaiting_since")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn subscription_row(row: &PgRow) -> StoreResult<Subscription> {
    Ok(Subscription {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        plan_id: row.try_get("plan_id")?,
        server_id: row.try_get("server_id")?,
        credential_id: row.try_get("credential_id")?,
        email: row.try_get("email")?,
        connection_key: row.try_get("connection_key")?,
        status: decode(row, "status", SubscriptionStatus::parse)?,
        started_at: row.try_get("started_at")?,
        expires_at: row.try_get("expires_at")?,
        traffic_limit: row.try_get("traffic_limit")?,
        traffic_used: row.try_get("traffic_used")?,
        device_limit: unsigned(row, "device_limit")?,
        created_at: row.try_get("created_at")?,
    })
}

fn server_row(row: &PgRow) -> StoreResult<Server> {
    let port: i32 = row.try_get("port")?;
    let ping_ms: Option<i64> = row.try_get("ping_ms")?;
    Ok(Server {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        country: row.try_get("country")?,
        panel: PanelEndpoint {
            base_url: row.try_get("panel_url")?,
            username: row.try_get("panel_username")?,
            password: row.try_get("panel_password")?,
            inbound_id: unsigned(row, "inbound_id")?,
        },
        address: row.try_get("address")?,
        port: u16::try_from(port)
            .map_err(|_| StoreError::Backend(format!("port out of range: {}", port)))?,
        public_key: row.try_get("public_key")?,
        short_id: row.try_get("short_id")?,
        sni: row.try_get("sni")?,
        is_active: row.try_get("is_active")?,
        priority: row.try_get("priority")?,
        capacity: unsigned(row, "capacity")?,
        current_load: unsigned(row, "current_load")?,
        health: decode(row, "health", ServerHealth::parse)?,
        ping_ms: ping_ms.and_then(|p| u32::try_from(p).ok()),
        last_check_at: row.try_get("last_check_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn referral_row(row: &PgRow) -> StoreResult<Referral> {
    Ok(Referral {
        id: row.try_get("id")?,
        referrer_id: row.try_get("referrer_id")?,
        referred_id: row.try_get("referred_id")?,
        status: decode(row, "status", ReferralStatus::parse)?,
        bonus_accrued: row.try_get("bonus_accrued")?,
        created_at: row.try_get("created_at")?,
        credited_at: row.try_get("credited_at")?,
    })
}

fn plan_row(row: &PgRow) -> StoreResult<Plan> {
    Ok(Plan {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        duration_days: unsigned(row, "duration_days")?,
        traffic_gb: unsigned(row, "traffic_gb")?,
        device_limit: unsigned(row, "device_limit")?,
        price_ton: row.try_get("price_ton")?,
        price_stars: row.try_get("price_stars")?,
        is_active: row.try_get("is_active")?,
        is_trial: row.try_get("is_trial")?,
    })
}

fn collect<T>(rows: Vec<PgRow>, map: fn(&PgRow) -> StoreResult<T>) -> StoreResult<Vec<T>> {
    rows.iter().map(map).collect()
}

#[async_trait]
impl Store for PgStore {
    async fn insert_user(&self, user: User) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO users (id, username, balance, referral_code, referred_by, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(user.balance)
        .bind(&user.referral_code)
        .bind(user.referred_by)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> StoreResult<User> {
        let row = sqlx::query("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("user", id))?;
        user_row(&row)
    }

    async fn user_by_referral_code(&self, code: &str) -> StoreResult<User> {
        let row = sqlx::query("SELECT * FROM users WHERE referral_code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("referral code", code))?;
        user_row(&row)
    }

    async fn set_referrer(&self, id: UserId, referrer: UserId) -> StoreResult<()> {
        let done = sqlx::query("UPDATE users SET referred_by = $2 WHERE id = $1")
            .bind(id)
            .bind(referrer)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::not_found("user", id));
        }
        Ok(())
    }

    async fn append_balance_transaction(&self, entry: BalanceTransaction) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let balance =
            sqlx::query_scalar::<_, i64>("SELECT balance FROM users WHERE id = $1 FOR UPDATE")
                .bind(entry.user_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::not_found("user", entry.user_id))?;

        if balance != entry.balance_before {
            return Err(StoreError::Conflict(format!(
                "balance of user {} moved: stored {}, entry expects {}",
                entry.user_id, balance, entry.balance_before
            )));
        }

        sqlx::query(
            "INSERT INTO balance_transactions
                (id, user_id, amount, kind, description, reference_id,
                 balance_before, balance_after, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(entry.amount)
        .bind(entry.kind.as_str())
        .bind(&entry.description)
        .bind(entry.reference_id)
        .bind(entry.balance_before)
        .bind(entry.balance_after)
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE users SET balance = $2 WHERE id = $1")
            .bind(entry.user_id)
            .bind(entry.balance_after)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(
            "Ledger append: user={} kind={} amount={} balance={}",
            entry.user_id,
            entry.kind.as_str(),
            entry.amount,
            entry.balance_after
        );
        Ok(())
    }

    async fn balance_transactions(
        &self,
        user: UserId,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<BalanceTransaction>> {
        let rows = sqlx::query(
            "SELECT * FROM balance_transactions WHERE user_id = $1
             ORDER BY seq DESC LIMIT $2 OFFSET $3",
        )
        .bind(user)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, entry_row)
    }

    async fn ledger_history(&self, user: UserId) -> StoreResult<Vec<BalanceTransaction>> {
        let rows = sqlx::query("SELECT * FROM balance_transactions WHERE user_id = $1 ORDER BY seq")
            .bind(user)
            .fetch_all(&self.pool)
            .await?;
        collect(rows, entry_row)
    }

    async fn insert_payment(&self, payment: Payment) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO payments
                (id, user_id, purpose, provider, amount, currency, status, plan_id,
                 server_id, subscription_id, external_id, created_at, awaiting_since,
                 completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(payment.id)
        .bind(payment.user_id)
        .bind(payment.purpose.as_str())
        .bind(payment.provider.as_str())
        .bind(payment.amount)
        .bind(payment.currency.code())
        .bind(payment.status.as_str())
        .bind(payment.plan_id)
        .bind(payment.server_id)
        .bind(payment.subscription_id)
        .bind(&payment.external_id)
        .bind(payment.created_at)
        .bind(payment.awaiting_since)
        .bind(payment.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_payment(&self, id: Uuid) -> StoreResult<Payment> {
        let row = sqlx::query("SELECT * FROM payments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("payment", id))?;
        payment_row(&row)
    }

    async fn update_payment(&self, payment: &Payment) -> StoreResult<()> {
        let done = sqlx::query(
            "UPDATE payments SET
                amount = $2, status = $3, plan_id = $4, server_id = $5,
                subscription_id = $6, external_id = $7, awaiting_since = $8,
                completed_at = $9
             WHERE id = $1",
        )
        .bind(payment.id)
        .bind(payment.amount)
        .bind(payment.status.as_str())
        .bind(payment.plan_id)
        .bind(payment.server_id)
        .bind(payment.subscription_id)
        .bind(&payment.external_id)
        .bind(payment.awaiting_since)
        .bind(payment.completed_at)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::not_found("payment", payment.id));
        }
        Ok(())
    }

    async fn payments_with_status(&self, status: PaymentStatus) -> StoreResult<Vec<Payment>> {
        let rows = sqlx::query("SELECT * FROM payments WHERE status = $1 ORDER BY created_at")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        collect(rows, payment_row)
    }

    async fn user_payments(&self, user: UserId) -> StoreResult<Vec<Payment>> {
        let rows =
            sqlx::query("SELECT * FROM payments WHERE user_id = $1 ORDER BY created_at DESC")
                .bind(user)
                .fetch_all(&self.pool)
                .await?;
        collect(rows, payment_row)
    }

    async fn insert_subscription(&self, sub: Subscription) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO subscriptions
                (id, user_id, plan_id, server_id, credential_id, email, connection_key,
                 status, started_at, expires_at, traffic_limit, traffic_used,
                 device_limit, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(sub.id)
        .bind(sub.user_id)
        .bind(sub.plan_id)
        .bind(sub.server_id)
        .bind(&sub.credential_id)
        .bind(&sub.email)
        .bind(&sub.connection_key)
        .bind(sub.status.as_str())
        .bind(sub.started_at)
        .bind(sub.expires_at)
        .bind(sub.traffic_limit)
        .bind(sub.traffic_used)
        .bind(i64::from(sub.device_limit))
        .bind(sub.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_subscription(&self, id: Uuid) -> StoreResult<Subscription> {
        let row = sqlx::query("SELECT * FROM subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("subscription", id))?;
        subscription_row(&row)
    }

    async fn update_subscription(&self, sub: &Subscription) -> StoreResult<()> {
        let done = sqlx::query(
            "UPDATE subscriptions SET
                server_id = $2, credential_id = $3, email = $4, connection_key = $5,
                status = $6, expires_at = $7, traffic_limit = $8, traffic_used = $9,
                device_limit = $10
             WHERE id = $1",
        )
        .bind(sub.id)
        .bind(sub.server_id)
        .bind(&sub.credential_id)
        .bind(&sub.email)
        .bind(&sub.connection_key)
        .bind(sub.status.as_str())
        .bind(sub.expires_at)
        .bind(sub.traffic_limit)
        .bind(sub.traffic_used)
        .bind(i64::from(sub.device_limit))
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::not_found("subscription", sub.id));
        }
        Ok(())
    }

    async fn active_subscription(&self, user: UserId) -> StoreResult<Option<Subscription>> {
        sqlx::query(
            "SELECT * FROM subscriptions WHERE user_id = $1 AND status = 'active'
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| subscription_row(&row))
        .transpose()
    }

    async fn active_subscriptions(&self) -> StoreResult<Vec<Subscription>> {
        let rows = sqlx::query("SELECT * FROM subscriptions WHERE status = 'active'")
            .fetch_all(&self.pool)
            .await?;
        collect(rows, subscription_row)
    }

    async fn lapsed_subscriptions(&self, now: DateTime<Utc>) -> StoreResult<Vec<Subscription>> {
        let rows = sqlx::query(
            "SELECT * FROM subscriptions WHERE status = 'active' AND expires_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        collect(rows, subscription_row)
    }

    async fn count_active_on_server(&self, server: Uuid) -> StoreResult<u32> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM subscriptions WHERE server_id = $1 AND status = 'active'",
        )
        .bind(server)
        .fetch_one(&self.pool)
        .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn has_used_trial(&self, user: UserId) -> StoreResult<bool> {
        let used = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (
                SELECT 1 FROM subscriptions s JOIN plans p ON p.id = s.plan_id
                WHERE s.user_id = $1 AND p.is_trial
             )",
        )
        .bind(user)
        .fetch_one(&self.pool)
        .await?;
        Ok(used)
    }

    async fn insert_server(&self, server: Server) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO servers
                (id, name, country, panel_url, panel_username, panel_password, inbound_id,
                 address, port, public_key, short_id, sni, is_active, priority, capacity,
                 current_load, health, ping_ms, last_check_at, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                     $16, $17, $18, $19, $20)",
        )
        .bind(server.id)
        .bind(&server.name)
        .bind(&server.country)
        .bind(&server.panel.base_url)
        .bind(&server.panel.username)
        .bind(&server.panel.password)
        .bind(i64::from(server.panel.inbound_id))
        .bind(&server.address)
        .bind(i32::from(server.port))
        .bind(&server.public_key)
        .bind(&server.short_id)
        .bind(&server.sni)
        .bind(server.is_active)
        .bind(server.priority)
        .bind(i64::from(server.capacity))
        .bind(i64::from(server.current_load))
        .bind(server.health.as_str())
        .bind(server.ping_ms.map(i64::from))
        .bind(server.last_check_at)
        .bind(server.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_server(&self, id: Uuid) -> StoreResult<Server> {
        let row = sqlx::query("SELECT * FROM servers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("server", id))?;
        server_row(&row)
    }

    async fn update_server(&self, server: &Server) -> StoreResult<()> {
        let done = sqlx::query(
            "UPDATE servers SET
                name = $2, country = $3, panel_url = $4, panel_username = $5,
                panel_password = $6, inbound_id = $7, address = $8, port = $9,
                public_key = $10, short_id = $11, sni = $12, is_active = $13,
                priority = $14, capacity = $15, current_load = $16, health = $17,
                ping_ms = $18, last_check_at = $19
             WHERE id = $1",
        )
        .bind(server.id)
        .bind(&server.name)
        .bind(&server.country)
        .bind(&server.panel.base_url)
        .bind(&server.panel.username)
        .bind(&server.panel.password)
        .bind(i64::from(server.panel.inbound_id))
        .bind(&server.address)
        .bind(i32::from(server.port))
        .bind(&server.public_key)
        .bind(&server.short_id)
        .bind(&server.sni)
        .bind(server.is_active)
        .bind(server.priority)
        .bind(i64::from(server.capacity))
        .bind(i64::from(server.current_load))
        .bind(server.health.as_str())
        .bind(server.ping_ms.map(i64::from))
        .bind(server.last_check_at)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::not_found("server", server.id));
        }
        Ok(())
    }

    async fn delete_server(&self, id: Uuid) -> StoreResult<()> {
        let done = sqlx::query("DELETE FROM servers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::not_found("server", id));
        }
        Ok(())
    }

    async fn servers(&self) -> StoreResult<Vec<Server>> {
        let rows = sqlx::query("SELECT * FROM servers ORDER BY priority, name")
            .fetch_all(&self.pool)
            .await?;
        collect(rows, server_row)
    }

    async fn adjust_server_load(&self, id: Uuid, delta: i32) -> StoreResult<u32> {
        let load = sqlx::query_scalar::<_, i64>(
            "UPDATE servers SET current_load = GREATEST(current_load + $2, 0)
             WHERE id = $1 RETURNING current_load",
        )
        .bind(id)
        .bind(i64::from(delta))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("server", id))?;
        Ok(u32::try_from(load).unwrap_or(u32::MAX))
    }

    async fn set_server_load(&self, id: Uuid, load: u32) -> StoreResult<()> {
        let done = sqlx::query("UPDATE servers SET current_load = $2 WHERE id = $1")
            .bind(id)
            .bind(i64::from(load))
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::not_found("server", id));
        }
        Ok(())
    }

    async fn record_server_health(
        &self,
        id: Uuid,
        health: ServerHealth,
        ping_ms: Option<u32>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let done = sqlx::query(
            "UPDATE servers SET health = $2, ping_ms = $3, last_check_at = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(health.as_str())
        .bind(ping_ms.map(i64::from))
        .bind(at)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::not_found("server", id));
        }
        Ok(())
    }

    async fn insert_referral(&self, referral: Referral) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO referrals
                (id, referrer_id, referred_id, status, bonus_accrued, created_at, credited_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(referral.id)
        .bind(referral.referrer_id)
        .bind(referral.referred_id)
        .bind(referral.status.as_str())
        .bind(referral.bonus_accrued)
        .bind(referral.created_at)
        .bind(referral.credited_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn referral_for_referred(&self, referred: UserId) -> StoreResult<Option<Referral>> {
        sqlx::query("SELECT * FROM referrals WHERE referred_id = $1")
            .bind(referred)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| referral_row(&row))
            .transpose()
    }

    async fn referrals_by_referrer(&self, referrer: UserId) -> StoreResult<Vec<Referral>> {
        let rows =
            sqlx::query("SELECT * FROM referrals WHERE referrer_id = $1 ORDER BY created_at DESC")
                .bind(referrer)
                .fetch_all(&self.pool)
                .await?;
        collect(rows, referral_row)
    }

    async fn claim_referral(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        let done = sqlx::query(
            "UPDATE referrals SET status = 'credited', credited_at = $2
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 1 {
            return Ok(true);
        }

        let exists =
            sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM referrals WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        if exists {
            Ok(false)
        } else {
            Err(StoreError::not_found("referral", id))
        }
    }

    async fn add_referral_bonus(&self, id: Uuid, amount: i64) -> StoreResult<()> {
        let done =
            sqlx::query("UPDATE referrals SET bonus_accrued = bonus_accrued + $2 WHERE id = $1")
                .bind(id)
                .bind(amount)
                .execute(&self.pool)
                .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::not_found("referral", id));
        }
        Ok(())
    }

    async fn insert_plan(&self, plan: Plan) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO plans
                (id, name, duration_days, traffic_gb, device_limit, price_ton, price_stars,
                 is_active, is_trial)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(plan.id)
        .bind(&plan.name)
        .bind(i64::from(plan.duration_days))
        .bind(i64::from(plan.traffic_gb))
        .bind(i64::from(plan.device_limit))
        .bind(plan.price_ton)
        .bind(plan.price_stars)
        .bind(plan.is_active)
        .bind(plan.is_trial)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_plan(&self, id: Uuid) -> StoreResult<Plan> {
        let row = sqlx::query("SELECT * FROM plans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("plan", id))?;
        plan_row(&row)
    }

    async fn plans(&self) -> StoreResult<Vec<Plan>> {
        let rows = sqlx::query("SELECT * FROM plans ORDER BY price_ton")
            .fetch_all(&self.pool)
            .await?;
        collect(rows, plan_row)
    }

    async fn trial_plan(&self) -> StoreResult<Option<Plan>> {
        sqlx::query(
            "SELECT * FROM plans WHERE is_trial AND is_active ORDER BY duration_days LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .map(|row| plan_row(&row))
        .transpose()
    }

    async fn setting(&self, key: &str) -> StoreResult<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn put_setting(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
