//! Subscription lifecycle
//!
//! Keeps each subscription row consistent with its credential on the remote
//! panel:
//! - Create: provision remotely, then persist; a failed persist deletes the
//!   fresh credential again
//! - Extend: update remotely first; local state only moves once the panel
//!   accepted the change
//! - Switch: provision on the target, persist, then release the old server
//! - Cancel: remote delete must succeed
//! - Expire: only rows still lapsed under the lock; remote delete is
//!   best-effort
//!
//! Lifecycle operations on one subscription are serialized by an advisory
//! per-subscription lock. Creation is serialized per user so a user never
//! ends up with two active rows.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vpnbill_panel::{vless_uri, Credential, CredentialSpec, ProvisioningPanel};
use vpnbill_store::{
    Plan, Server, Store, Subscription, SubscriptionStatus, UserId, BYTES_PER_GB,
};

use crate::error::{CoreError, CoreResult};
use crate::locks::{KeyedGuard, KeyedLocks};
use crate::registry::ServerRegistry;

/// A credential created on a panel but not yet recorded locally
pub struct ProvisionedCredential {
    panel: Arc<dyn ProvisioningPanel>,
    pub server: Server,
    pub credential: Credential,
}

impl ProvisionedCredential {
    /// Undo the remote create
    pub async fn compensate(self) {
        match self.panel.delete(&self.credential.id).await {
            Ok(()) => info!(
                "Compensated credential {} on {}",
                self.credential.id, self.server.name
            ),
            Err(e) => warn!(
                "Failed to delete orphaned credential {} on {}: {}",
                self.credential.id, self.server.name, e
            ),
        }
    }

    pub fn connection_key(&self) -> String {
        vless_uri(&self.credential.id, &self.server, &self.credential.email)
    }
}

pub struct SubscriptionEngine {
    store: Arc<dyn Store>,
    registry: Arc<ServerRegistry>,
    default_device_limit: u32,
    sub_locks: KeyedLocks<Uuid>,
    user_locks: KeyedLocks<UserId>,
}

/// Panel identifier for a new credential of `user`
fn credential_email(user: UserId, now: DateTime<Utc>) -> String {
    format!("user_{}_{}", user, now.timestamp())
}

impl SubscriptionEngine {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ServerRegistry>,
        default_device_limit: u32,
    ) -> Self {
        Self {
            store,
            registry,
            default_device_limit,
            sub_locks: KeyedLocks::new(),
            user_locks: KeyedLocks::new(),
        }
    }

    async fn lock_subscription(&self, id: Uuid) -> KeyedGuard<'_, Uuid> {
        self.sub_locks.lock(id).await
    }

    async fn lock_user(&self, user: UserId) -> KeyedGuard<'_, UserId> {
        self.user_locks.lock(user).await
    }

    fn device_limit(&self, requested: u32) -> u32 {
        if requested == 0 {
            self.default_device_limit
        } else {
            requested
        }
    }

    pub async fn get(&self, id: Uuid) -> CoreResult<Subscription> {
        Ok(self.store.get_subscription(id).await?)
    }

    /// The user's active subscription, if it is still usable
    pub async fn active_for(&self, user: UserId) -> CoreResult<Option<Subscription>> {
        Ok(self
            .store
            .active_subscription(user)
            .await?
            .filter(|s| s.is_active_at(Utc::now())))
    }

    pub async fn connection_key(&self, user: UserId) -> CoreResult<String> {
        self.active_for(user)
            .await?
            .map(|s| s.connection_key)
            .ok_or(CoreError::NoActiveSubscription(user))
    }

    async fn provision(
        &self,
        server: Server,
        spec: CredentialSpec,
    ) -> CoreResult<ProvisionedCredential> {
        let panel = self.registry.panel_for(&server)?;
        let credential = panel.create(&spec).await?;
        Ok(ProvisionedCredential {
            panel,
            server,
            credential,
        })
    }

    /// Grant `plan` to `user`: extend the active subscription when there is
    /// one, otherwise provision a new credential.
    pub async fn create(
        &self,
        user: UserId,
        plan: &Plan,
        preferred_server: Option<Uuid>,
    ) -> CoreResult<Subscription> {
        let _user_guard = self.lock_user(user).await;
        self.create_locked(user, plan, preferred_server).await
    }

    /// Grant the trial plan. Only for users without a usable subscription
    /// who never held a trial before.
    pub async fn activate_trial(&self, user: UserId) -> CoreResult<Subscription> {
        let _user_guard = self.lock_user(user).await;

        if let Some(existing) = self.store.active_subscription(user).await? {
            if existing.is_active_at(Utc::now()) {
                return Err(CoreError::SubscriptionActive(user));
            }
        }
        if self.store.has_used_trial(user).await? {
            return Err(CoreError::TrialAlreadyUsed(user));
        }
        let plan = self
            .store
            .trial_plan()
            .await?
            .ok_or_else(|| CoreError::NotFound("trial plan".into()))?;

        info!(
            "Activating {} day trial for user {}",
            plan.duration_days, user
        );
        self.create_locked(user, &plan, None).await
    }

    async fn create_locked(
        &self,
        user: UserId,
        plan: &Plan,
        preferred_server: Option<Uuid>,
    ) -> CoreResult<Subscription> {
        let now = Utc::now();

        if let Some(existing) = self.store.active_subscription(user).await? {
            let _guard = self.lock_subscription(existing.id).await;
            let existing = self.store.get_subscription(existing.id).await?;

            if existing.is_active_at(now) {
                info!(
                    "Extending subscription {} of user {} by {} days",
                    existing.id, user, plan.duration_days
                );
                return self.extend_locked(existing, plan.duration_days).await;
            }
            if existing.status == SubscriptionStatus::Active {
                info!("Expiring stale subscription {} before new grant", existing.id);
                self.expire_locked(existing).await?;
            }
        }

        let server = self.registry.pick(preferred_server).await?;
        let email = credential_email(user, now);
        let device_limit = self.device_limit(plan.device_limit);

        debug!(
            "Provisioning {} on {} ({} days, {} GB, {} devices)",
            email, server.name, plan.duration_days, plan.traffic_gb, device_limit
        );
        let provisioned = self
            .provision(
                server,
                CredentialSpec {
                    id: None,
                    email: email.clone(),
                    quota_bytes: plan.traffic_bytes(),
                    duration_days: plan.duration_days,
                    device_limit,
                },
            )
            .await?;

        let sub = Subscription {
            id: Uuid::new_v4(),
            user_id: user,
            plan_id: plan.id,
            server_id: provisioned.server.id,
            credential_id: provisioned.credential.id.clone(),
            email: provisioned.credential.email.clone(),
            connection_key: provisioned.connection_key(),
            status: SubscriptionStatus::Active,
            started_at: now,
            expires_at: now + plan.duration(),
            traffic_limit: plan.traffic_bytes(),
            traffic_used: 0,
            device_limit,
            created_at: now,
        };

        if let Err(e) = self.store.insert_subscription(sub.clone()).await {
            provisioned.compensate().await;
            return Err(e.into());
        }

        if let Err(e) = self.registry.increment_load(sub.server_id).await {
            warn!("Failed to increment load of server {}: {}", sub.server_id, e);
        }

        info!(
            "Subscription {} created for user {} on {} until {}",
            sub.id, user, provisioned.server.name, sub.expires_at
        );
        Ok(sub)
    }

    /// Push `days` more validity to the panel, then record it
    pub async fn extend(&self, id: Uuid, days: u32) -> CoreResult<Subscription> {
        let _guard = self.lock_subscription(id).await;
        let sub = self.store.get_subscription(id).await?;
        self.extend_locked(sub, days).await
    }

    async fn extend_locked(&self, mut sub: Subscription, days: u32) -> CoreResult<Subscription> {
        if sub.status != SubscriptionStatus::Active {
            return Err(CoreError::InvalidState(format!(
                "subscription {} is not active",
                sub.id
            )));
        }

        let server = self.registry.get(sub.server_id).await?;
        let panel = self.registry.panel_for(&server)?;
        let new_expiry = sub.expires_at + Duration::days(days as i64);
        let device_limit = self.device_limit(sub.device_limit);

        let email = self
            .push_limits(&panel, &sub, sub.traffic_limit, new_expiry, device_limit)
            .await?;
        if email != sub.email {
            sub.email = email;
            sub.connection_key = vless_uri(&sub.credential_id, &server, &sub.email);
        }

        sub.expires_at = new_expiry;
        sub.device_limit = device_limit;
        self.store.update_subscription(&sub).await?;

        info!("Subscription {} extended to {}", sub.id, sub.expires_at);
        Ok(sub)
    }

    /// Apply limits on the panel, recreating the credential when the panel
    /// lost it. Returns the identifier the credential ends up with.
    async fn push_limits(
        &self,
        panel: &Arc<dyn ProvisioningPanel>,
        sub: &Subscription,
        quota_bytes: i64,
        expires_at: DateTime<Utc>,
        device_limit: u32,
    ) -> CoreResult<String> {
        let expiry_ms = expires_at.timestamp_millis();
        let err = match panel
            .extend(&sub.credential_id, &sub.email, quota_bytes, expiry_ms, device_limit)
            .await
        {
            Ok(()) => return Ok(sub.email.clone()),
            Err(e) => e,
        };

        if err.is_duplicate() {
            warn!("Identifier {} is taken on the panel, renaming", sub.email);
            if let Err(e) = panel.delete(&sub.credential_id).await {
                debug!("Cleanup of {} before rename: {}", sub.credential_id, e);
            }
            let renamed = format!("{}_{}", sub.email, Utc::now().timestamp());
            return self
                .recreate(panel, sub, &renamed, quota_bytes, expiry_ms, device_limit)
                .await;
        }
        if !err.is_not_found() {
            return Err(err.into());
        }

        warn!(
            "Credential {} missing on the panel, recreating",
            sub.credential_id
        );
        match self
            .recreate(panel, sub, &sub.email, quota_bytes, expiry_ms, device_limit)
            .await
        {
            Err(CoreError::Panel(e)) if e.is_duplicate() => {
                let renamed = format!("{}_{}", sub.email, Utc::now().timestamp());
                warn!("Identifier {} is taken, recreating as {}", sub.email, renamed);
                self.recreate(panel, sub, &renamed, quota_bytes, expiry_ms, device_limit)
                    .await
            }
            other => other,
        }
    }

    async fn recreate(
        &self,
        panel: &Arc<dyn ProvisioningPanel>,
        sub: &Subscription,
        email: &str,
        quota_bytes: i64,
        expiry_ms: i64,
        device_limit: u32,
    ) -> CoreResult<String> {
        let spec = CredentialSpec {
            id: Some(sub.credential_id.clone()),
            email: email.to_string(),
            quota_bytes,
            duration_days: 0,
            device_limit,
        };
        let credential = panel.create(&spec).await?;
        panel
            .extend(&credential.id, &credential.email, quota_bytes, expiry_ms, device_limit)
            .await?;
        Ok(credential.email)
    }

    /// Move the user's active subscription to `target`, keeping the
    /// remaining time and traffic.
    pub async fn switch_server(&self, user: UserId, target: Uuid) -> CoreResult<Subscription> {
        let active = self
            .active_for(user)
            .await?
            .ok_or(CoreError::NoActiveSubscription(user))?;
        let _guard = self.lock_subscription(active.id).await;
        let mut sub = self.store.get_subscription(active.id).await?;
        let now = Utc::now();
        if !sub.is_active_at(now) {
            return Err(CoreError::NoActiveSubscription(user));
        }
        if sub.server_id == target {
            return Ok(sub);
        }

        let new_server = self.registry.get(target).await?;
        if !new_server.is_online() {
            return Err(CoreError::InvalidState(format!(
                "server {} is not available",
                new_server.name
            )));
        }

        let remaining_days = sub.days_remaining(now).max(1) as u32;
        let quota = if sub.traffic_limit == 0 {
            0
        } else {
            sub.remaining_traffic().max(BYTES_PER_GB)
        };
        let device_limit = self.device_limit(sub.device_limit);
        let email = credential_email(user, now);

        info!(
            "Switching subscription {} of user {} to {} ({} days left)",
            sub.id, user, new_server.name, remaining_days
        );
        let provisioned = self
            .provision(
                new_server,
                CredentialSpec {
                    id: None,
                    email,
                    quota_bytes: quota,
                    duration_days: remaining_days,
                    device_limit,
                },
            )
            .await?;

        // Pin the exact expiry; the create call only knows whole days
        if let Err(e) = provisioned
            .panel
            .extend(
                &provisioned.credential.id,
                &provisioned.credential.email,
                quota,
                sub.expires_at.timestamp_millis(),
                device_limit,
            )
            .await
        {
            provisioned.compensate().await;
            return Err(e.into());
        }

        let old_server = sub.server_id;
        let old_credential = sub.credential_id.clone();

        sub.server_id = provisioned.server.id;
        sub.credential_id = provisioned.credential.id.clone();
        sub.email = provisioned.credential.email.clone();
        sub.connection_key = provisioned.connection_key();
        sub.traffic_limit = quota;
        sub.traffic_used = 0;
        sub.device_limit = device_limit;

        if let Err(e) = self.store.update_subscription(&sub).await {
            provisioned.compensate().await;
            return Err(e.into());
        }

        if let Err(e) = self.registry.increment_load(sub.server_id).await {
            warn!("Failed to increment load of server {}: {}", sub.server_id, e);
        }
        self.release_remote(old_server, &old_credential).await;
        self.registry.release(old_server).await;

        Ok(sub)
    }

    /// Best-effort credential delete
    async fn release_remote(&self, server_id: Uuid, credential_id: &str) {
        let panel = match self.registry.panel(server_id).await {
            Ok(panel) => panel,
            Err(e) => {
                warn!("No panel for server {}: {}", server_id, e);
                return;
            }
        };
        if let Err(e) = panel.delete(credential_id).await {
            warn!(
                "Failed to delete credential {} on server {}: {}",
                credential_id, server_id, e
            );
        }
    }

    /// Revoke access. Fails without local change when the panel refuses.
    pub async fn cancel(&self, id: Uuid) -> CoreResult<Subscription> {
        let _guard = self.lock_subscription(id).await;
        let mut sub = self.store.get_subscription(id).await?;
        if sub.status != SubscriptionStatus::Active {
            return Err(CoreError::InvalidState(format!(
                "subscription {} is not active",
                id
            )));
        }

        let panel = self.registry.panel(sub.server_id).await?;
        match panel.delete(&sub.credential_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!("Credential {} already gone", sub.credential_id);
            }
            Err(e) => return Err(e.into()),
        }

        sub.status = SubscriptionStatus::Cancelled;
        self.store.update_subscription(&sub).await?;
        self.registry.release(sub.server_id).await;

        info!("Subscription {} cancelled", id);
        Ok(sub)
    }

    /// Mark the subscription expired if it is still active and lapsed at
    /// `now`. Returns the expired row, or None when it was left alone
    /// (already inactive, or extended since it was listed). The remote
    /// delete is attempted but never blocks expiry.
    pub async fn expire(&self, id: Uuid, now: DateTime<Utc>) -> CoreResult<Option<Subscription>> {
        let _guard = self.lock_subscription(id).await;
        let sub = self.store.get_subscription(id).await?;
        if sub.status != SubscriptionStatus::Active || sub.expires_at > now {
            debug!("Subscription {} no longer due for expiry", id);
            return Ok(None);
        }
        self.expire_locked(sub).await.map(Some)
    }

    async fn expire_locked(&self, mut sub: Subscription) -> CoreResult<Subscription> {
        self.release_remote(sub.server_id, &sub.credential_id).await;

        sub.status = SubscriptionStatus::Expired;
        self.store.update_subscription(&sub).await?;
        self.registry.release(sub.server_id).await;

        info!("Subscription {} of user {} expired", sub.id, sub.user_id);
        Ok(sub)
    }

    /// Overwrite the used-traffic counter with the panel's figure
    pub async fn sync_usage(&self, id: Uuid) -> CoreResult<Subscription> {
        let _guard = self.lock_subscription(id).await;
        let mut sub = self.store.get_subscription(id).await?;

        let panel = self.registry.panel(sub.server_id).await?;
        let usage = panel.usage(&sub.email).await?;
        sub.traffic_used = usage.total();
        self.store.update_subscription(&sub).await?;
        Ok(sub)
    }
}
