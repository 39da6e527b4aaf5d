//! User registration

use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::info;
use vpnbill_store::{Store, StoreError, User, UserId};

use crate::error::{CoreError, CoreResult};

/// Length of generated referral codes
pub const REFERRAL_CODE_LEN: usize = 8;

const CODE_ATTEMPTS: usize = 16;

pub struct UserService {
    store: Arc<dyn Store>,
}

fn random_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REFERRAL_CODE_LEN)
        .map(|b| (b as char).to_ascii_uppercase())
        .collect()
}

impl UserService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Return the user, creating it with a fresh referral code on first contact
    pub async fn register(&self, id: UserId, username: Option<String>) -> CoreResult<User> {
        match self.store.get_user(id).await {
            Ok(user) => return Ok(user),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        for _ in 0..CODE_ATTEMPTS {
            let user = User::new(id, username.clone(), random_code());
            match self.store.insert_user(user.clone()).await {
                Ok(()) => {
                    info!("Registered user {} with code {}", id, user.referral_code);
                    return Ok(user);
                }
                Err(StoreError::Conflict(_)) => {
                    // Lost a registration race for the same id
                    if let Ok(existing) = self.store.get_user(id).await {
                        return Ok(existing);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CoreError::InvalidState(format!(
            "no unique referral code for user {}",
            id
        )))
    }

    pub async fn get(&self, id: UserId) -> CoreResult<User> {
        Ok(self.store.get_user(id).await?)
    }

    pub async fn find_by_code(&self, code: &str) -> CoreResult<User> {
        self.store
            .user_by_referral_code(code.trim())
            .await
            .map_err(|e| match e {
                e if e.is_not_found() => {
                    CoreError::InvalidReferral(format!("unknown code {}", code))
                }
                e => e.into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpnbill_store::MemoryStore;

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let users = UserService::new(Arc::new(MemoryStore::new()));

        let first = users.register(7, Some("alice".into())).await.unwrap();
        let again = users.register(7, None).await.unwrap();

        assert_eq!(first.referral_code, again.referral_code);
        assert_eq!(again.username.as_deref(), Some("alice"));
        assert_eq!(first.referral_code.len(), REFERRAL_CODE_LEN);
        assert!(first.referral_code.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn test_find_by_code() {
        let users = UserService::new(Arc::new(MemoryStore::new()));
        let user = users.register(1, None).await.unwrap();

        assert_eq!(users.find_by_code(&user.referral_code).await.unwrap().id, 1);
        assert!(matches!(
            users.find_by_code("NOPE0000").await,
            Err(CoreError::InvalidReferral(_))
        ));
    }
}
