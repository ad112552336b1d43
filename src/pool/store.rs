//! Credential persistence seam.
//!
//! The gateway core never talks to a database; it goes through
//! [`CredentialStore`]. [`MemoryStore`] is the default implementation and the
//! one tests use.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tracing::info;

use crate::auth::TokenUpdate;
use crate::models::{Credential, CredentialErrorRecord};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("credential {0} not found")]
    NotFound(String),
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn list(&self) -> Vec<Credential>;

    async fn get(&self, id: &str) -> Option<Credential>;

    async fn upsert(&self, cred: Credential);

    async fn delete(&self, id: &str) -> bool;

    /// Moves an active credential into the quarantine area, recording the
    /// failure reason. Quarantining an id a second time bumps the duplicate
    /// counter on the existing record instead of stacking records.
    async fn move_to_error(&self, id: &str, reason: &str) -> Result<(), StoreError>;

    /// Returns a quarantined credential to the active set with counters
    /// cleared, optionally replacing its tokens.
    async fn restore(
        &self,
        id: &str,
        tokens: Option<TokenUpdate>,
    ) -> Result<Credential, StoreError>;

    async fn list_errors(&self) -> Vec<CredentialErrorRecord>;
}

/// DashMap-backed store. Active credentials and quarantined records live in
/// separate maps keyed by credential id.
#[derive(Default)]
pub struct MemoryStore {
    active: DashMap<String, Credential>,
    errors: DashMap<String, CredentialErrorRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn list(&self) -> Vec<Credential> {
        self.active.iter().map(|e| e.value().clone()).collect()
    }

    async fn get(&self, id: &str) -> Option<Credential> {
        self.active.get(id).map(|e| e.value().clone())
    }

    async fn upsert(&self, cred: Credential) {
        self.active.insert(cred.id.clone(), cred);
    }

    async fn delete(&self, id: &str) -> bool {
        self.active.remove(id).is_some()
    }

    async fn move_to_error(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        let (_, mut cred) = self
            .active
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        cred.last_error = Some(reason.to_string());
        cred.last_error_at = Some(Utc::now());

        if let Some(mut existing) = self.errors.get_mut(id) {
            existing.duplicate_count += 1;
            existing.reason = reason.to_string();
            existing.moved_at = Utc::now();
            existing.credential = cred;
            info!(credential = %id, count = existing.duplicate_count, "re-quarantined credential");
            return Ok(());
        }

        info!(credential = %id, reason = %reason, "quarantined credential");
        self.errors.insert(
            id.to_string(),
            CredentialErrorRecord {
                credential: cred,
                reason: reason.to_string(),
                moved_at: Utc::now(),
                duplicate_count: 0,
            },
        );
        Ok(())
    }

    async fn restore(
        &self,
        id: &str,
        tokens: Option<TokenUpdate>,
    ) -> Result<Credential, StoreError> {
        let (_, record) = self
            .errors
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut cred = record.credential;
        cred.error_count = 0;
        cred.last_error = None;
        cred.last_error_at = None;
        cred.enabled = true;
        if let Some(update) = tokens {
            cred.access_token = update.access_token;
            if let Some(rt) = update.refresh_token {
                cred.refresh_token = rt;
            }
            cred.expires_at = Some(update.expires_at);
        }
        info!(credential = %id, "restored credential from quarantine");
        self.active.insert(id.to_string(), cred.clone());
        Ok(cred)
    }

    async fn list_errors(&self) -> Vec<CredentialErrorRecord> {
        self.errors.iter().map(|e| e.value().clone()).collect()
    }
}


#[cfg(test)]
mod tests {
    use super::tests_support::sample_credential;
    use super::*;

    #[tokio::test]
    async fn test_crud_roundtrip() {
        let store = MemoryStore::new();
        store.upsert(sample_credential("a")).await;
        store.upsert(sample_credential("b")).await;
        assert_eq!(store.list().await.len(), 2);
        assert_eq!(store.get("a").await.unwrap().id, "a");
        assert!(store.delete("a").await);
        assert!(!store.delete("a").await);
        assert!(store.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_move_to_error_removes_from_active() {
        let store = MemoryStore::new();
        store.upsert(sample_credential("a")).await;
        store.move_to_error("a", "HTTP 403 after refresh").await.unwrap();
        assert!(store.get("a").await.is_none());
        let errors = store.list_errors().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].reason, "HTTP 403 after refresh");
        assert_eq!(errors[0].duplicate_count, 0);
    }

    #[tokio::test]
    async fn test_duplicate_quarantine_bumps_counter() {
        let store = MemoryStore::new();
        store.upsert(sample_credential("a")).await;
        store.move_to_error("a", "first").await.unwrap();
        store.upsert(sample_credential("a")).await;
        store.move_to_error("a", "second").await.unwrap();
        let errors = store.list_errors().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].duplicate_count, 1);
        assert_eq!(errors[0].reason, "second");
    }

    #[tokio::test]
    async fn test_restore_clears_counters_and_applies_tokens() {
        let store = MemoryStore::new();
        let mut cred = sample_credential("a");
        cred.error_count = 3;
        store.upsert(cred).await;
        store.move_to_error("a", "quota").await.unwrap();

        let update = TokenUpdate {
            access_token: "new-access".into(),
            refresh_token: Some("new-refresh".into()),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        };
        let restored = store.restore("a", Some(update)).await.unwrap();
        assert_eq!(restored.error_count, 0);
        assert!(restored.last_error.is_none());
        assert_eq!(restored.access_token, "new-access");
        assert_eq!(restored.refresh_token, "new-refresh");
        assert!(store.get("a").await.is_some());
        assert!(store.list_errors().await.is_empty());
    }

    #[tokio::test]
    async fn test_restore_missing_is_not_found() {
        let store = MemoryStore::new();
        assert_eq!(
            store.restore("ghost", None).await.unwrap_err(),
            StoreError::NotFound("ghost".into())
        );
    }
}
