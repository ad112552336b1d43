//! Credential pool: selection, health counters, quarantine signaling.
//!
//! The pool is the in-memory view used on the hot path. Durable state
//! transitions (quarantine, restore) go through the [`store::CredentialStore`]
//! seam; the pool only decides and counts.

pub mod store;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::auth::TokenUpdate;
use crate::config::UNHEALTHY_ERROR_THRESHOLD;
use crate::models::Credential;

pub use store::{CredentialStore, MemoryStore, StoreError};

/// Error texts that exhaust a credential for the billing period. Any failure
/// matching one of these jumps straight to the unhealthy threshold instead of
/// burning three attempts discovering the same thing.
const QUOTA_MARKERS: &[&str] = &[
    "quota",
    "monthly_request_count",
    "monthly request count",
    "daily_request_count",
    "limit exceeded",
    "insufficient credit",
];

pub fn is_quota_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    QUOTA_MARKERS.iter().any(|m| lower.contains(m))
}

struct PoolEntry {
    cred: Credential,
    use_count: AtomicU64,
    error_count: AtomicU32,
    last_error: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl PoolEntry {
    fn new(cred: Credential) -> Self {
        let use_count = AtomicU64::new(cred.use_count);
        let error_count = AtomicU32::new(cred.error_count);
        let last_error = Mutex::new(
            cred.last_error
                .clone()
                .map(|e| (e, cred.last_error_at.unwrap_or_else(Utc::now))),
        );
        PoolEntry {
            cred,
            use_count,
            error_count,
            last_error,
        }
    }

    fn is_healthy(&self) -> bool {
        self.cred.enabled && self.error_count.load(Ordering::Relaxed) < UNHEALTHY_ERROR_THRESHOLD
    }

    /// The credential with live counter values folded back in.
    fn snapshot(&self) -> Credential {
        let mut cred = self.cred.clone();
        cred.use_count = self.use_count.load(Ordering::Relaxed);
        cred.error_count = self.error_count.load(Ordering::Relaxed);
        if let Ok(guard) = self.last_error.lock() {
            match guard.as_ref() {
                Some((msg, at)) => {
                    cred.last_error = Some(msg.clone());
                    cred.last_error_at = Some(*at);
                }
                None => {
                    cred.last_error = None;
                    cred.last_error_at = None;
                }
            }
        }
        cred
    }
}

#[derive(Default)]
pub struct CredentialPool {
    entries: DashMap<String, PoolEntry>,
}

impl CredentialPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(creds: impl IntoIterator<Item = Credential>) -> Self {
        let pool = Self::new();
        for cred in creds {
            pool.insert(cred);
        }
        pool
    }

    pub fn insert(&self, cred: Credential) {
        self.entries.insert(cred.id.clone(), PoolEntry::new(cred));
    }

    pub fn remove(&self, id: &str) -> Option<Credential> {
        self.entries.remove(id).map(|(_, e)| e.snapshot())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Credential> {
        self.entries.get(id).map(|e| e.snapshot())
    }

    pub fn snapshot_all(&self) -> Vec<Credential> {
        self.entries.iter().map(|e| e.snapshot()).collect()
    }

    /// Picks the healthy, non-excluded credential with the lowest use count.
    /// Ties break on id so selection is deterministic under equal load.
    pub fn select(&self, exclude: &HashSet<String>) -> Option<Credential> {
        let mut best: Option<(u64, String)> = None;
        for entry in self.entries.iter() {
            if exclude.contains(entry.key()) || !entry.is_healthy() {
                continue;
            }
            let uses = entry.use_count.load(Ordering::Relaxed);
            let better = match &best {
                None => true,
                Some((best_uses, best_id)) => {
                    uses < *best_uses || (uses == *best_uses && entry.key() < best_id)
                }
            };
            if better {
                best = Some((uses, entry.key().clone()));
            }
        }
        let (_, id) = best?;
        debug!(credential = %id, "selected credential");
        self.entries.get(&id).map(|e| e.snapshot())
    }

    pub fn record_success(&self, id: &str) {
        if let Some(entry) = self.entries.get(id) {
            entry.use_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a failure and returns the new error count. Quota failures jump
    /// straight to the unhealthy threshold.
    pub fn record_failure(&self, id: &str, error_text: &str) -> u32 {
        let Some(entry) = self.entries.get(id) else {
            return 0;
        };
        let count = if is_quota_error(error_text) {
            entry
                .error_count
                .store(UNHEALTHY_ERROR_THRESHOLD, Ordering::Relaxed);
            UNHEALTHY_ERROR_THRESHOLD
        } else {
            entry.error_count.fetch_add(1, Ordering::Relaxed) + 1
        };
        if let Ok(mut guard) = entry.last_error.lock() {
            *guard = Some((error_text.to_string(), Utc::now()));
        }
        if count >= UNHEALTHY_ERROR_THRESHOLD {
            warn!(credential = %id, count, error = %error_text, "credential unhealthy");
        }
        count
    }

    /// Applies refreshed tokens and clears failure state.
    pub fn record_refreshed(&self, id: &str, update: &TokenUpdate) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.cred.access_token = update.access_token.clone();
            if let Some(rt) = &update.refresh_token {
                entry.cred.refresh_token = rt.clone();
            }
            entry.cred.expires_at = Some(update.expires_at);
            entry.error_count.store(0, Ordering::Relaxed);
            if let Ok(mut guard) = entry.last_error.lock() {
                *guard = None;
            }
        }
    }

    /// Ids that are enabled and under the failure threshold.
    pub fn healthy_ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.is_healthy())
            .map(|e| e.key().clone())
            .collect()
    }
}
