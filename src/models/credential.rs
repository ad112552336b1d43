//! Credential records held by the pool and the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::auth::AuthMethod;
use crate::config::UNHEALTHY_ERROR_THRESHOLD;

/// Upstream usage quota attached to a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaInfo {
    pub limit: i64,
    pub used: i64,
}

impl QuotaInfo {
    pub fn remaining(&self) -> i64 {
        (self.limit - self.used).max(0)
    }
}

/// One upstream account identity.
///
/// Token fields are wiped on drop; bookkeeping fields are skipped.
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credential {
    #[zeroize(skip)]
    pub id: String,
    #[zeroize(skip)]
    pub name: String,
    pub access_token: String,
    pub refresh_token: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    #[zeroize(skip)]
    pub auth_method: AuthMethod,
    #[zeroize(skip)]
    pub region: String,
    /// Profile reference required by the idc auth method.
    #[zeroize(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[zeroize(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[zeroize(skip)]
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[zeroize(skip)]
    #[serde(default)]
    pub use_count: u64,
    #[zeroize(skip)]
    #[serde(default)]
    pub error_count: u32,
    #[zeroize(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[zeroize(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
    #[zeroize(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaInfo>,
}

fn default_enabled() -> bool {
    true
}

impl Credential {
    /// Selectable by the pool: enabled and under the failure threshold.
    pub fn is_healthy(&self) -> bool {
        self.enabled && self.error_count < UNHEALTHY_ERROR_THRESHOLD
    }

    /// Whether the access token is expired or inside the refresh window.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => (at - now).num_seconds() <= crate::config::TOKEN_REFRESH_THRESHOLD,
            None => false,
        }
    }
}

/// A quarantined credential plus the failure that moved it out of rotation.
///
/// Moving an id that is already quarantined does not create a second record,
/// it bumps `duplicate_count` on the existing one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialErrorRecord {
    pub credential: Credential,
    pub reason: String,
    pub moved_at: DateTime<Utc>,
    #[serde(default)]
    pub duplicate_count: u32,
}
