//! Auth method tags and refresh wire shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a credential authenticates and therefore how it refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    /// Social login; refreshes against the desktop-auth endpoint.
    Social,
    /// Builder ID; refreshes via the OIDC refresh-token grant.
    BuilderId,
    /// Identity Center; OIDC grant plus a profile reference on requests.
    Idc,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Social => "social",
            AuthMethod::BuilderId => "builder-id",
            AuthMethod::Idc => "idc",
        }
    }

    pub fn uses_oidc(&self) -> bool {
        matches!(self, AuthMethod::BuilderId | AuthMethod::Idc)
    }
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Social refresh response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialRefreshResponse {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Absolute expiry, RFC 3339.
    pub expires_at: Option<String>,
    /// Relative lifetime in seconds, used when no absolute expiry is sent.
    pub expires_in: Option<i64>,
}

/// OIDC refresh response. The endpoint has been observed emitting both
/// camelCase and snake_case field names, so every field aliases both.
#[derive(Debug, Clone, Deserialize)]
pub struct OidcRefreshResponse {
    #[serde(alias = "accessToken", alias = "access_token")]
    pub access_token: Option<String>,
    #[serde(alias = "refreshToken", alias = "refresh_token")]
    pub refresh_token: Option<String>,
    #[serde(alias = "expiresIn", alias = "expires_in")]
    pub expires_in: Option<i64>,
    #[serde(alias = "expiresAt", alias = "expires_at")]
    pub expires_at: Option<String>,
}

/// The outcome of a successful refresh, applied to the credential and handed
/// to the persistence callback.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenUpdate {
    pub access_token: String,
    /// Some endpoints rotate the refresh token; `None` keeps the old one.
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credential has no refresh token")]
    MissingRefreshToken,

    #[error("OIDC refresh requires clientId and clientSecret")]
    MissingClientRegistration,

    #[error("refresh response carried no access token")]
    MissingAccessToken,

    #[error("refresh endpoint returned status {status}")]
    RefreshRejected { status: u16 },

    #[error("network error during refresh: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unparseable expiry timestamp: {0}")]
    BadExpiry(String),
}
