//! Token refresh engine.
//!
//! One refresh per credential runs at a time. Concurrent callers queue on a
//! per-credential async mutex; whoever acquires it second finds the fresh
//! result already cached and skips the network call.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{info, warn};

use crate::auth::types::{
    AuthError, AuthMethod, OidcRefreshResponse, SocialRefreshResponse, TokenUpdate,
};
use crate::config;
use crate::models::Credential;

/// Invoked after every successful refresh so the caller can persist the new
/// tokens wherever credentials live.
pub type PersistFn = dyn Fn(&str, &TokenUpdate) + Send + Sync;

/// A finished refresh, kept so waiters queued behind it can reuse the result.
#[derive(Debug, Clone)]
struct CompletedRefresh {
    update: TokenUpdate,
    completed_at: DateTime<Utc>,
}

pub struct TokenRefresher {
    http: reqwest::Client,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    recent: DashMap<String, CompletedRefresh>,
    on_persist: Option<Arc<PersistFn>>,
    social_endpoint: Option<String>,
}

impl TokenRefresher {
    pub fn new(http: reqwest::Client) -> Self {
        TokenRefresher {
            http,
            locks: DashMap::new(),
            recent: DashMap::new(),
            on_persist: None,
            social_endpoint: None,
        }
    }

    pub fn with_persistence(mut self, f: Arc<PersistFn>) -> Self {
        self.on_persist = Some(f);
        self
    }

    /// Overrides the region-derived social refresh endpoint, for deployments
    /// that front the auth service.
    pub fn with_social_endpoint(mut self, url: impl Into<String>) -> Self {
        self.social_endpoint = Some(url.into());
        self
    }

    /// Refreshes the credential's tokens, single-flight per credential id.
    ///
    /// A waiter that acquires the lock after another caller already refreshed
    /// reuses that result instead of issuing a second request.
    pub async fn refresh(&self, cred: &Credential) -> Result<TokenUpdate, AuthError> {
        if cred.refresh_token.is_empty() {
            return Err(AuthError::MissingRefreshToken);
        }

        let arrived = Utc::now();
        let lock = self
            .locks
            .entry(cred.id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(update) = self.reusable_update(&cred.id, arrived) {
            info!(credential = %cred.id, "reusing refresh result from concurrent caller");
            return Ok(update);
        }

        info!(credential = %cred.id, method = %cred.auth_method, "refreshing token");
        let update = match cred.auth_method {
            AuthMethod::Social => self.refresh_social(cred).await?,
            AuthMethod::BuilderId | AuthMethod::Idc => self.refresh_oidc(cred).await?,
        };
        info!(
            credential = %cred.id,
            expires_at = %update.expires_at,
            "token refresh succeeded"
        );

        self.recent.insert(
            cred.id.clone(),
            CompletedRefresh {
                update: update.clone(),
                completed_at: Utc::now(),
            },
        );
        if let Some(cb) = &self.on_persist {
            cb(&cred.id, &update);
        }
        Ok(update)
    }

    /// Reusable only when the refresh finished after this caller arrived,
    /// meaning the caller was queued behind it. Anything older is the token
    /// the caller already holds; a rejection of that token needs a real
    /// refresh, not the cache. The entry must also still sit outside the
    /// expiry window.
    fn reusable_update(&self, id: &str, arrived: DateTime<Utc>) -> Option<TokenUpdate> {
        let entry = self.recent.get(id)?;
        if entry.completed_at <= arrived {
            return None;
        }
        let margin = (entry.update.expires_at - Utc::now()).num_seconds();
        if margin > config::TOKEN_REFRESH_THRESHOLD {
            Some(entry.update.clone())
        } else {
            None
        }
    }

    async fn refresh_social(&self, cred: &Credential) -> Result<TokenUpdate, AuthError> {
        let url = self
            .social_endpoint
            .clone()
            .unwrap_or_else(|| config::social_refresh_url(&cred.region));
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "refreshToken": cred.refresh_token }))
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(credential = %cred.id, status, body = %body, "social refresh rejected");
            return Err(AuthError::RefreshRejected { status });
        }

        let parsed: SocialRefreshResponse = resp.json().await?;
        let access_token = parsed.access_token.ok_or(AuthError::MissingAccessToken)?;
        let expires_at = resolve_expiry(parsed.expires_at.as_deref(), parsed.expires_in)?;
        Ok(TokenUpdate {
            access_token,
            refresh_token: parsed.refresh_token,
            expires_at,
        })
    }

    async fn refresh_oidc(&self, cred: &Credential) -> Result<TokenUpdate, AuthError> {
        let (client_id, client_secret) = match (&cred.client_id, &cred.client_secret) {
            (Some(id), Some(secret)) => (id, secret),
            _ => return Err(AuthError::MissingClientRegistration),
        };

        let url = config::oidc_token_url(&cred.region);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "refreshToken": cred.refresh_token,
                "clientId": client_id,
                "clientSecret": client_secret,
                "grantType": "refresh_token",
            }))
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(credential = %cred.id, status, body = %body, "OIDC refresh rejected");
            return Err(AuthError::RefreshRejected { status });
        }

        let parsed: OidcRefreshResponse = resp.json().await?;
        let access_token = parsed.access_token.ok_or(AuthError::MissingAccessToken)?;
        let expires_at = resolve_expiry(parsed.expires_at.as_deref(), parsed.expires_in)?;
        Ok(TokenUpdate {
            access_token,
            refresh_token: parsed.refresh_token,
            expires_at,
        })
    }
}

/// Absolute expiry wins; a relative lifetime is anchored at now; neither
/// falls back to the default lifetime.
fn resolve_expiry(
    absolute: Option<&str>,
    relative_secs: Option<i64>,
) -> Result<DateTime<Utc>, AuthError> {
    if let Some(ts) = absolute {
        return DateTime::parse_from_rfc3339(ts)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| AuthError::BadExpiry(ts.to_string()));
    }
    let secs = relative_secs.unwrap_or(config::DEFAULT_TOKEN_LIFETIME_SECS);
    Ok(Utc::now() + Duration::seconds(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_expiry_prefers_absolute() {
        let at = resolve_expiry(Some("2030-06-01T12:00:00Z"), Some(60)).unwrap();
        assert_eq!(at.to_rfc3339(), "2030-06-01T12:00:00+00:00");
    }

    #[test]
    fn test_resolve_expiry_relative_anchored_at_now() {
        let before = Utc::now();
        let at = resolve_expiry(None, Some(900)).unwrap();
        let offset = (at - before).num_seconds();
        assert!((899..=901).contains(&offset), "offset was {offset}");
    }

    #[test]
    fn test_resolve_expiry_default_lifetime() {
        let before = Utc::now();
        let at = resolve_expiry(None, None).unwrap();
        let offset = (at - before).num_seconds();
        let want = config::DEFAULT_TOKEN_LIFETIME_SECS;
        assert!((want - 1..=want + 1).contains(&offset));
    }

    #[test]
    fn test_resolve_expiry_rejects_garbage() {
        assert!(matches!(
            resolve_expiry(Some("not a timestamp"), None),
            Err(AuthError::BadExpiry(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_requires_refresh_token() {
        let refresher = TokenRefresher::new(reqwest::Client::new());
        let mut cred = crate::pool::store::tests_support::sample_credential("c1");
        cred.refresh_token = String::new();
        assert!(matches!(
            refresher.refresh(&cred).await,
            Err(AuthError::MissingRefreshToken)
        ));
    }

    #[tokio::test]
    async fn test_oidc_requires_client_registration() {
        let refresher = TokenRefresher::new(reqwest::Client::new());
        let mut cred = crate::pool::store::tests_support::sample_credential("c2");
        cred.auth_method = AuthMethod::BuilderId;
        cred.client_id = None;
        cred.client_secret = None;
        assert!(matches!(
            refresher.refresh(&cred).await,
            Err(AuthError::MissingClientRegistration)
        ));
    }

    #[test]
    fn test_refresh_result_reused_only_by_queued_waiters() {
        let refresher = TokenRefresher::new(reqwest::Client::new());
        let update = TokenUpdate {
            access_token: "fresh".into(),
            refresh_token: None,
            expires_at: Utc::now() + Duration::hours(8),
        };
        refresher.recent.insert(
            "c3".into(),
            CompletedRefresh {
                update,
                completed_at: Utc::now(),
            },
        );
        // A caller queued before the refresh finished reuses the result.
        let queued = Utc::now() - Duration::seconds(1);
        assert!(refresher.reusable_update("c3", queued).is_some());
        // A caller arriving afterwards holds the token that refresh minted;
        // if it is asking again, that token just got rejected.
        let late = Utc::now() + Duration::seconds(1);
        assert!(refresher.reusable_update("c3", late).is_none());
    }

    #[test]
    fn test_refresh_result_inside_expiry_window_not_reused() {
        let refresher = TokenRefresher::new(reqwest::Client::new());
        let update = TokenUpdate {
            access_token: "short-lived".into(),
            refresh_token: None,
            expires_at: Utc::now() + Duration::seconds(60),
        };
        refresher.recent.insert(
            "c3".into(),
            CompletedRefresh {
                update,
                completed_at: Utc::now() + Duration::seconds(1),
            },
        );
        assert!(refresher.reusable_update("c3", Utc::now()).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_collapse_to_one_call() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let server_hits = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                server_hits.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let body = r#"{"accessToken":"tok-1","refreshToken":"rt-1","expiresAt":"2030-01-01T00:00:00Z"}"#;
                let resp = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = sock.write_all(resp.as_bytes()).await;
            }
        });

        let refresher = Arc::new(
            TokenRefresher::new(reqwest::Client::new())
                .with_social_endpoint(format!("http://{addr}/refreshToken")),
        );
        let cred = crate::pool::store::tests_support::sample_credential("c4");

        // Hold the per-credential lock so both callers are queued before
        // either refresh can run.
        let gate = refresher
            .locks
            .entry(cred.id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let held = gate.lock().await;
        let a = {
            let refresher = refresher.clone();
            let cred = cred.clone();
            tokio::spawn(async move { refresher.refresh(&cred).await })
        };
        let b = {
            let refresher = refresher.clone();
            let cred = cred.clone();
            tokio::spawn(async move { refresher.refresh(&cred).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        drop(held);

        let first = a.await.unwrap().unwrap();
        let second = b.await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.access_token, "tok-1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
