//! Endpoint builders and shared constants.
//!
//! All upstream endpoints are region-scoped; callers pass the credential's
//! region instead of reading global state.

use once_cell::sync::Lazy;

/// Time before token expiration when refresh is needed (in seconds).
/// Refresh in advance so an in-flight request never carries a token that
/// expires mid-call.
pub const TOKEN_REFRESH_THRESHOLD: i64 = 600;

/// Consecutive failures after which a credential stops being selectable.
pub const UNHEALTHY_ERROR_THRESHOLD: u32 = 3;

/// Maximum HTTP attempts against a single credential (backoff retries).
pub const MAX_HTTP_ATTEMPTS: u32 = 3;

/// Maximum distinct credentials tried before the request fails over.
pub const MAX_CREDENTIAL_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (milliseconds). Attempt `n` sleeps
/// `BACKOFF_BASE_MS * 2^n`.
pub const BACKOFF_BASE_MS: u64 = 500;

/// Wall-clock ceiling for a single backend call, streaming included.
pub const CALL_TIMEOUT_SECS: u64 = 300;

/// Fallback token lifetime when a refresh response carries no expiry.
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Returns the social-login token refresh URL for the given region.
///
/// Example: `social_refresh_url("us-east-1")` →
/// `"https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken"`
pub fn social_refresh_url(region: &str) -> String {
    format!("https://prod.{}.auth.desktop.kiro.dev/refreshToken", region)
}

/// Returns the OIDC token endpoint for the given region, used by the
/// builder-id and idc auth methods.
///
/// Example: `oidc_token_url("us-east-1")` →
/// `"https://oidc.us-east-1.amazonaws.com/token"`
pub fn oidc_token_url(region: &str) -> String {
    format!("https://oidc.{}.amazonaws.com/token", region)
}

/// Returns the conversation backend host for the given region.
///
/// Example: `conversation_api_host("us-east-1")` →
/// `"https://codewhisperer.us-east-1.amazonaws.com"`
pub fn conversation_api_host(region: &str) -> String {
    format!("https://codewhisperer.{}.amazonaws.com", region)
}

/// Returns the binary-protocol backend host for the given region.
///
/// Example: `binary_api_host("us-east-1")` →
/// `"https://q.us-east-1.amazonaws.com"`
pub fn binary_api_host(region: &str) -> String {
    format!("https://q.{}.amazonaws.com", region)
}

/// A stable machine fingerprint sent in backend headers.
///
/// Hashes hostname and user identity with SHA-256; hardware access is not
/// needed, the value only has to be stable per host.
pub fn machine_fingerprint() -> &'static str {
    static FINGERPRINT: Lazy<String> = Lazy::new(|| {
        use sha2::{Digest, Sha256};

        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "unknown-host".to_string());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown-user".to_string());

        let mut hasher = Sha256::new();
        hasher.update(host.as_bytes());
        hasher.update(b"/");
        hasher.update(user.as_bytes());
        hasher.update(b"/");
        hasher.update(std::env::consts::OS.as_bytes());
        format!("{:x}", hasher.finalize())
    });
    &FINGERPRINT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_social_refresh_url() {
        assert_eq!(
            social_refresh_url("us-east-1"),
            "https://prod.us-east-1.auth.desktop.kiro.dev/refreshToken"
        );
        assert_eq!(
            social_refresh_url("eu-central-1"),
            "https://prod.eu-central-1.auth.desktop.kiro.dev/refreshToken"
        );
    }

    #[test]
    fn test_oidc_token_url() {
        assert_eq!(
            oidc_token_url("us-east-1"),
            "https://oidc.us-east-1.amazonaws.com/token"
        );
        assert_eq!(
            oidc_token_url("ap-southeast-1"),
            "https://oidc.ap-southeast-1.amazonaws.com/token"
        );
    }

    #[test]
    fn test_api_hosts() {
        assert_eq!(
            conversation_api_host("us-east-1"),
            "https://codewhisperer.us-east-1.amazonaws.com"
        );
        assert_eq!(binary_api_host("us-east-1"), "https://q.us-east-1.amazonaws.com");
    }

    #[test]
    fn test_machine_fingerprint_is_stable() {
        let fp1 = machine_fingerprint();
        let fp2 = machine_fingerprint();
        assert_eq!(fp1, fp2);
        // SHA-256 hex is 64 chars
        assert_eq!(fp1.len(), 64);
    }

    #[test]
    fn test_thresholds() {
        assert_eq!(UNHEALTHY_ERROR_THRESHOLD, 3);
        assert!(BACKOFF_BASE_MS > 0);
    }
}
