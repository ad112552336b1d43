//! Sanitized error taxonomy.
//!
//! Upstream response bodies routinely contain account identifiers, ARNs and
//! internal request ids. Those details are logged at the classification site
//! and never placed in a `GatewayError`; callers only see the fixed messages
//! below plus the numeric status.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("Authentication failed and the credential could not be refreshed")]
    AuthFailure { status: u16 },

    #[error("Rate limited by the upstream service, retry later")]
    RateLimited { status: u16 },

    #[error("Upstream service error, retry later")]
    ServerError { status: u16 },

    #[error("The upstream service rejected the request")]
    BadRequest { status: u16 },

    #[error("Credential quota exhausted")]
    QuotaExhausted,

    #[error("Request timed out")]
    Timeout,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Network error while contacting the upstream service")]
    Network,

    #[error("No credential available for this request")]
    NoCredentialAvailable,

    #[error("The response stream ended before any output was produced")]
    EmptyResponse,
}

impl GatewayError {
    /// The upstream HTTP status this error carries, where one exists.
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::AuthFailure { status }
            | GatewayError::RateLimited { status }
            | GatewayError::ServerError { status }
            | GatewayError::BadRequest { status } => Some(*status),
            _ => None,
        }
    }

    /// Whether trying another credential could succeed.
    pub fn is_failover_candidate(&self) -> bool {
        !matches!(
            self,
            GatewayError::BadRequest { .. } | GatewayError::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_carried_for_http_errors() {
        assert_eq!(GatewayError::AuthFailure { status: 403 }.status(), Some(403));
        assert_eq!(GatewayError::RateLimited { status: 429 }.status(), Some(429));
        assert_eq!(GatewayError::ServerError { status: 503 }.status(), Some(503));
        assert_eq!(GatewayError::Timeout.status(), None);
        assert_eq!(GatewayError::QuotaExhausted.status(), None);
    }

    #[test]
    fn test_bad_request_stops_failover() {
        assert!(!GatewayError::BadRequest { status: 400 }.is_failover_candidate());
        assert!(GatewayError::ServerError { status: 500 }.is_failover_candidate());
        assert!(GatewayError::QuotaExhausted.is_failover_candidate());
    }

    #[test]
    fn test_messages_are_sanitized() {
        // No error message may echo upstream detail. These are the full
        // fixed strings callers can observe.
        let msgs = [
            GatewayError::AuthFailure { status: 401 }.to_string(),
            GatewayError::RateLimited { status: 429 }.to_string(),
            GatewayError::ServerError { status: 500 }.to_string(),
            GatewayError::BadRequest { status: 400 }.to_string(),
            GatewayError::QuotaExhausted.to_string(),
            GatewayError::Timeout.to_string(),
        ];
        for m in msgs {
            assert!(!m.contains("arn:"));
            assert!(!m.contains("request id"));
        }
    }
}
