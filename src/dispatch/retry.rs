//! Upstream failure classification and backoff schedule.

use std::time::Duration;

use crate::config::BACKOFF_BASE_MS;
use crate::error::GatewayError;
use crate::pool::is_quota_error;

/// What a non-success response means for the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classified {
    /// 401/403: refresh the token once, then give up on this credential.
    AuthExpired,
    /// 429: back off and retry.
    RateLimited,
    /// 5xx: back off and retry.
    TransientServer,
    /// The one 400 shape that is retryable: a validation rejection the
    /// upstream raises spuriously under load, identified by its error-type
    /// marker.
    TransientValidation,
    /// Quota vocabulary in the body: quarantine the credential immediately.
    QuotaExhausted,
    /// Anything else: surface to the caller without retrying.
    Fatal,
}

impl Classified {
    pub fn is_backoff_retry(&self) -> bool {
        matches!(
            self,
            Classified::RateLimited | Classified::TransientServer | Classified::TransientValidation
        )
    }
}

/// Classifies a non-success response from status, error-type header, and a
/// body snippet. The quota check runs first regardless of status; quota
/// rejections have been observed under 400, 403, and 429 alike.
pub fn classify_response(status: u16, error_kind: Option<&str>, body: &str) -> Classified {
    if is_quota_error(body) {
        return Classified::QuotaExhausted;
    }
    match status {
        401 | 403 => Classified::AuthExpired,
        429 => Classified::RateLimited,
        500..=599 => Classified::TransientServer,
        400 if is_transient_validation(error_kind, body) => Classified::TransientValidation,
        _ => Classified::Fatal,
    }
}

/// The error-type marker travels in a header or in the body depending on the
/// upstream revision; either placement counts.
fn is_transient_validation(error_kind: Option<&str>, body: &str) -> bool {
    let marked =
        error_kind == Some("ValidationException") || body.contains("ValidationException");
    marked && body.contains("Improperly formed request")
}

/// Sanitized terminal error for a classification, used when retries are
/// exhausted or the classification is not retryable.
pub fn to_gateway_error(class: Classified, status: u16) -> GatewayError {
    match class {
        Classified::AuthExpired => GatewayError::AuthFailure { status },
        Classified::RateLimited => GatewayError::RateLimited { status },
        Classified::TransientServer => GatewayError::ServerError { status },
        Classified::TransientValidation | Classified::Fatal => GatewayError::BadRequest { status },
        Classified::QuotaExhausted => GatewayError::QuotaExhausted,
    }
}

/// Exponential backoff: attempt `n` (zero-based) sleeps `base * 2^n`.
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(10);
    Duration::from_millis(BACKOFF_BASE_MS.saturating_mul(factor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_classification_table() {
        assert_eq!(classify_response(401, None, ""), Classified::AuthExpired);
        assert_eq!(classify_response(403, None, ""), Classified::AuthExpired);
        assert_eq!(classify_response(429, None, ""), Classified::RateLimited);
        assert_eq!(classify_response(500, None, ""), Classified::TransientServer);
        assert_eq!(classify_response(503, None, ""), Classified::TransientServer);
        assert_eq!(classify_response(599, None, ""), Classified::TransientServer);
        assert_eq!(classify_response(400, None, "bad field"), Classified::Fatal);
        assert_eq!(classify_response(404, None, ""), Classified::Fatal);
        assert_eq!(classify_response(418, None, ""), Classified::Fatal);
    }

    #[test]
    fn test_transient_validation_needs_marker_and_body() {
        assert_eq!(
            classify_response(400, Some("ValidationException"), "Improperly formed request."),
            Classified::TransientValidation
        );
        assert_eq!(
            classify_response(400, Some("ValidationException"), "missing field x"),
            Classified::Fatal
        );
        assert_eq!(
            classify_response(400, None, "Improperly formed request."),
            Classified::Fatal
        );
        // Marker in the body instead of the header works too.
        assert_eq!(
            classify_response(
                400,
                None,
                r#"{"__type":"ValidationException","message":"Improperly formed request."}"#
            ),
            Classified::TransientValidation
        );
        // Marker on a non-400 status does not promote to retryable.
        assert_eq!(
            classify_response(404, Some("ValidationException"), "Improperly formed request."),
            Classified::Fatal
        );
    }

    #[test]
    fn test_quota_overrides_status() {
        assert_eq!(
            classify_response(403, None, "MONTHLY_REQUEST_COUNT limit exceeded"),
            Classified::QuotaExhausted
        );
        assert_eq!(
            classify_response(429, None, "free tier quota reached"),
            Classified::QuotaExhausted
        );
    }

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff_delay(0), Duration::from_millis(BACKOFF_BASE_MS));
        assert_eq!(backoff_delay(1), Duration::from_millis(BACKOFF_BASE_MS * 2));
        assert_eq!(backoff_delay(2), Duration::from_millis(BACKOFF_BASE_MS * 4));
        // Capped shift, no overflow for absurd attempt numbers.
        assert!(backoff_delay(63) >= backoff_delay(10));
    }

    #[test]
    fn test_gateway_error_mapping_keeps_status() {
        assert_eq!(
            to_gateway_error(Classified::AuthExpired, 403),
            GatewayError::AuthFailure { status: 403 }
        );
        assert_eq!(
            to_gateway_error(Classified::RateLimited, 429),
            GatewayError::RateLimited { status: 429 }
        );
        assert_eq!(
            to_gateway_error(Classified::QuotaExhausted, 403),
            GatewayError::QuotaExhausted
        );
    }

    proptest! {
        /// Every status classifies into exactly one bucket and never panics.
        #[test]
        fn prop_classification_total(status in 100u16..600, quota in any::<bool>()) {
            let body = if quota { "quota exceeded" } else { "detail" };
            let class = classify_response(status, None, body);
            if quota {
                prop_assert_eq!(class, Classified::QuotaExhausted);
            } else {
                prop_assert_ne!(class, Classified::QuotaExhausted);
            }
        }
    }
}
