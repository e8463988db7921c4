//! Unified error surface.
//!
//! Subsystems raise their own typed errors; everything that can cross the
//! HTTP boundary converges here so status mapping lives in one place and no
//! internal detail (paths, provider secrets, stack traces) leaks outward.

use thiserror::Error;

use crate::model::Verdict;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing or invalid API key")]
    Auth,

    #[error("expired API key")]
    KeyExpired,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("request blocked by admission layer {layer}: {reason}")]
    Admission { layer: String, reason: String },

    #[error("rate limited; retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("translation failed: {0}")]
    Translation(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("request deadline exceeded")]
    Deadline,

    #[error("too many requests in flight")]
    Overloaded,

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("engine failure: {0}")]
    Engine(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Auth | GatewayError::KeyExpired => 401,
            GatewayError::Forbidden(_) => 403,
            GatewayError::Admission { .. } | GatewayError::Validation(_) => 400,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::Deadline => 504,
            GatewayError::Overloaded => 503,
            GatewayError::Translation(_) => 200,
            GatewayError::Storage(_) | GatewayError::Engine(_) | GatewayError::Internal(_) => 500,
        }
    }

    /// Verdict recorded in the audit trail for this failure class.
    pub fn verdict(&self) -> Verdict {
        match self {
            GatewayError::Admission { .. } => Verdict::Blocked,
            GatewayError::Translation(_) => Verdict::Failed,
            GatewayError::Deadline => Verdict::Error,
            _ => Verdict::Error,
        }
    }

    /// Message safe to show a caller. Internal variants are collapsed.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Storage(_) | GatewayError::Internal(_) | GatewayError::Engine(_) => {
                "internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(err: rusqlite::Error) -> Self {
        GatewayError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Validation(format!("invalid JSON: {err}"))
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(GatewayError::Auth.http_status(), 401);
        assert_eq!(
            GatewayError::Forbidden("role".into()).http_status(),
            403
        );
        assert_eq!(
            GatewayError::RateLimited {
                retry_after_secs: 12
            }
            .http_status(),
            429
        );
        assert_eq!(GatewayError::Deadline.http_status(), 504);
        // A failed translation is still a successful HTTP exchange.
        assert_eq!(
            GatewayError::Translation("bad JSON".into()).http_status(),
            200
        );
    }

    #[test]
    fn internal_detail_is_not_public() {
        let err = GatewayError::Storage("/var/lib/qwed.db is corrupt".into());
        assert_eq!(err.public_message(), "internal error");
    }
}
