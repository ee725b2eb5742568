//! Error taxonomy of the gateway.
//!
//! [`GatewayError`] is what callers of the gateway see. [`ProviderFailure`] never
//! reaches them: the orchestrator absorbs it with one local substitution.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("empty message")]
    EmptyMessage,

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("thread {0} not found")]
    ThreadNotFound(i64),

    #[error("thread {0} is the last remaining thread and cannot be deleted")]
    LastThread(i64),

    #[error("thread title cannot be empty")]
    EmptyTitle,

    /** \brief The caller stopped listening before the reply was complete. */
    #[error("caller disconnected")]
    Cancelled,

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl GatewayError {
    /** \brief True for the errors the caller caused and can fix. */
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            GatewayError::EmptyMessage
                | GatewayError::UnknownProvider(_)
                | GatewayError::ThreadNotFound(_)
                | GatewayError::LastThread(_)
                | GatewayError::EmptyTitle
        )
    }
}

/**
 * \brief Why a remote provider could not answer.
 */
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderFailure {
    #[error("missing credential {0}")]
    MissingCredential(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("request timed out")]
    Timeout,

    #[error("connection error: {0}")]
    Transport(String),

    #[error("empty reply")]
    EmptyReply,
}

impl ProviderFailure {
    /** \brief Status used in readiness reports. */
    pub fn status(&self) -> u16 {
        match self {
            ProviderFailure::Http { status, .. } => *status,
            ProviderFailure::Timeout => 504,
            ProviderFailure::Transport(_) => 502,
            ProviderFailure::MissingCredential(_) | ProviderFailure::EmptyReply => 503,
        }
    }
}

impl From<reqwest::Error> for ProviderFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderFailure::Timeout
        } else {
            ProviderFailure::Transport(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_failure_display() {
        let err = ProviderFailure::Http {
            status: 401,
            body: "invalid api key".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 401: invalid api key");
        assert_eq!(err.status(), 401);
    }

    #[test]
    fn test_storage_error_wraps_anyhow() {
        let err: GatewayError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, GatewayError::Storage(_)));
        assert!(!err.is_client_error());
        assert_eq!(err.to_string(), "storage error: disk full");
    }

    #[test]
    fn test_client_errors() {
        assert!(GatewayError::EmptyMessage.is_client_error());
        assert!(GatewayError::ThreadNotFound(3).is_client_error());
        assert!(!GatewayError::Cancelled.is_client_error());
    }
}
