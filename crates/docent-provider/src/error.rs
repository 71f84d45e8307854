use thiserror::Error;

/// Failure talking to a language-model backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{backend} api error ({status}): {message}")]
    Api {
        backend: String,
        status: u16,
        message: String,
    },
    #[error("{backend} request timed out")]
    Timeout { backend: String },
    #[error("{backend} connection failed: {message}")]
    Connect { backend: String, message: String },
    #[error("{backend} transport error: {message}")]
    Transport { backend: String, message: String },
    #[error("{backend} returned an invalid response: {message}")]
    InvalidResponse { backend: String, message: String },
    #[error("{backend} does not support {capability}")]
    Unsupported {
        backend: String,
        capability: &'static str,
    },
    #[error("backend configuration error: {0}")]
    Config(String),
}

impl BackendError {
    pub(crate) fn from_reqwest(backend: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                backend: backend.to_string(),
            }
        } else if err.is_connect() {
            Self::Connect {
                backend: backend.to_string(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            Self::InvalidResponse {
                backend: backend.to_string(),
                message: err.to_string(),
            }
        } else {
            Self::Transport {
                backend: backend.to_string(),
                message: err.to_string(),
            }
        }
    }

    /// Rate limits, server errors, timeouts and refused connections are worth
    /// another attempt; everything else fails the same way twice.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status == 429 || (500..=599).contains(status),
            Self::Timeout { .. } | Self::Connect { .. } => true,
            Self::Transport { .. }
            | Self::InvalidResponse { .. }
            | Self::Unsupported { .. }
            | Self::Config(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16) -> BackendError {
        BackendError::Api {
            backend: "openai".into(),
            status,
            message: "boom".into(),
        }
    }

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        assert!(api(429).is_retryable());
        assert!(api(500).is_retryable());
        assert!(api(503).is_retryable());
    }

    #[test]
    fn client_errors_are_not_retryable() {
        assert!(!api(400).is_retryable());
        assert!(!api(401).is_retryable());
        assert!(!api(404).is_retryable());
        assert!(!BackendError::Config("missing key".into()).is_retryable());
    }

    #[test]
    fn timeout_is_retryable() {
        let err = BackendError::Timeout {
            backend: "azure_openai".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "azure_openai request timed out");
    }

    #[test]
    fn api_error_display_includes_status() {
        assert_eq!(api(502).to_string(), "openai api error (502): boom");
        assert_eq!(api(502).status(), Some(502));
    }
}
