//! Error types crossing the provider boundary.

/// Errors from chat model providers.
///
/// Malformed events inside a stream never surface here; providers recover
/// from them locally.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Missing API key, missing user message, or other caller-side input
    /// problem. Raised before any network I/O.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Transport failure (DNS, TCP, TLS, timeout, body read) while establishing
    /// or reading the stream.
    #[error("connection error: {message}")]
    Connection {
        /// Human-readable description.
        message: String,
        /// Whether a retry is safe. False once any content reached the caller.
        retryable: bool,
        /// Underlying transport error, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
    /// Non-success HTTP status on the initial response.
    #[error("HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Raw response body, for diagnostics.
        body: String,
        /// Whether a retry is safe. False once any content reached the caller.
        retryable: bool,
    },
}

impl LlmError {
    /// Build a connection error without an underlying source.
    #[must_use]
    pub fn connection(message: impl Into<String>, retryable: bool) -> Self {
        Self::Connection {
            message: message.into(),
            retryable,
            source: None,
        }
    }

    /// Whether the orchestration layer may retry the request.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Configuration(_) => false,
            Self::Connection { retryable, .. } | Self::Status { retryable, .. } => *retryable,
        }
    }

    /// HTTP status code, for [`LlmError::Status`].
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Copy of this error with the retryable flag cleared.
    ///
    /// Used when partial output has already been delivered.
    #[must_use]
    pub fn non_retryable(self) -> Self {
        match self {
            Self::Connection {
                message, source, ..
            } => Self::Connection {
                message,
                retryable: false,
                source,
            },
            Self::Status { status, body, .. } => Self::Status {
                status,
                body,
                retryable: false,
            },
            other => other,
        }
    }
}
