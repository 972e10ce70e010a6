//! Error types for the bridge.

/// Top-level error type for the bridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Moderation error: {0}")]
    Moderation(#[from] ModerationError),

    #[error("Cycle error: {0}")]
    Cycle(#[from] CycleError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Unable to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn missing(key: &str, hint: impl Into<String>) -> Self {
        Self::MissingRequired {
            key: key.to_string(),
            hint: hint.into(),
        }
    }
}

/// Inference backend errors.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Unsupported backend \"{0}\"")]
    Unsupported(String),

    #[error("Malformed response from {backend}: {reason}")]
    MalformedResponse {
        backend: &'static str,
        reason: String,
    },
}

impl BackendError {
    pub(crate) fn malformed(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            backend,
            reason: reason.into(),
        }
    }
}

/// Remote moderation classifier errors.
#[derive(Debug, thiserror::Error)]
pub enum ModerationError {
    #[error("Moderation request failed: {0}")]
    Transport(String),

    #[error("Moderation HTTP {0}")]
    Status(u16),

    #[error("Moderation response malformed: {0}")]
    Malformed(String),
}

/// Internal faults raised while driving a job cycle.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("Worker {worker} panicked: {reason}")]
    Panicked { worker: i64, reason: String },
}

/// Result type alias for the bridge.
pub type Result<T> = std::result::Result<T, Error>;
