//! Unified error types for waypost.
//!
//! Each subsystem has its own error enum; all of them convert into
//! [`GatewayError`], which the HTTP layer maps onto JSON error responses.

// ============================================================================
// Main Error Type
// ============================================================================

/// The main error type for gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Channel adapter error.
    #[error("channel: {0}")]
    Channel(#[from] ChannelError),

    /// Reasoning backend error.
    #[error("backend: {0}")]
    Backend(#[from] BackendError),

    /// Configuration error.
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// Message/memory storage error.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    /// Scheduler error.
    #[error("cron: {0}")]
    Cron(#[from] CronError),

    /// Malformed request or missing parameter.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation blocked by tool policy.
    #[error("blocked: {0}")]
    Blocked(String),

    /// Missing or invalid credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// IO error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Task join error.
    #[error("task: {0}")]
    Task(String),

    /// Generic internal error.
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// Create a validation error.
    #[inline]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error.
    #[inline]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a config error from a string.
    #[inline]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(ConfigError::Invalid(msg.into()))
    }

    /// Create an internal error.
    #[inline]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<tokio::task::JoinError> for GatewayError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

// ============================================================================
// Channel Errors
// ============================================================================

/// Error type for channel adapter operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Failed to start the channel.
    #[error("start failed: {0}")]
    StartFailed(String),

    /// Failed to stop the channel.
    #[error("stop failed: {0}")]
    StopFailed(String),

    /// Failed to deliver a message.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Configuration error.
    #[error("config: {0}")]
    Config(String),

    /// Channel is not connected.
    #[error("not connected")]
    NotConnected,

    /// Internal error.
    #[error("{0}")]
    Internal(String),
}

impl ChannelError {
    /// Create a start failed error.
    #[inline]
    pub fn start(msg: impl Into<String>) -> Self {
        Self::StartFailed(msg.into())
    }

    /// Create a send failed error.
    #[inline]
    pub fn send(msg: impl Into<String>) -> Self {
        Self::SendFailed(msg.into())
    }

    /// Create an internal error.
    #[inline]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type for channel operations.
pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

// ============================================================================
// Backend Errors
// ============================================================================

/// Error type for reasoning backend calls.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// No backend is configured and no mock reply is set.
    #[error("reasoning backend disabled")]
    Disabled,

    /// Transport failure talking to the backend.
    #[error("request failed: {0}")]
    Request(String),

    /// Backend answered with a non-success status.
    #[error("status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body (truncated).
        body: String,
    },

    /// Backend answered with an unusable payload.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Session is busy and the busy policy rejected the call.
    #[error("session busy: {0}")]
    Busy(String),
}

/// Result type for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

// ============================================================================
// Configuration Errors
// ============================================================================

/// Error type for configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("parse: {0}")]
    Parse(#[from] serde_json::Error),

    /// Invalid value.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Reload requested but the config was supplied in memory.
    #[error("no config path bound; configuration was supplied in memory")]
    NoConfigPath,
}

impl ConfigError {
    /// Create an invalid value error.
    #[inline]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// Storage Errors
// ============================================================================

/// Error type for storage operations (messages, observations, cron files).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// IO error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Item not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Item already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
}

impl StorageError {
    /// Create a not found error.
    #[inline]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ============================================================================
// Cron Errors
// ============================================================================

/// Error type for scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum CronError {
    /// Schedule expression failed to parse.
    #[error("invalid schedule '{expression}': {reason}")]
    InvalidSchedule {
        /// The offending expression.
        expression: String,
        /// Parser message.
        reason: String,
    },

    /// Job id is unknown.
    #[error("job not found: {0}")]
    NotFound(String),

    /// Job id already exists.
    #[error("job already exists: {0}")]
    AlreadyExists(String),

    /// Persistence failure.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for scheduler operations.
pub type CronResult<T> = std::result::Result<T, CronError>;

// ============================================================================
// Error Context Extension
// ============================================================================

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, msg: impl Into<String>) -> Result<T>;

    /// Add context using a closure (lazy evaluation).
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<GatewayError>> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            GatewayError::Internal(format!("{}: {}", msg.into(), err))
        })
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            GatewayError::Internal(format!("{}: {}", f(), err))
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        let channel_err = ChannelError::NotConnected;
        let err: GatewayError = channel_err.into();
        assert!(matches!(err, GatewayError::Channel(_)));

        let cron_err = CronError::NotFound("job".into());
        let err: GatewayError = cron_err.into();
        assert!(matches!(err, GatewayError::Cron(_)));
    }

    #[test]
    fn test_error_helpers() {
        let err = GatewayError::invalid("missing channelId");
        assert!(matches!(err, GatewayError::Validation(_)));

        let err = GatewayError::config("bad value");
        assert!(matches!(err, GatewayError::Config(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_context() {
        let res: std::result::Result<(), ChannelError> = Err(ChannelError::send("timeout"));
        let err = res.context("delivering reply").unwrap_err();
        assert_eq!(err.to_string(), "delivering reply: channel: send failed: timeout");
    }
}
