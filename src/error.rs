//! Error types shared across the rate limiter and the tool orchestrator.

use std::time::Duration;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Raised synchronously when a configuration cannot be used.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("requests_per_second must be > 0 (got {0})")]
    InvalidRate(f64),

    #[error("burst_size must be >= 1 (got {0})")]
    InvalidBurst(u32),

    #[error("{field} must not be negative (got {value_ms}ms)")]
    NegativeTimeout { field: &'static str, value_ms: i64 },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

/// Why a blocking [`wait`](crate::rate_limiter::RateLimiter::wait) gave up.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WaitError {
    #[error("rate limit wait cancelled")]
    Cancelled,

    /// The caller's deadline elapses before a token can become available.
    #[error("rate limit wait would exceed context deadline (need {needed:?})")]
    DeadlineExceeded { needed: Duration },

    /// The required delay is longer than the limiter's own wait ceiling.
    #[error("rate limit wait of {needed:?} exceeds wait timeout {limit:?}")]
    WaitTimeout { needed: Duration, limit: Duration },
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// Failure of a single tool invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("handler not found for tool '{name}'")]
    NotFound { name: String },

    #[error("invalid arguments for tool '{name}': {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("tool '{name}' failed: {message}")]
    Failed { name: String, message: String },

    #[error("tool '{name}' panicked: {message}")]
    Panicked { name: String, message: String },

    #[error("tool '{name}' timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("tool '{name}' cancelled")]
    Cancelled { name: String },
}

impl ToolError {
    /// Name of the tool the error belongs to.
    pub fn tool_name(&self) -> &str {
        match self {
            ToolError::NotFound { name }
            | ToolError::InvalidArguments { name, .. }
            | ToolError::Failed { name, .. }
            | ToolError::Panicked { name, .. }
            | ToolError::Timeout { name, .. }
            | ToolError::Cancelled { name } => name,
        }
    }

    /// Short label for logs and observer events.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::NotFound { .. } => "not_found",
            ToolError::InvalidArguments { .. } => "invalid_arguments",
            ToolError::Failed { .. } => "failed",
            ToolError::Panicked { .. } => "panicked",
            ToolError::Timeout { .. } => "timeout",
            ToolError::Cancelled { .. } => "cancelled",
        }
    }
}

/// Error returned by the orchestrator for a batch.
///
/// Only the earliest-indexed failure of the batch is reported.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("tool call #{index} ({call_id}) failed: {source}")]
    Tool {
        index: usize,
        call_id: String,
        #[source]
        source: ToolError,
    },
}

impl DispatchError {
    /// The underlying tool error.
    pub fn tool_error(&self) -> &ToolError {
        match self {
            DispatchError::Tool { source, .. } => source,
        }
    }

    /// Index of the failing call in the dispatched batch.
    pub fn index(&self) -> usize {
        match self {
            DispatchError::Tool { index, .. } => *index,
        }
    }
}
