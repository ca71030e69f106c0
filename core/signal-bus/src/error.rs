//! Error types for the dispatch engine

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, SignalError>;

/// Why an emission was dropped before reaching any handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockReason {
    /// Circuit breaker for the event is open
    CircuitOpen,
    /// Rate limiter window for the event is saturated
    RateLimited,
    /// An interceptor or filter vetoed the emission
    Pipeline,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen => write!(f, "circuit open"),
            Self::RateLimited => write!(f, "rate limited"),
            Self::Pipeline => write!(f, "blocked by pipeline"),
        }
    }
}

/// Crate-level error
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("invalid signal config: {0}")]
    InvalidConfig(String),

    #[error("event `{event}` already holds the maximum of {max} handlers")]
    CapacityExceeded { event: String, max: usize },

    #[error("signal `{event}` blocked: {reason}")]
    Blocked { event: String, reason: BlockReason },

    #[error("no handlers for event `{0}`")]
    NoHandlers(String),

    #[error("signal engine is shut down")]
    ShutDown,

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Processing(#[from] ProcessingError),
}

/// Errors raised while loading an [`EngineConfig`](crate::config::EngineConfig)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Error returned by a handler invocation.
///
/// Handlers classify their own failures; the engine never inspects the
/// message text to pick an error code.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Generic failure, retryable
    #[error("{0}")]
    Failed(String),

    /// Business-rule failure (e.g. a payment was declined)
    #[error("business failure: {0}")]
    Business(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self::Business(message.into())
    }

    /// Processing code this failure maps to
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Business(_) => ErrorCode::BusinessFailure,
            Self::Failed(_) | Self::Other(_) => ErrorCode::HandlerFailed,
        }
    }
}

/// Numeric processing error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Handler failed or timed out
    HandlerFailed,
    /// Handler task was cancelled before completing
    Interrupted,
    /// Handler reported a business failure
    BusinessFailure,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            Self::HandlerFailed => 1001,
            Self::Interrupted => 1002,
            Self::BusinessFailure => 2001,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Terminal failure of one handler invocation (after its retry budget)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("[{code}] {message} (attempts: {attempts})")]
pub struct ProcessingError {
    pub code: ErrorCode,
    pub message: String,
    /// Attempts made before giving up
    pub attempts: u32,
    pub timed_out: bool,
}

impl ProcessingError {
    pub(crate) fn from_handler(err: &HandlerError) -> Self {
        Self {
            code: err.code(),
            message: format!("signal handler execution failed: {err}"),
            attempts: 1,
            timed_out: false,
        }
    }

    pub(crate) fn timeout(timeout_ms: u64) -> Self {
        Self {
            code: ErrorCode::HandlerFailed,
            message: format!("signal handler execution timed out after {timeout_ms}ms"),
            attempts: 1,
            timed_out: true,
        }
    }

    pub(crate) fn panicked() -> Self {
        Self {
            code: ErrorCode::HandlerFailed,
            message: "signal handler panicked".to_string(),
            attempts: 1,
            timed_out: false,
        }
    }

    pub(crate) fn interrupted() -> Self {
        Self {
            code: ErrorCode::Interrupted,
            message: "signal handler execution interrupted".to_string(),
            attempts: 1,
            timed_out: false,
        }
    }

    pub(crate) fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}
