//! Error handling for the dispatch engine.
//!
//! This module provides:
//! - Machine-readable error codes for queue/lock/send failures
//! - Retryability classification driving the job retry policy
//! - User-friendly messages vs detailed internal messages
//! - Error logging with tracing integration
//! - Metrics integration for error tracking

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by callers for programmatic error
/// handling (e.g. alerting on write-back failures).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Send errors (1000-1099)
    TransientSend,
    SendTimeout,

    // Configuration errors (1100-1199)
    Configuration,
    Validation,

    // Lock errors (1200-1299)
    LockUnavailable,
    LockExpired,

    // Queue errors (2000-2099)
    Queue,
    JobNotFound,
    InvalidStateTransition,

    // Persistence errors (2100-2199)
    PersistenceWrite,

    // Serialization errors (2200-2299)
    Serialization,

    // Internal errors (9000-9099)
    Internal,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::TransientSend => 1000,
            Self::SendTimeout => 1001,

            Self::Configuration => 1100,
            Self::Validation => 1101,

            Self::LockUnavailable => 1200,
            Self::LockExpired => 1201,

            Self::Queue => 2000,
            Self::JobNotFound => 2001,
            Self::InvalidStateTransition => 2002,

            Self::PersistenceWrite => 2100,

            Self::Serialization => 2200,

            Self::Internal => 9000,
        }
    }

    /// Check if this error is transient in nature.
    ///
    /// Note that the queue applies its retry policy uniformly by attempt
    /// count; this classification exists so callers can distinguish errors
    /// that would benefit from a retry from those that will not.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientSend | Self::SendTimeout | Self::LockUnavailable | Self::LockExpired
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "send",
            1100..=1199 => "configuration",
            1200..=1299 => "lock",
            2000..=2099 => "queue",
            2100..=2199 => "persistence",
            2200..=2299 => "serialization",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging and alerting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, invalid transitions)
    Low,
    /// Operational issues (timeouts, transient transport failures)
    Medium,
    /// System errors (misconfiguration, write-back failures)
    High,
    /// Critical errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::Validation
            | ErrorCode::JobNotFound
            | ErrorCode::InvalidStateTransition => Self::Low,

            ErrorCode::TransientSend
            | ErrorCode::SendTimeout
            | ErrorCode::LockUnavailable
            | ErrorCode::LockExpired => Self::Medium,

            ErrorCode::Configuration
            | ErrorCode::Queue
            | ErrorCode::PersistenceWrite
            | ErrorCode::Serialization => Self::High,

            ErrorCode::Internal => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the dispatch engine.
///
/// Supports structured error codes, user-friendly vs internal messages, and
/// source-error chaining.
#[derive(Error, Debug)]
pub struct DispatchError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to callers)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl DispatchError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::Internal, "An internal error occurred", message)
    }

    /// Create a transient send error (transport/network failure).
    pub fn transient_send(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::TransientSend, "Email send failed", message)
    }

    /// Create a send timeout error.
    pub fn send_timeout(timeout_ms: u64) -> Self {
        Self::with_internal(
            ErrorCode::SendTimeout,
            "Email send timed out",
            format!("no response from transport within {}ms", timeout_ms),
        )
    }

    /// Create a configuration error (unknown/invalid account).
    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Configuration, message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    /// Create a lock-unavailable error (lease held by another worker).
    pub fn lock_unavailable(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::LockUnavailable, message)
    }

    /// Create a lock-expired error (lease lost mid-processing).
    pub fn lock_expired(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::LockExpired, message)
    }

    /// Create a queue backend error.
    pub fn queue(user_message: impl Into<Cow<'static, str>>, internal: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::Queue, user_message, internal)
    }

    /// Create a job-not-found error.
    pub fn job_not_found(id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", id))
    }

    /// Create an invalid-state-transition error.
    pub fn invalid_transition(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidStateTransition, message)
    }

    /// Create a persistence write-back error.
    pub fn persistence_write(internal: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::PersistenceWrite,
            "Campaign status write-back failed",
            internal,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Check if this error is transient.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    /// Record error metrics.
    fn record_metrics(&self) {
        counter!(
            "dispatch_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::Serialization,
            "Failed to serialize job data",
            error.to_string(),
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding dispatch context to foreign results.
pub trait ErrorContext<T> {
    /// Wrap the error with a code and message.
    fn with_code(self, code: ErrorCode, message: &'static str) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_code(self, code: ErrorCode, message: &'static str) -> Result<T> {
        self.map_err(|e| {
            DispatchError::with_internal(code, message, e.to_string()).with_source(e)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
