//! Unified error handling for Tariffa
//!
//! Every failure the rating engine, the stores and the billing-cycle manager
//! can produce is expressed as an [`AppError`]. Variants are grouped into a
//! small taxonomy ([`ErrorKind`]) so callers can decide whether to retry,
//! reject the event, or escalate.

use std::fmt;
use thiserror::Error;

/// Main application error type
///
/// All errors in the application should be converted to this type.
#[derive(Error, Debug)]
pub enum AppError {
    // ==================== Validation Errors ====================
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid period key: {0}")]
    InvalidPeriodKey(String),

    // ==================== Concurrency Errors ====================
    #[error("Pricing of event {stamp} gave up after {attempts} conflicting attempts")]
    PricingRetriesExhausted { stamp: String, attempts: u32 },

    // ==================== Resource Errors ====================
    #[error("Rate not found: {0}")]
    RateNotFound(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Balance not found: {0}")]
    BalanceNotFound(String),

    // ==================== State Errors ====================
    #[error("Billing cycle {key}: {reason}")]
    CycleStateViolation { key: String, reason: String },

    // ==================== Infrastructure Errors ====================
    #[error("Database error: {0}")]
    Database(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Cache connection failed: {0}")]
    CacheConnection(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of [`AppError`] variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    ConcurrencyConflict,
    ResourceUnavailable,
    StateViolation,
    Infrastructure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::ConcurrencyConflict => "concurrency_conflict",
            ErrorKind::ResourceUnavailable => "resource_unavailable",
            ErrorKind::StateViolation => "state_violation",
            ErrorKind::Infrastructure => "infrastructure",
        };
        write!(f, "{}", s)
    }
}

impl AppError {
    /// Shorthand for a billing-cycle state violation
    pub fn cycle_state(key: impl fmt::Display, reason: impl Into<String>) -> Self {
        AppError::CycleStateViolation {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns the taxonomy bucket for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Validation(_)
            | AppError::InvalidInput(_)
            | AppError::MissingField(_)
            | AppError::InvalidPeriodKey(_) => ErrorKind::Validation,

            AppError::PricingRetriesExhausted { .. } => ErrorKind::ConcurrencyConflict,

            AppError::RateNotFound(_) | AppError::PlanNotFound(_) | AppError::BalanceNotFound(_) => {
                ErrorKind::ResourceUnavailable
            }

            AppError::CycleStateViolation { .. } => ErrorKind::StateViolation,

            AppError::Database(_)
            | AppError::Cache(_)
            | AppError::CacheConnection(_)
            | AppError::Serialization(_)
            | AppError::Config(_)
            | AppError::Internal(_) => ErrorKind::Infrastructure,
        }
    }

    /// Whether resubmitting the same event later may succeed.
    ///
    /// Exhausted pricing retries and transient infrastructure failures are
    /// retryable; validation, missing resources and state violations are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::PricingRetriesExhausted { .. }
                | AppError::Database(_)
                | AppError::CacheConnection(_)
        )
    }

    /// Returns the error code used in logs and worker output
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::MissingField(_) => "missing_field",
            AppError::InvalidPeriodKey(_) => "invalid_period_key",
            AppError::PricingRetriesExhausted { .. } => "pricing_retries_exhausted",
            AppError::RateNotFound(_) => "rate_not_found",
            AppError::PlanNotFound(_) => "plan_not_found",
            AppError::BalanceNotFound(_) => "balance_not_found",
            AppError::CycleStateViolation { .. } => "cycle_state_violation",
            AppError::Database(_) => "database_error",
            AppError::Cache(_) => "cache_error",
            AppError::CacheConnection(_) => "cache_connection_error",
            AppError::Serialization(_) => "serialization_error",
            AppError::Config(_) => "config_error",
            AppError::Internal(_) => "internal_error",
        }
    }
}

// ==================== From implementations ====================

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(err.to_string())
    }
}
