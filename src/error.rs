//! Unified error handling for the gateway
//!
//! Every module error converts into [`AppError`], which carries the HTTP status mapping,
//! a machine-readable error code and the message shown to integrators.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for programmatic handling by integrators
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "INVALID_BUSINESS_ID")]
    InvalidBusinessId,
    #[serde(rename = "BUSINESS_REQUIRED")]
    BusinessRequired,
    #[serde(rename = "BUSINESS_SUSPENDED")]
    BusinessSuspended,
    #[serde(rename = "TENANCY_CONFLICT")]
    TenancyConflict,
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,
    #[serde(rename = "FORBIDDEN")]
    Forbidden,
    #[serde(rename = "REQUEST_NOT_FOUND")]
    RequestNotFound,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors (502, 503, 504)
    #[serde(rename = "PAYMENT_PROVIDER_ERROR")]
    PaymentProviderError,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Business rule violations
#[derive(Debug, Clone)]
pub enum DomainError {
    /// `business_id` did not parse or names no business
    InvalidBusinessId { value: String },
    /// No explicit business and no client binding to fall back on
    BusinessRequired,
    /// Business exists but is not active
    BusinessSuspended { business_id: String },
    /// OAuth client is bound to another business
    TenancyConflict { client_id: String },
    /// Missing or invalid credentials
    Unauthenticated { reason: String },
    /// Authenticated but not allowed
    Forbidden { reason: String },
    /// Ledger row or batch does not exist (or belongs to another tenant)
    RequestNotFound { kind: String, id: String },
}

/// Infrastructure-level errors
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    /// Database connection or query failure
    Database { message: String, is_retryable: bool },
    /// Missing or invalid configuration
    Configuration { message: String },
}

/// External service errors
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// Daraja rejected or failed the call
    PaymentProvider {
        provider: String,
        message: String,
        is_retryable: bool,
    },
    /// External service timeout
    Timeout { service: String, timeout_secs: u64 },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    /// Required field missing
    MissingField { field: String },
    /// Field present but malformed
    InvalidField { field: String, reason: String },
    /// Invalid amount (format or value)
    InvalidAmount { amount: String, reason: String },
    /// Body is not the JSON shape the endpoint expects
    InvalidPayload { reason: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Validation(ValidationError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }))
    }

    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Domain(DomainError::RequestNotFound {
            kind: kind.into(),
            id: id.into(),
        }))
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InvalidBusinessId { .. } => 400,
                DomainError::BusinessRequired => 400,
                DomainError::BusinessSuspended { .. } => 403,
                DomainError::TenancyConflict { .. } => 403,
                DomainError::Unauthenticated { .. } => 401,
                DomainError::Forbidden { .. } => 403,
                DomainError::RequestNotFound { .. } => 404,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => 502, // Bad Gateway
                ExternalError::Timeout { .. } => 504,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InvalidBusinessId { .. } => ErrorCode::InvalidBusinessId,
                DomainError::BusinessRequired => ErrorCode::BusinessRequired,
                DomainError::BusinessSuspended { .. } => ErrorCode::BusinessSuspended,
                DomainError::TenancyConflict { .. } => ErrorCode::TenancyConflict,
                DomainError::Unauthenticated { .. } => ErrorCode::Unauthorized,
                DomainError::Forbidden { .. } => ErrorCode::Forbidden,
                DomainError::RequestNotFound { .. } => ErrorCode::RequestNotFound,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => ErrorCode::PaymentProviderError,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InvalidBusinessId { .. } => "Invalid business_id".to_string(),
                DomainError::BusinessRequired => {
                    "business_id is required (or bind your OAuth client to a business)"
                        .to_string()
                }
                DomainError::BusinessSuspended { .. } => "Business is suspended".to_string(),
                DomainError::TenancyConflict { .. } => {
                    "Client is not allowed to access this business".to_string()
                }
                DomainError::Unauthenticated { reason } => reason.clone(),
                DomainError::Forbidden { reason } => reason.clone(),
                DomainError::RequestNotFound { kind, id } => {
                    format!("{} '{}' not found", kind, id)
                }
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { .. } => "Safaricom API error".to_string(),
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => format!(
                    "{} request timed out after {} seconds",
                    service, timeout_secs
                ),
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::MissingField { field } => {
                    format!("Missing required field(s): {}", field)
                }
                ValidationError::InvalidField { reason, .. } => reason.clone(),
                ValidationError::InvalidAmount { reason, .. } => reason.clone(),
                ValidationError::InvalidPayload { reason } => reason.clone(),
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentProvider { is_retryable, .. } => *is_retryable,
                ExternalError::Timeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

// From<DatabaseError> lives in database/error.rs, From<PaymentError> in payments/error.rs

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;
