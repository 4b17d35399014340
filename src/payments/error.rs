use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error)]
pub enum PaymentError {
    #[error("Validation error: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Authentication with provider failed: {message}")]
    AuthenticationError { message: String },
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::ValidationError { .. } => false,
            PaymentError::NetworkError { .. } => true,
            PaymentError::Timeout { .. } => true,
            PaymentError::AuthenticationError { .. } => false,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            PaymentError::ValidationError { message, .. } => message.clone(),
            PaymentError::NetworkError { .. } => "Failed to submit".to_string(),
            PaymentError::Timeout { .. } => "Safaricom API timed out".to_string(),
            PaymentError::AuthenticationError { .. } => {
                "Failed to retrieve access token".to_string()
            }
        }
    }
}

impl From<reqwest::Error> for PaymentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not expose the configured duration
            PaymentError::Timeout { timeout_secs: 0 }
        } else {
            PaymentError::NetworkError {
                message: err.to_string(),
            }
        }
    }
}

impl From<PaymentError> for crate::error::AppError {
    fn from(err: PaymentError) -> Self {
        use crate::error::{AppError, AppErrorKind, ExternalError, ValidationError};

        match err {
            PaymentError::ValidationError { message, field } => {
                AppError::new(AppErrorKind::Validation(ValidationError::InvalidField {
                    field: field.unwrap_or_else(|| "request".to_string()),
                    reason: message,
                }))
            }
            PaymentError::Timeout { timeout_secs } => {
                AppError::new(AppErrorKind::External(ExternalError::Timeout {
                    service: "daraja".to_string(),
                    timeout_secs,
                }))
            }
            other => AppError::new(AppErrorKind::External(ExternalError::PaymentProvider {
                provider: "daraja".to_string(),
                message: other.to_string(),
                is_retryable: other.is_retryable(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_flags_are_set() {
        assert!(PaymentError::NetworkError {
            message: "reset".to_string()
        }
        .is_retryable());
        assert!(!PaymentError::AuthenticationError {
            message: "bad key".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn validation_error_converts_to_400() {
        let app: crate::error::AppError = PaymentError::ValidationError {
            message: "amount must be > 0".to_string(),
            field: Some("amount".to_string()),
        }
        .into();
        assert_eq!(app.status_code(), 400);
    }
}
