//! Tracing setup and log redaction helpers

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the global subscriber from the logging config. `RUST_LOG` wins over `LOG_LEVEL`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing_with(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_lowercase()));

    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init(),
        LogFormat::Plain => registry.with(fmt::layer().with_target(true)).try_init(),
    };

    if result.is_ok() {
        tracing::info!(format = ?config.format, level = %config.level, "Tracing initialized");
    }
}

/// `254712345678` -> `2547****5678`
pub fn mask_phone_number(phone: &str) -> String {
    let chars: Vec<char> = phone.trim().chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", head, tail)
}

/// Keeps the first four characters of a secret for correlation in logs
pub fn mask_secret(secret: &str) -> String {
    if secret.chars().count() <= 4 {
        return "****".to_string();
    }
    format!("{}****", secret.chars().take(4).collect::<String>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_phone_numbers() {
        assert_eq!(mask_phone_number("254712345678"), "2547****5678");
        assert_eq!(mask_phone_number("0712"), "****");
    }

    #[test]
    fn masks_secrets() {
        assert_eq!(mask_secret("abcdefgh"), "abcd****");
        assert_eq!(mask_secret("abc"), "****");
    }
}
