//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use std::env;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub daraja: DarajaConfig,
    pub auth: AuthConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public base URL Daraja calls back into, e.g. `https://gateway.example.com`
    pub public_base_url: String,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
    pub run_migrations: bool,
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: String,
    pub default_ttl: u64, // seconds
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Daraja HTTP client configuration
#[derive(Debug, Clone)]
pub struct DarajaConfig {
    pub sandbox_base_url: String,
    pub production_base_url: String,
    pub request_timeout: u64, // seconds
    pub token_max_retries: u32,
    /// Full override for the B2B USSD push URL
    pub b2b_ussd_url: Option<String>,
}

/// Internal/maintainer authentication
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Shared key for internal endpoints; `None` makes those endpoints answer 500
    pub internal_api_key: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv::dotenv().ok();

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
            cache: CacheConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
            daraja: DarajaConfig::from_env()?,
            auth: AuthConfig::from_env(),
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.database.validate()?;
        self.cache.validate()?;
        self.logging.validate()?;
        self.daraja.validate()?;

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "8000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".to_string()))?;
        let public_base_url = env::var("PUBLIC_BASE_URL")
            .unwrap_or_else(|_| format!("http://{}:{}", host, port))
            .trim_end_matches('/')
            .to_string();

        Ok(ServerConfig {
            host,
            port,
            public_base_url,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        if !self.public_base_url.starts_with("http://")
            && !self.public_base_url.starts_with("https://")
        {
            return Err(ConfigError::InvalidValue(
                "PUBLIC_BASE_URL must be a valid URL".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingVariable("DATABASE_URL".to_string()))?,
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()))?,
            min_connections: env::var("DB_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MIN_CONNECTIONS".to_string()))?,
            connection_timeout: env::var("DB_CONNECTION_TIMEOUT")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_CONNECTION_TIMEOUT".to_string()))?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
            run_migrations: env::var("DB_RUN_MIGRATIONS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_RUN_MIGRATIONS".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(CacheConfig {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            default_ttl: env::var("CACHE_DEFAULT_TTL")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("CACHE_DEFAULT_TTL".to_string()))?,
            max_connections: env::var("CACHE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("CACHE_MAX_CONNECTIONS".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::InvalidValue("REDIS_URL".to_string()));
        }

        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            return Err(ConfigError::InvalidValue(
                "REDIS_URL must start with redis:// or rediss://".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            format: LogFormat::Plain,
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl Default for DarajaConfig {
    fn default() -> Self {
        Self {
            sandbox_base_url: "https://sandbox.safaricom.co.ke".to_string(),
            production_base_url: "https://api.safaricom.co.ke".to_string(),
            request_timeout: 30,
            token_max_retries: 2,
            b2b_ussd_url: None,
        }
    }
}

impl DarajaConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = DarajaConfig::default();

        Ok(DarajaConfig {
            sandbox_base_url: env::var("MPESA_DARAJA_SANDBOX_BASE_URL")
                .unwrap_or(defaults.sandbox_base_url)
                .trim_end_matches('/')
                .to_string(),
            production_base_url: env::var("MPESA_DARAJA_PRODUCTION_BASE_URL")
                .unwrap_or(defaults.production_base_url)
                .trim_end_matches('/')
                .to_string(),
            request_timeout: env::var("MPESA_HTTP_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("MPESA_HTTP_TIMEOUT_SECS".to_string()))?,
            token_max_retries: env::var("MPESA_TOKEN_MAX_RETRIES")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("MPESA_TOKEN_MAX_RETRIES".to_string()))?,
            b2b_ussd_url: env::var("MPESA_B2B_USSD_API_URL")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, url) in [
            ("MPESA_DARAJA_SANDBOX_BASE_URL", &self.sandbox_base_url),
            ("MPESA_DARAJA_PRODUCTION_BASE_URL", &self.production_base_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidValue(format!(
                    "{} must be a valid URL",
                    name
                )));
            }
        }

        if self.request_timeout == 0 {
            return Err(ConfigError::InvalidValue(
                "MPESA_HTTP_TIMEOUT_SECS".to_string(),
            ));
        }

        Ok(())
    }
}

impl AuthConfig {
    pub fn from_env() -> Self {
        AuthConfig {
            internal_api_key: env::var("INTERNAL_API_KEY")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),
}
