use crate::config::DarajaConfig;
use crate::middleware::logging::log_external_call;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::DarajaGateway;
use crate::payments::types::{
    AccessToken, DarajaCredential, DarajaEndpoint, Environment, VendorResponse,
};
use crate::payments::utils::PaymentHttpClient;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Tokens are cached for `expires_in` minus this margin
pub const TOKEN_EXPIRY_MARGIN_SECS: u64 = 60;

/// Storage for Daraja access tokens keyed by credential.
/// Implementations must swallow their own outages; a miss just means a fresh fetch.
#[async_trait]
pub trait AccessTokenCache: Send + Sync {
    async fn get_token(&self, credential_id: Uuid) -> Option<String>;
    async fn put_token(&self, credential_id: Uuid, token: &str, ttl: Duration);
}

pub struct DarajaClient {
    http: PaymentHttpClient,
    config: DarajaConfig,
    token_cache: Option<Arc<dyn AccessTokenCache>>,
}

impl DarajaClient {
    pub fn new(config: DarajaConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(
            Duration::from_secs(config.request_timeout),
            config.token_max_retries,
        )?;
        Ok(Self {
            http,
            config,
            token_cache: None,
        })
    }

    pub fn with_token_cache(mut self, cache: Arc<dyn AccessTokenCache>) -> Self {
        self.token_cache = Some(cache);
        self
    }

    pub fn token_url(&self, credential: &DarajaCredential) -> String {
        match credential.token_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => format!(
                "{}/oauth/v1/generate?grant_type=client_credentials",
                self.environment_base_url(credential.environment)
            ),
        }
    }

    pub fn endpoint_url(&self, environment: Environment, endpoint: DarajaEndpoint) -> String {
        if endpoint == DarajaEndpoint::B2bUssdPush {
            if let Some(url) = self.config.b2b_ussd_url.as_deref() {
                return url.to_string();
            }
        }
        format!("{}{}", self.environment_base_url(environment), endpoint.path())
    }

    async fn fetch_token(&self, credential: &DarajaCredential) -> PaymentResult<AccessToken> {
        let url = self.token_url(credential);
        let response = self
            .http
            .get_with_basic_auth(&url, &credential.consumer_key, &credential.consumer_secret)
            .await?;

        if !response.is_success() {
            return Err(PaymentError::AuthenticationError {
                message: format!("token endpoint returned HTTP {}", response.status),
            });
        }

        parse_access_token(&response.body)
    }
}

#[async_trait]
impl DarajaGateway for DarajaClient {
    async fn access_token(&self, credential: &DarajaCredential) -> PaymentResult<String> {
        if let Some(cache) = &self.token_cache {
            if let Some(token) = cache.get_token(credential.id).await {
                debug!(credential_id = %credential.id, "Daraja token served from cache");
                return Ok(token);
            }
        }

        let token = log_external_call("daraja", "oauth_token", self.fetch_token(credential)).await?;

        if let Some(cache) = &self.token_cache {
            let ttl = token.expires_in.saturating_sub(TOKEN_EXPIRY_MARGIN_SECS);
            if ttl > 0 {
                cache
                    .put_token(credential.id, &token.access_token, Duration::from_secs(ttl))
                    .await;
            } else {
                warn!(
                    credential_id = %credential.id,
                    expires_in = token.expires_in,
                    "Daraja token lifetime too short to cache"
                );
            }
        }

        Ok(token.access_token)
    }

    async fn post(
        &self,
        credential: &DarajaCredential,
        endpoint: DarajaEndpoint,
        body: &JsonValue,
    ) -> PaymentResult<VendorResponse> {
        let token = self.access_token(credential).await?;
        let url = self.endpoint_url(credential.environment, endpoint);
        log_external_call("daraja", endpoint.as_str(), self.http.post_json(&url, &token, body))
            .await
    }

    fn environment_base_url(&self, environment: Environment) -> String {
        let base = match environment {
            Environment::Sandbox => &self.config.sandbox_base_url,
            Environment::Production => &self.config.production_base_url,
        };
        base.trim_end_matches('/').to_string()
    }
}

/// Daraja sends `expires_in` as a string; numbers are accepted too
pub fn parse_access_token(body: &JsonValue) -> PaymentResult<AccessToken> {
    let access_token = body
        .get("access_token")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PaymentError::AuthenticationError {
            message: "Failed to retrieve access token".to_string(),
        })?;

    let expires_in = match body.get("expires_in") {
        Some(JsonValue::Number(n)) => n.as_u64().unwrap_or(0),
        Some(JsonValue::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    };

    Ok(AccessToken {
        access_token: access_token.to_string(),
        expires_in,
    })
}

/// `YYYYMMDDHHMMSS`, the timestamp format Daraja expects in request bodies
pub fn daraja_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

/// Lipa Na M-Pesa password: base64(shortcode + passkey + timestamp)
pub fn stk_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    STANDARD.encode(format!("{}{}{}", shortcode, passkey, timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn client() -> DarajaClient {
        DarajaClient::new(DarajaConfig::default()).unwrap()
    }

    fn credential(token_url: Option<&str>) -> DarajaCredential {
        DarajaCredential {
            id: Uuid::new_v4(),
            business_id: Uuid::new_v4(),
            environment: Environment::Sandbox,
            consumer_key: "key".to_string(),
            consumer_secret: "secret".to_string(),
            token_url: token_url.map(str::to_string),
            is_active: true,
        }
    }

    #[test]
    fn urls_follow_environment() {
        let client = client();
        assert_eq!(
            client.endpoint_url(Environment::Sandbox, DarajaEndpoint::StkPush),
            "https://sandbox.safaricom.co.ke/mpesa/stkpush/v1/processrequest"
        );
        assert_eq!(
            client.endpoint_url(Environment::Production, DarajaEndpoint::QrCode),
            "https://api.safaricom.co.ke/mpesa/qrcode/v1/generate"
        );
        assert_eq!(
            client.token_url(&credential(None)),
            "https://sandbox.safaricom.co.ke/oauth/v1/generate?grant_type=client_credentials"
        );
        assert_eq!(
            client.token_url(&credential(Some("https://auth.example/token"))),
            "https://auth.example/token"
        );
    }

    #[test]
    fn b2b_ussd_url_can_be_overridden() {
        let config = DarajaConfig {
            b2b_ussd_url: Some("https://ussd.example/push".to_string()),
            ..DarajaConfig::default()
        };
        let client = DarajaClient::new(config).unwrap();
        assert_eq!(
            client.endpoint_url(Environment::Sandbox, DarajaEndpoint::B2bUssdPush),
            "https://ussd.example/push"
        );
    }

    #[test]
    fn access_token_parsing_accepts_string_expiry() {
        let token = parse_access_token(&json!({"access_token": "abc", "expires_in": "3599"}))
            .unwrap();
        assert_eq!(token.access_token, "abc");
        assert_eq!(token.expires_in, 3599);

        assert!(parse_access_token(&json!({"errorMessage": "Invalid credentials"})).is_err());
    }

    #[test]
    fn stk_password_matches_daraja_format() {
        let ts = daraja_timestamp(Utc.with_ymd_and_hms(2024, 2, 3, 4, 5, 6).unwrap());
        assert_eq!(ts, "20240203040506");
        let password = stk_password("174379", "passkey", &ts);
        let decoded = String::from_utf8(STANDARD.decode(password).unwrap()).unwrap();
        assert_eq!(decoded, "174379passkey20240203040506");
    }
}
