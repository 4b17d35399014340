use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::types::VendorResponse;
use reqwest::Client;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::warn;

#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    timeout: Duration,
    max_retries: u32,
}

impl PaymentHttpClient {
    pub fn new(timeout: Duration, max_retries: u32) -> PaymentResult<Self> {
        let client =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("failed to initialize HTTP client: {}", e),
                })?;

        Ok(Self {
            client,
            timeout,
            max_retries,
        })
    }

    /// Single POST attempt. Payment submissions are not idempotent upstream, so a
    /// failed send is reported rather than retried.
    pub async fn post_json(
        &self,
        url: &str,
        bearer_token: &str,
        body: &JsonValue,
    ) -> PaymentResult<VendorResponse> {
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .bearer_auth(bearer_token)
            .json(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        self.read_response(response).await
    }

    /// GET with basic auth, retried on transport errors, 429 and 5xx
    pub async fn get_with_basic_auth(
        &self,
        url: &str,
        username: &str,
        password: &str,
    ) -> PaymentResult<VendorResponse> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            let response = self
                .client
                .get(url)
                .timeout(self.timeout)
                .basic_auth(username, Some(password))
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if (status.as_u16() == 429 || status.is_server_error())
                        && attempt < self.max_retries
                    {
                        warn!(
                            status = %status,
                            attempt = attempt + 1,
                            "token endpoint error, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                        continue;
                    }
                    return self.read_response(resp).await;
                }
                Err(e) => {
                    last_error = Some(self.classify(e));
                    if attempt < self.max_retries {
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                        continue;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(PaymentError::NetworkError {
            message: "provider request failed".to_string(),
        }))
    }

    async fn read_response(&self, resp: reqwest::Response) -> PaymentResult<VendorResponse> {
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(|e| self.classify(e))?;
        Ok(VendorResponse {
            status,
            body: parse_body(&text),
        })
    }

    fn classify(&self, err: reqwest::Error) -> PaymentError {
        if err.is_timeout() {
            PaymentError::Timeout {
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            PaymentError::NetworkError {
                message: format!("provider request failed: {}", err),
            }
        }
    }
}

/// Upstream bodies are usually JSON; anything else is kept verbatim under `raw`
pub fn parse_body(text: &str) -> JsonValue {
    serde_json::from_str::<JsonValue>(text).unwrap_or_else(|_| serde_json::json!({ "raw": text }))
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn secure_eq_behaves_correctly() {
        assert!(secure_eq(b"abc", b"abc"));
        assert!(!secure_eq(b"abc", b"abd"));
        assert!(!secure_eq(b"abc", b"ab"));
    }

    #[test]
    fn non_json_bodies_are_wrapped() {
        assert_eq!(parse_body(r#"{"ResponseCode":"0"}"#), json!({"ResponseCode": "0"}));
        assert_eq!(parse_body("<html>oops</html>"), json!({"raw": "<html>oops</html>"}));
    }
}
