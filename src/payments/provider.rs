use crate::payments::error::PaymentResult;
use crate::payments::types::{DarajaCredential, DarajaEndpoint, Environment, VendorResponse};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

/// Outbound Daraja calls, as seen by the request dispatcher
#[async_trait]
pub trait DarajaGateway: Send + Sync {
    /// OAuth access token for `credential`, possibly served from cache
    async fn access_token(&self, credential: &DarajaCredential) -> PaymentResult<String>;

    /// Authenticated POST. Upstream non-2xx answers come back as `Ok` with their status.
    async fn post(
        &self,
        credential: &DarajaCredential,
        endpoint: DarajaEndpoint,
        body: &JsonValue,
    ) -> PaymentResult<VendorResponse>;

    fn environment_base_url(&self, environment: Environment) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::error::PaymentError;
    use serde_json::json;
    use uuid::Uuid;

    struct MockGateway;

    #[async_trait]
    impl DarajaGateway for MockGateway {
        async fn access_token(&self, credential: &DarajaCredential) -> PaymentResult<String> {
            if credential.consumer_key.is_empty() {
                return Err(PaymentError::AuthenticationError {
                    message: "empty consumer key".to_string(),
                });
            }
            Ok("mock-token".to_string())
        }

        async fn post(
            &self,
            credential: &DarajaCredential,
            endpoint: DarajaEndpoint,
            _body: &JsonValue,
        ) -> PaymentResult<VendorResponse> {
            self.access_token(credential).await?;
            Ok(VendorResponse {
                status: 200,
                body: json!({"ResponseCode": "0", "endpoint": endpoint.path()}),
            })
        }

        fn environment_base_url(&self, environment: Environment) -> String {
            format!("https://{}.example", environment)
        }
    }

    fn credential(key: &str) -> DarajaCredential {
        DarajaCredential {
            id: Uuid::new_v4(),
            business_id: Uuid::new_v4(),
            environment: Environment::Sandbox,
            consumer_key: key.to_string(),
            consumer_secret: "secret".to_string(),
            token_url: None,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn trait_can_be_implemented_by_mock_gateway() {
        let gateway: Box<dyn DarajaGateway> = Box::new(MockGateway);

        let response = gateway
            .post(&credential("key"), DarajaEndpoint::StkPush, &json!({}))
            .await
            .expect("mock post should succeed");
        assert!(response.is_success());
        assert_eq!(
            response.body["endpoint"],
            json!("/mpesa/stkpush/v1/processrequest")
        );

        let err = gateway
            .post(&credential(""), DarajaEndpoint::QrCode, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::AuthenticationError { .. }));
        assert_eq!(
            gateway.environment_base_url(Environment::Production),
            "https://production.example"
        );
    }
}
