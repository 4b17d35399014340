use crate::payments::error::PaymentError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Sandbox,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Sandbox => "sandbox",
            Environment::Production => "production",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Environment {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "" | "sandbox" => Ok(Environment::Sandbox),
            "production" => Ok(Environment::Production),
            _ => Err(PaymentError::ValidationError {
                message: "environment must be sandbox or production".to_string(),
                field: Some("environment".to_string()),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ShortcodeType {
    Paybill,
    Till,
    B2c,
    B2b,
}

impl ShortcodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShortcodeType::Paybill => "paybill",
            ShortcodeType::Till => "till",
            ShortcodeType::B2c => "b2c",
            ShortcodeType::B2b => "b2b",
        }
    }
}

impl FromStr for ShortcodeType {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "paybill" => Ok(ShortcodeType::Paybill),
            "till" => Ok(ShortcodeType::Till),
            "b2c" => Ok(ShortcodeType::B2c),
            "b2b" => Ok(ShortcodeType::B2b),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported shortcode type: {}", value),
                field: Some("shortcode_type".to_string()),
            }),
        }
    }
}

/// Daraja app credentials of one business in one environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DarajaCredential {
    pub id: Uuid,
    pub business_id: Uuid,
    pub environment: Environment,
    pub consumer_key: String,
    #[serde(skip_serializing)]
    pub consumer_secret: String,
    pub token_url: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpesaShortcode {
    pub id: Uuid,
    pub business_id: Uuid,
    pub shortcode: String,
    pub shortcode_type: ShortcodeType,
    #[serde(skip_serializing)]
    pub lipa_passkey: Option<String>,
    pub initiator_name: Option<String>,
    #[serde(skip_serializing)]
    pub security_credential: Option<String>,
    pub is_active: bool,
}

/// Daraja API operations this gateway calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DarajaEndpoint {
    StkPush,
    B2cPayment,
    B2bUssdPush,
    TransactionStatus,
    RatibaStandingOrder,
    QrCode,
}

impl DarajaEndpoint {
    pub fn path(&self) -> &'static str {
        match self {
            DarajaEndpoint::StkPush => "/mpesa/stkpush/v1/processrequest",
            DarajaEndpoint::B2cPayment => "/mpesa/b2c/v3/paymentrequest",
            DarajaEndpoint::B2bUssdPush => "/v1/ussdpush/get-msisdn",
            DarajaEndpoint::TransactionStatus => "/mpesa/transactionstatus/v1/query",
            DarajaEndpoint::RatibaStandingOrder => "/standingorder/v1/createStandingOrderExternal",
            DarajaEndpoint::QrCode => "/mpesa/qrcode/v1/generate",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DarajaEndpoint::StkPush => "stk_push",
            DarajaEndpoint::B2cPayment => "b2c_payment",
            DarajaEndpoint::B2bUssdPush => "b2b_ussd_push",
            DarajaEndpoint::TransactionStatus => "transaction_status",
            DarajaEndpoint::RatibaStandingOrder => "ratiba_standing_order",
            DarajaEndpoint::QrCode => "qr_code",
        }
    }
}

/// Raw upstream answer. Non-2xx statuses are data here, not errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorResponse {
    pub status: u16,
    pub body: JsonValue,
}

impl VendorResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as a JSON object; anything else is wrapped under `data`
    pub fn body_object(&self) -> JsonValue {
        if self.body.is_object() {
            self.body.clone()
        } else {
            serde_json::json!({ "data": self.body })
        }
    }

    pub fn field(&self, name: &str) -> Option<String> {
        crate::status_codes::code_from_json(self.body.get(name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub expires_in: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn environment_parsing_defaults_to_sandbox() {
        assert_eq!(Environment::from_str("").unwrap(), Environment::Sandbox);
        assert_eq!(
            Environment::from_str(" Production ").unwrap(),
            Environment::Production
        );
        assert!(Environment::from_str("staging").is_err());
    }

    #[test]
    fn vendor_response_fields_are_stringified() {
        let response = VendorResponse {
            status: 200,
            body: json!({"ResponseCode": "0", "CheckoutRequestID": "ws_CO_1"}),
        };
        assert!(response.is_success());
        assert_eq!(response.field("ResponseCode").as_deref(), Some("0"));
        assert_eq!(response.field("missing"), None);

        let raw = VendorResponse {
            status: 502,
            body: json!("Bad Gateway"),
        };
        assert!(!raw.is_success());
        assert_eq!(raw.body_object(), json!({"data": "Bad Gateway"}));
    }
}
