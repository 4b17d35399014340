//! Daraja request bodies and the callback URLs they carry

use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::providers::mpesa::stk_password;
use crate::payments::types::{MpesaShortcode, ShortcodeType};
use bigdecimal::BigDecimal;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

/// Public callback endpoints of this gateway, derived from `PUBLIC_BASE_URL`
#[derive(Debug, Clone)]
pub struct CallbackUrls {
    base: String,
}

impl CallbackUrls {
    pub fn new(public_base_url: &str) -> Self {
        Self {
            base: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn stk(&self) -> String {
        self.url("/api/v1/c2b/stk/callback")
    }

    pub fn b2c_result(&self) -> String {
        self.url("/api/v1/b2c/callback/result")
    }

    pub fn b2c_timeout(&self) -> String {
        self.url("/api/v1/b2c/callback/timeout")
    }

    pub fn b2b_ussd(&self) -> String {
        self.url("/api/v1/b2b/ussd/callback")
    }

    pub fn transaction_status_result(&self) -> String {
        self.url("/api/v1/mpesa/transaction-status/result")
    }

    pub fn transaction_status_timeout(&self) -> String {
        self.url("/api/v1/mpesa/transaction-status/timeout")
    }

    /// Ratiba callbacks are matched on the `order_id` this URL carries
    pub fn ratiba(&self, order_id: Uuid) -> String {
        format!("{}?order_id={}", self.url("/api/v1/ratiba/callback"), order_id)
    }
}

/// Daraja takes whole shillings
pub fn whole_amount(amount: &BigDecimal) -> String {
    amount.with_scale(0).to_string()
}

/// `07XXXXXXXX`, `+2547XXXXXXXX` and `2547XXXXXXXX` all become `2547XXXXXXXX`
pub fn normalize_msisdn(raw: &str) -> PaymentResult<String> {
    let digits: String = raw
        .trim()
        .trim_start_matches('+')
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid_phone(raw));
    }

    let normalized = if let Some(rest) = digits.strip_prefix('0') {
        format!("254{}", rest)
    } else {
        digits
    };
    if normalized.len() != 12 || !normalized.starts_with("254") {
        return Err(invalid_phone(raw));
    }
    Ok(normalized)
}

fn invalid_phone(raw: &str) -> PaymentError {
    PaymentError::ValidationError {
        message: format!("invalid phone number: {}", raw),
        field: Some("phone_number".to_string()),
    }
}

fn required<'a>(value: Option<&'a str>, what: &str) -> PaymentResult<&'a str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PaymentError::ValidationError {
            message: format!("shortcode is missing {}", what),
            field: Some("shortcode".to_string()),
        })
}

pub struct StkPushRequest<'a> {
    pub shortcode: &'a MpesaShortcode,
    pub amount: &'a BigDecimal,
    pub phone_number: &'a str,
    pub account_reference: &'a str,
    pub description: &'a str,
    pub timestamp: &'a str,
    pub callback_url: &'a str,
}

pub fn stk_push_body(req: &StkPushRequest<'_>) -> PaymentResult<JsonValue> {
    let passkey = required(req.shortcode.lipa_passkey.as_deref(), "lipa_passkey")?;
    let transaction_type = match req.shortcode.shortcode_type {
        ShortcodeType::Till => "CustomerBuyGoodsOnline",
        _ => "CustomerPayBillOnline",
    };

    Ok(json!({
        "BusinessShortCode": req.shortcode.shortcode,
        "Password": stk_password(&req.shortcode.shortcode, passkey, req.timestamp),
        "Timestamp": req.timestamp,
        "TransactionType": transaction_type,
        "Amount": whole_amount(req.amount),
        "PartyA": req.phone_number,
        "PartyB": req.shortcode.shortcode,
        "PhoneNumber": req.phone_number,
        "CallBackURL": req.callback_url,
        "AccountReference": req.account_reference,
        "TransactionDesc": req.description,
    }))
}

pub struct B2cPaymentRequest<'a> {
    pub shortcode: &'a MpesaShortcode,
    pub originator_conversation_id: &'a str,
    pub command_id: &'a str,
    pub amount: &'a BigDecimal,
    pub phone_number: &'a str,
    pub remarks: &'a str,
    pub occasion: &'a str,
    pub result_url: &'a str,
    pub timeout_url: &'a str,
}

pub fn b2c_payment_body(req: &B2cPaymentRequest<'_>) -> PaymentResult<JsonValue> {
    let initiator = required(req.shortcode.initiator_name.as_deref(), "initiator_name")?;
    let credential = required(
        req.shortcode.security_credential.as_deref(),
        "security_credential",
    )?;

    Ok(json!({
        "OriginatorConversationID": req.originator_conversation_id,
        "InitiatorName": initiator,
        "SecurityCredential": credential,
        "CommandID": req.command_id,
        "Amount": whole_amount(req.amount),
        "PartyA": req.shortcode.shortcode,
        "PartyB": req.phone_number,
        "Remarks": req.remarks,
        "QueueTimeOutURL": req.timeout_url,
        "ResultURL": req.result_url,
        "Occasion": req.occasion,
    }))
}

pub struct TransactionStatusRequest<'a> {
    pub shortcode: &'a MpesaShortcode,
    pub originator_conversation_id: &'a str,
    pub transaction_id: &'a str,
    pub identifier_type: &'a str,
    pub remarks: &'a str,
    pub occasion: &'a str,
    pub result_url: &'a str,
    pub timeout_url: &'a str,
}

pub fn transaction_status_body(req: &TransactionStatusRequest<'_>) -> PaymentResult<JsonValue> {
    let initiator = required(req.shortcode.initiator_name.as_deref(), "initiator_name")?;
    let credential = required(
        req.shortcode.security_credential.as_deref(),
        "security_credential",
    )?;

    Ok(json!({
        "Initiator": initiator,
        "SecurityCredential": credential,
        "CommandID": "TransactionStatusQuery",
        "TransactionID": req.transaction_id,
        "OriginatorConversationID": req.originator_conversation_id,
        "PartyA": req.shortcode.shortcode,
        "IdentifierType": req.identifier_type,
        "ResultURL": req.result_url,
        "QueueTimeOutURL": req.timeout_url,
        "Remarks": req.remarks,
        "Occasion": req.occasion,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn shortcode(kind: ShortcodeType) -> MpesaShortcode {
        MpesaShortcode {
            id: Uuid::new_v4(),
            business_id: Uuid::new_v4(),
            shortcode: "174379".to_string(),
            shortcode_type: kind,
            lipa_passkey: Some("passkey".to_string()),
            initiator_name: Some("testapi".to_string()),
            security_credential: None,
            is_active: true,
        }
    }

    #[test]
    fn callback_urls_are_built_from_base() {
        let urls = CallbackUrls::new("https://gw.example.com/");
        assert_eq!(urls.stk(), "https://gw.example.com/api/v1/c2b/stk/callback");
        let id = Uuid::nil();
        assert_eq!(
            urls.ratiba(id),
            format!("https://gw.example.com/api/v1/ratiba/callback?order_id={}", id)
        );
    }

    #[test]
    fn msisdn_normalization() {
        assert_eq!(normalize_msisdn("0708374149").unwrap(), "254708374149");
        assert_eq!(normalize_msisdn("+254708374149").unwrap(), "254708374149");
        assert_eq!(normalize_msisdn("254708374149").unwrap(), "254708374149");
        assert!(normalize_msisdn("12345").is_err());
        assert!(normalize_msisdn("07083a4149").is_err());
        assert!(normalize_msisdn("").is_err());
    }

    #[test]
    fn stk_body_uses_till_transaction_type() {
        let till = shortcode(ShortcodeType::Till);
        let amount = BigDecimal::from_str("10.00").unwrap();
        let body = stk_push_body(&StkPushRequest {
            shortcode: &till,
            amount: &amount,
            phone_number: "254708374149",
            account_reference: "INV-1",
            description: "Payment",
            timestamp: "20240101120000",
            callback_url: "https://gw/cb",
        })
        .unwrap();
        assert_eq!(body["TransactionType"], "CustomerBuyGoodsOnline");
        assert_eq!(body["Amount"], "10");
        assert_eq!(body["PartyB"], "174379");
    }

    #[test]
    fn b2c_body_requires_security_credential() {
        let code = shortcode(ShortcodeType::B2c);
        let amount = BigDecimal::from(100);
        let err = b2c_payment_body(&B2cPaymentRequest {
            shortcode: &code,
            originator_conversation_id: "oc-1",
            command_id: "BusinessPayment",
            amount: &amount,
            phone_number: "254708374149",
            remarks: "r",
            occasion: "",
            result_url: "https://gw/result",
            timeout_url: "https://gw/timeout",
        })
        .unwrap_err();
        assert!(err.to_string().contains("security_credential"));
    }
}
