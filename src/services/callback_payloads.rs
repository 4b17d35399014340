//! Typed extraction of Daraja callback bodies.
//!
//! Each callback kind has exactly one extraction function. Key spellings vary between
//! Daraja products and API versions; those variants are tolerated here and nowhere else.

use crate::ledger::{CorrelationField, CorrelationIds, CorrelationKey};
use crate::status_codes::code_from_json;
use bigdecimal::BigDecimal;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("Invalid JSON")]
    NotAnObject,

    #[error("missing correlation id")]
    MissingCorrelationId,
}

/// Everything a callback tells us, independent of its wire shape
#[derive(Debug, Clone, Default)]
pub struct ExtractedCallback {
    /// Lookup keys, most specific first
    pub keys: Vec<CorrelationKey>,
    /// Identifier recorded in the audit log
    pub correlation_id: Option<String>,
    pub result_code: Option<String>,
    pub result_desc: Option<String>,
    pub transaction_id: Option<String>,
    pub amount: Option<BigDecimal>,
    pub phone_number: Option<String>,
    pub correlation: CorrelationIds,
}

/// Fields of a C2B confirmation
#[derive(Debug, Clone)]
pub struct C2bConfirmation {
    pub transaction_id: String,
    pub amount: Option<BigDecimal>,
    pub phone_number: Option<String>,
    pub account_reference: Option<String>,
    pub business_short_code: Option<String>,
    pub transaction_time: Option<String>,
}

fn object(payload: &JsonValue) -> Result<&Map<String, JsonValue>, PayloadError> {
    payload.as_object().ok_or(PayloadError::NotAnObject)
}

/// First non-empty value among `keys`, stringified
fn first(obj: &Map<String, JsonValue>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| code_from_json(obj.get(*k)))
}

fn decimal(value: Option<String>) -> Option<BigDecimal> {
    value.and_then(|v| BigDecimal::from_str(v.trim()).ok())
}

/// Flatten `[{name_key: .., value_key: ..}, ..]` into a map
fn name_values(
    list: Option<&JsonValue>,
    name_keys: &[&str],
    value_keys: &[&str],
) -> HashMap<String, String> {
    let Some(items) = list.and_then(|v| v.as_array()) else {
        return HashMap::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let name = first(obj, name_keys)?;
            let value = first(obj, value_keys)?;
            Some((name, value))
        })
        .collect()
}

fn push_key(keys: &mut Vec<CorrelationKey>, field: CorrelationField, value: &Option<String>) {
    if let Some(value) = value {
        keys.push(CorrelationKey::field(field, value.clone()));
    }
}

/// STK push result. The body is either `{"Body": {"stkCallback": {..}}}` or the inner
/// object itself.
pub fn extract_stk(payload: &JsonValue) -> Result<ExtractedCallback, PayloadError> {
    let outer = object(payload)?;
    let inner = outer
        .get("Body")
        .and_then(|b| b.get("stkCallback"))
        .and_then(|c| c.as_object())
        .unwrap_or(outer);

    let checkout = first(inner, &["CheckoutRequestID", "CheckoutRequestId", "checkoutRequestID"]);
    let merchant = first(inner, &["MerchantRequestID", "MerchantRequestId", "merchantRequestID"]);
    if checkout.is_none() && merchant.is_none() {
        return Err(PayloadError::MissingCorrelationId);
    }

    let metadata = name_values(
        inner.get("CallbackMetadata").and_then(|m| m.get("Item")),
        &["Name"],
        &["Value"],
    );

    let mut keys = Vec::new();
    push_key(&mut keys, CorrelationField::CheckoutRequestId, &checkout);
    push_key(&mut keys, CorrelationField::MerchantRequestId, &merchant);

    Ok(ExtractedCallback {
        keys,
        correlation_id: checkout.clone().or_else(|| merchant.clone()),
        result_code: first(inner, &["ResultCode", "resultCode"]),
        result_desc: first(inner, &["ResultDesc", "resultDesc"]),
        transaction_id: metadata.get("MpesaReceiptNumber").cloned(),
        amount: decimal(metadata.get("Amount").cloned()),
        phone_number: metadata.get("PhoneNumber").cloned(),
        correlation: CorrelationIds {
            checkout_request_id: checkout,
            merchant_request_id: merchant,
            ..Default::default()
        },
    })
}

/// The `Result` object of B2C / transaction-status callbacks, or the body itself
fn result_object(outer: &Map<String, JsonValue>) -> &Map<String, JsonValue> {
    outer
        .get("Result")
        .or_else(|| outer.get("result"))
        .and_then(|r| r.as_object())
        .unwrap_or(outer)
}

fn result_parameters(result: &Map<String, JsonValue>) -> HashMap<String, String> {
    let list = result
        .get("ResultParameters")
        .and_then(|p| p.get("ResultParameter"));
    // A single parameter sometimes arrives as an object instead of a list
    match list {
        Some(single @ JsonValue::Object(_)) => {
            let wrapped = JsonValue::Array(vec![single.clone()]);
            name_values(Some(&wrapped), &["Key"], &["Value"])
        }
        other => name_values(other, &["Key"], &["Value"]),
    }
}

fn conversation_ids(
    outer: &Map<String, JsonValue>,
    result: &Map<String, JsonValue>,
) -> (Option<String>, Option<String>) {
    const ORIGINATOR: [&str; 3] = [
        "OriginatorConversationID",
        "OriginatorConversationId",
        "originatorConversationID",
    ];
    const CONVERSATION: [&str; 3] = ["ConversationID", "ConversationId", "conversationID"];

    (
        first(result, &ORIGINATOR).or_else(|| first(outer, &ORIGINATOR)),
        first(result, &CONVERSATION).or_else(|| first(outer, &CONVERSATION)),
    )
}

fn conversation_callback(
    payload: &JsonValue,
) -> Result<(ExtractedCallback, HashMap<String, String>, Option<String>), PayloadError> {
    let outer = object(payload)?;
    let result = result_object(outer);

    let (originator, conversation) = conversation_ids(outer, result);
    if originator.is_none() && conversation.is_none() {
        return Err(PayloadError::MissingCorrelationId);
    }

    let mut keys = Vec::new();
    push_key(&mut keys, CorrelationField::OriginatorConversationId, &originator);
    push_key(&mut keys, CorrelationField::ConversationId, &conversation);

    let params = result_parameters(result);
    let direct_transaction = first(result, &["TransactionID", "TransactionId", "transactionID"]);

    let extracted = ExtractedCallback {
        keys,
        correlation_id: originator.clone().or_else(|| conversation.clone()),
        result_code: first(result, &["ResultCode", "resultCode"]),
        result_desc: first(result, &["ResultDesc", "resultDesc"]),
        transaction_id: None,
        amount: None,
        phone_number: None,
        correlation: CorrelationIds {
            originator_conversation_id: originator,
            conversation_id: conversation,
            ..Default::default()
        },
    };
    Ok((extracted, params, direct_transaction))
}

/// B2C result and queue-timeout callbacks
pub fn extract_b2c_result(payload: &JsonValue) -> Result<ExtractedCallback, PayloadError> {
    let (mut extracted, params, direct_transaction) = conversation_callback(payload)?;

    extracted.transaction_id = direct_transaction
        .or_else(|| params.get("TransactionReceipt").cloned());
    extracted.amount = decimal(params.get("TransactionAmount").cloned());
    // "254708374149 - John Doe"
    extracted.phone_number = params
        .get("ReceiverPartyPublicName")
        .and_then(|v| v.split(" - ").next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    Ok(extracted)
}

/// Transaction-status result and timeout callbacks
pub fn extract_transaction_status(payload: &JsonValue) -> Result<ExtractedCallback, PayloadError> {
    let (mut extracted, params, direct_transaction) = conversation_callback(payload)?;

    extracted.transaction_id = direct_transaction
        .or_else(|| params.get("ReceiptNo").cloned())
        .or_else(|| params.get("TransactionID").cloned());
    extracted.amount = decimal(params.get("Amount").cloned());

    Ok(extracted)
}

/// B2B USSD push result
pub fn extract_b2b_ussd(payload: &JsonValue) -> Result<ExtractedCallback, PayloadError> {
    let obj = object(payload)?;

    let request_ref = first(obj, &["requestId", "RequestRefID", "requestRefID"])
        .ok_or(PayloadError::MissingCorrelationId)?;
    let conversation = first(obj, &["conversationID", "ConversationID"]);

    Ok(ExtractedCallback {
        keys: vec![CorrelationKey::field(
            CorrelationField::RequestRefId,
            request_ref.clone(),
        )],
        correlation_id: Some(request_ref.clone()),
        result_code: first(obj, &["resultCode", "ResultCode"]),
        result_desc: first(obj, &["resultDesc", "ResultDesc"]),
        transaction_id: first(obj, &["transactionId", "TransactionID"]),
        amount: decimal(first(obj, &["amount", "Amount"])),
        phone_number: None,
        correlation: CorrelationIds {
            request_ref_id: Some(request_ref),
            conversation_id: conversation,
            ..Default::default()
        },
    })
}

/// Ratiba standing-order callback. `order_id` is the row id carried on the callback
/// URL; `AccountReference` is the fallback key.
pub fn extract_ratiba(
    payload: &JsonValue,
    order_id: Option<&str>,
) -> Result<ExtractedCallback, PayloadError> {
    let obj = object(payload)?;

    let header = obj
        .get("ResponseHeader")
        .and_then(|h| h.as_object());
    let data = name_values(
        obj.get("ResponseBody").and_then(|b| b.get("responseData")),
        &["name", "Name"],
        &["value", "Value"],
    );

    let order_id = order_id
        .map(str::trim)
        .and_then(|raw| Uuid::parse_str(raw).ok());
    let account_reference = first(obj, &["AccountReference", "accountReference"])
        .or_else(|| data.get("AccountReference").cloned());

    let mut keys = Vec::new();
    if let Some(id) = order_id {
        keys.push(CorrelationKey::Id(id));
    }
    push_key(&mut keys, CorrelationField::AccountReference, &account_reference);
    if keys.is_empty() {
        return Err(PayloadError::MissingCorrelationId);
    }

    let header_field = |names: &[&str]| header.and_then(|h| first(h, names));
    let result_code = first(obj, &["ResultCode", "resultCode", "responseCode"])
        .or_else(|| header_field(&["responseCode", "ResponseCode"]))
        .or_else(|| data.get("responseCode").cloned());
    let result_desc = first(obj, &["ResultDesc", "resultDesc", "responseDescription"])
        .or_else(|| header_field(&["responseDescription", "ResultDesc"]))
        .or_else(|| data.get("responseDescription").cloned());

    Ok(ExtractedCallback {
        keys,
        correlation_id: order_id
            .map(|id| id.to_string())
            .or_else(|| account_reference.clone()),
        result_code,
        result_desc,
        transaction_id: first(obj, &["TransactionID", "TransactionId"])
            .or_else(|| data.get("TransactionID").cloned()),
        amount: decimal(first(obj, &["Amount"]).or_else(|| data.get("Amount").cloned())),
        phone_number: first(obj, &["Msisdn", "MSISDN"]).or_else(|| data.get("Msisdn").cloned()),
        correlation: CorrelationIds::default(),
    })
}

/// C2B confirmation pushed by Safaricom after a paybill/till payment
pub fn extract_c2b_confirmation(payload: &JsonValue) -> Result<C2bConfirmation, PayloadError> {
    let obj = object(payload)?;
    let transaction_id =
        first(obj, &["TransID", "TransId"]).ok_or(PayloadError::MissingCorrelationId)?;

    Ok(C2bConfirmation {
        transaction_id,
        amount: decimal(first(obj, &["TransAmount"])),
        phone_number: first(obj, &["MSISDN", "Msisdn"]),
        account_reference: first(obj, &["BillRefNumber"]),
        business_short_code: first(obj, &["BusinessShortCode"]),
        transaction_time: first(obj, &["TransTime"]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stk_wrapped_body_and_metadata() {
        let payload = json!({
            "Body": {"stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_191220191020363925",
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {"Item": [
                    {"Name": "Amount", "Value": 1.00},
                    {"Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV"},
                    {"Name": "TransactionDate", "Value": 20191219102115u64},
                    {"Name": "PhoneNumber", "Value": 254708374149u64}
                ]}
            }}
        });

        let extracted = extract_stk(&payload).unwrap();
        assert_eq!(extracted.correlation_id.as_deref(), Some("ws_CO_191220191020363925"));
        assert_eq!(extracted.keys.len(), 2);
        assert_eq!(extracted.result_code.as_deref(), Some("0"));
        assert_eq!(extracted.transaction_id.as_deref(), Some("NLJ7RT61SV"));
        assert_eq!(extracted.phone_number.as_deref(), Some("254708374149"));
        assert_eq!(extracted.amount, Some(BigDecimal::from(1)));
    }

    #[test]
    fn stk_flat_body_falls_back_to_merchant_id() {
        let payload = json!({"MerchantRequestID": "m-1", "ResultCode": 1032, "ResultDesc": "Cancelled"});
        let extracted = extract_stk(&payload).unwrap();
        assert_eq!(
            extracted.keys,
            vec![CorrelationKey::field(CorrelationField::MerchantRequestId, "m-1")]
        );
        assert_eq!(extracted.result_code.as_deref(), Some("1032"));
    }

    #[test]
    fn non_object_and_missing_ids_are_rejected() {
        assert_eq!(extract_stk(&json!([1, 2])).unwrap_err(), PayloadError::NotAnObject);
        assert_eq!(
            extract_stk(&json!({"Body": {"stkCallback": {"ResultCode": 0}}})).unwrap_err(),
            PayloadError::MissingCorrelationId
        );
        assert_eq!(
            extract_b2b_ussd(&json!({"resultCode": "0"})).unwrap_err(),
            PayloadError::MissingCorrelationId
        );
        assert_eq!(
            extract_ratiba(&json!({}), Some("not-a-uuid")).unwrap_err(),
            PayloadError::MissingCorrelationId
        );
    }

    #[test]
    fn b2c_result_under_result_with_case_variants() {
        let payload = json!({"Result": {
            "ResultType": 0,
            "ResultCode": 2001,
            "ResultDesc": "The initiator information is invalid.",
            "OriginatorConversationId": "10571-7910404-1",
            "ConversationID": "AG_20191219_00004e48cf7e3533f581",
            "TransactionID": "NLJ41HAY6Q",
            "ResultParameters": {"ResultParameter": [
                {"Key": "TransactionAmount", "Value": 10},
                {"Key": "ReceiverPartyPublicName", "Value": "254708374149 - John Doe"}
            ]}
        }});

        let extracted = extract_b2c_result(&payload).unwrap();
        assert_eq!(extracted.correlation_id.as_deref(), Some("10571-7910404-1"));
        assert_eq!(extracted.keys.len(), 2);
        assert_eq!(extracted.result_code.as_deref(), Some("2001"));
        assert_eq!(extracted.transaction_id.as_deref(), Some("NLJ41HAY6Q"));
        assert_eq!(extracted.amount, Some(BigDecimal::from(10)));
        assert_eq!(extracted.phone_number.as_deref(), Some("254708374149"));
    }

    #[test]
    fn b2c_timeout_without_result_code() {
        let payload = json!({"OriginatorConversationID": "o-1"});
        let extracted = extract_b2c_result(&payload).unwrap();
        assert_eq!(extracted.result_code, None);
        assert_eq!(extracted.correlation.originator_conversation_id.as_deref(), Some("o-1"));
    }

    #[test]
    fn transaction_status_receipt_from_parameters() {
        let payload = json!({"Result": {
            "ResultCode": 0,
            "ConversationID": "AG_1",
            "ResultParameters": {"ResultParameter": {"Key": "ReceiptNo", "Value": "OEI2AK4Q16"}}
        }});
        let extracted = extract_transaction_status(&payload).unwrap();
        assert_eq!(extracted.transaction_id.as_deref(), Some("OEI2AK4Q16"));
        assert_eq!(
            extracted.keys,
            vec![CorrelationKey::field(CorrelationField::ConversationId, "AG_1")]
        );
    }

    #[test]
    fn b2b_ussd_request_ref_variants() {
        let payload = json!({
            "RequestRefID": "ref-1",
            "resultCode": "4001",
            "resultDesc": "User cancelled",
            "amount": "71.0",
            "transactionId": "RDQ01NFT1Q",
            "conversationID": "AG_2"
        });
        let extracted = extract_b2b_ussd(&payload).unwrap();
        assert_eq!(extracted.correlation_id.as_deref(), Some("ref-1"));
        assert_eq!(extracted.result_code.as_deref(), Some("4001"));
        assert_eq!(extracted.correlation.conversation_id.as_deref(), Some("AG_2"));
    }

    #[test]
    fn ratiba_prefers_order_id_then_account_reference() {
        let id = Uuid::new_v4();
        let payload = json!({
            "ResponseHeader": {"responseCode": "0", "responseDescription": "Processed"},
            "ResponseBody": {"responseData": [
                {"name": "AccountReference", "value": "ACC-9"},
                {"name": "TransactionID", "value": "SCI67"}
            ]}
        });

        let extracted = extract_ratiba(&payload, Some(&id.to_string())).unwrap();
        assert_eq!(
            extracted.keys,
            vec![
                CorrelationKey::Id(id),
                CorrelationKey::field(CorrelationField::AccountReference, "ACC-9"),
            ]
        );
        assert_eq!(extracted.result_code.as_deref(), Some("0"));
        assert_eq!(extracted.transaction_id.as_deref(), Some("SCI67"));

        let by_reference = extract_ratiba(&json!({"AccountReference": "ACC-1"}), None).unwrap();
        assert_eq!(by_reference.correlation_id.as_deref(), Some("ACC-1"));
    }

    #[test]
    fn c2b_confirmation_fields() {
        let payload = json!({
            "TransID": "RKTQDM7W6S",
            "TransTime": "20191122063845",
            "TransAmount": "10",
            "BusinessShortCode": "600638",
            "BillRefNumber": "invoice008",
            "MSISDN": "254708374149"
        });
        let confirmation = extract_c2b_confirmation(&payload).unwrap();
        assert_eq!(confirmation.transaction_id, "RKTQDM7W6S");
        assert_eq!(confirmation.amount, Some(BigDecimal::from(10)));
        assert!(extract_c2b_confirmation(&json!({"TransAmount": 1})).is_err());
    }
}
