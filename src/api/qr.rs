use super::common::{
    self, authorize_business, dispatch_response, invalid_payload, parse_object, respond, text,
    BusinessQuery, HistoryQuery, JsonObject,
};
use super::AppState;
use crate::error::AppError;
use crate::ledger::{LedgerKind, NewLedgerRow};
use crate::payments::requests::whole_amount;
use crate::payments::types::DarajaEndpoint;
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Response,
};
use serde_json::{json, Value as JsonValue};
use tracing::info;

pub const WRITE_SCOPE: &str = "qr:write";
pub const READ_SCOPE: &str = "qr:read";

fn required(obj: &JsonObject, keys: &[&str]) -> Result<String, AppError> {
    text(obj, keys).ok_or_else(|| invalid_payload(format!("{} is required", keys[0])))
}

/// POST /api/v1/qr/generate
///
/// Daraja answers QR generation synchronously, so the row is final once the
/// request returns.
pub async fn generate_qr_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    respond(&headers, generate(&state, &headers, &body).await)
}

async fn generate(state: &AppState, headers: &HeaderMap, body: &str) -> Result<Response, AppError> {
    let body = parse_object(body)?;
    let explicit = text(&body, &["business_id"]);
    let (_, business) = authorize_business(state, headers, WRITE_SCOPE, explicit.as_deref()).await?;
    let environment = common::environment(&body)?;

    let merchant_name = required(&body, &["MerchantName", "merchant_name"])?;
    let ref_no = required(&body, &["RefNo", "ref_no"])?;
    required(&body, &["Amount", "amount"])?;
    let amount = common::amount(&body, &["Amount", "amount"])?;
    let trx_code = required(&body, &["TrxCode", "trx_code"])?;

    let mut payload = json!({
        "MerchantName": merchant_name,
        "RefNo": ref_no,
        "Amount": whole_amount(&amount),
        "TrxCode": trx_code,
    });
    if let Some(cpi) = text(&body, &["CPI", "cpi"]) {
        payload["CPI"] = JsonValue::String(cpi);
    }
    if let Some(size) = text(&body, &["Size", "size"]) {
        payload["Size"] = JsonValue::String(size);
    }

    let mut new = NewLedgerRow::new(LedgerKind::QrCode, Some(business.id), environment);
    new.amount = Some(amount);
    new.account_reference = Some(ref_no);

    info!(
        business_id = %business.id,
        environment = %environment,
        ledger_id = %new.id,
        trx_code = %trx_code,
        "generating QR code"
    );

    let outcome = state
        .dispatcher
        .dispatch(new, DarajaEndpoint::QrCode, payload)
        .await?;

    Ok(dispatch_response(outcome, "qr_request"))
}

/// GET /api/v1/qr/history
pub async fn qr_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let result = common::list_rows(&state, &headers, READ_SCOPE, LedgerKind::QrCode, &query).await;
    respond(&headers, result)
}

/// GET /api/v1/qr/{id}
pub async fn get_qr_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<BusinessQuery>,
) -> Response {
    let result = common::read_row(
        &state,
        &headers,
        READ_SCOPE,
        LedgerKind::QrCode,
        &id,
        query.business_id.as_deref(),
        "qr_request",
    )
    .await;
    respond(&headers, result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_reports_canonical_key() {
        let body = json!({"ref_no": "INV-1", "MerchantName": ""});
        let body = body.as_object().unwrap();
        assert_eq!(required(body, &["RefNo", "ref_no"]).unwrap(), "INV-1");
        assert_eq!(
            required(body, &["MerchantName", "merchant_name"])
                .unwrap_err()
                .user_message(),
            "MerchantName is required"
        );
    }
}
