use super::common::{
    self, amount, authorize_business, dispatch_response, invalid_payload, parse_object, phone,
    respond, text, BusinessQuery, HistoryQuery,
};
use super::AppState;
use crate::error::AppError;
use crate::ledger::{LedgerKind, NewLedgerRow};
use crate::payments::requests::{b2c_payment_body, whole_amount, B2cPaymentRequest};
use crate::payments::types::{DarajaEndpoint, ShortcodeType};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Response,
};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

pub const WRITE_SCOPE: &str = "b2c:write";
pub const READ_SCOPE: &str = "b2c:read";

pub const COMMAND_IDS: [&str; 3] = ["BusinessPayment", "SalaryPayment", "PromotionPayment"];

/// POST /api/v1/b2c/single
pub async fn initiate_b2c_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    respond(&headers, b2c_payment(&state, &headers, &body).await)
}

async fn b2c_payment(
    state: &AppState,
    headers: &HeaderMap,
    body: &str,
) -> Result<Response, AppError> {
    let body = parse_object(body)?;
    let explicit = text(&body, &["business_id"]);
    let (_, business) = authorize_business(state, headers, WRITE_SCOPE, explicit.as_deref()).await?;

    let environment = common::environment(&body)?;
    let phone_number = phone(&body, &["phone_number", "PartyB", "recipient"])?;
    let amount = amount(&body, &["amount", "Amount"])?;
    let command_id = text(&body, &["command_id", "CommandID"])
        .unwrap_or_else(|| COMMAND_IDS[0].to_string());
    if !COMMAND_IDS.contains(&command_id.as_str()) {
        return Err(invalid_payload(format!(
            "command_id must be one of {}",
            COMMAND_IDS.join(", ")
        )));
    }
    let remarks = text(&body, &["remarks", "Remarks"]).unwrap_or_else(|| "Payment".to_string());
    let occasion = text(&body, &["occasion", "Occasion"]).unwrap_or_default();
    let reference = text(&body, &["reference", "account_reference"]);

    let originator_conversation_id = Uuid::new_v4().to_string();
    let mut new = NewLedgerRow::new(LedgerKind::B2cPayment, Some(business.id), environment);
    new.amount = Some(amount.clone());
    new.phone_number = Some(phone_number.clone());
    new.account_reference = reference;
    new.correlation.originator_conversation_id = Some(originator_conversation_id.clone());

    info!(
        business_id = %business.id,
        environment = %environment,
        ledger_id = %new.id,
        command_id = %command_id,
        "initiating B2C payment"
    );

    let shortcode = common::active_shortcode(state, &business, &[ShortcodeType::B2c]).await?;
    let fallback = json!({
        "CommandID": command_id,
        "Amount": whole_amount(&amount),
        "PartyB": phone_number,
        "Remarks": remarks,
    });

    let outcome = match shortcode {
        None => state.dispatcher.missing_credentials(new, fallback).await?,
        Some(shortcode) => {
            let result_url = state.callback_urls.b2c_result();
            let timeout_url = state.callback_urls.b2c_timeout();
            let request = b2c_payment_body(&B2cPaymentRequest {
                shortcode: &shortcode,
                originator_conversation_id: &originator_conversation_id,
                command_id: &command_id,
                amount: &amount,
                phone_number: &phone_number,
                remarks: &remarks,
                occasion: &occasion,
                result_url: &result_url,
                timeout_url: &timeout_url,
            });
            common::dispatch(state, new, DarajaEndpoint::B2cPayment, request, fallback).await?
        }
    };

    Ok(dispatch_response(outcome, "b2c_request"))
}

/// GET /api/v1/b2c/single/list
pub async fn list_b2c_payments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let result =
        common::list_rows(&state, &headers, READ_SCOPE, LedgerKind::B2cPayment, &query).await;
    respond(&headers, result)
}

/// GET /api/v1/b2c/single/{id}
pub async fn get_b2c_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<BusinessQuery>,
) -> Response {
    let result = common::read_row(
        &state,
        &headers,
        READ_SCOPE,
        LedgerKind::B2cPayment,
        &id,
        query.business_id.as_deref(),
        "b2c_request",
    )
    .await;
    respond(&headers, result)
}
