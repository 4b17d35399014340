use super::common::{
    self, amount, authorize_business, dispatch_response, parse_object, phone, respond, text,
    BusinessQuery,
};
use super::AppState;
use crate::error::AppError;
use crate::ledger::{LedgerKind, NewLedgerRow};
use crate::logging::mask_phone_number;
use crate::payments::providers::mpesa::daraja_timestamp;
use crate::payments::requests::{stk_push_body, whole_amount, StkPushRequest};
use crate::payments::types::{DarajaEndpoint, ShortcodeType};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Response,
};
use chrono::Utc;
use serde_json::json;
use tracing::info;

pub const WRITE_SCOPE: &str = "c2b:write";
pub const READ_SCOPE: &str = "c2b:read";

/// Daraja truncates longer references
const MAX_ACCOUNT_REFERENCE_LEN: usize = 12;
const MAX_DESCRIPTION_LEN: usize = 13;

/// POST /api/v1/c2b/stk/push
pub async fn initiate_stk_push(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    respond(&headers, stk_push(&state, &headers, &body).await)
}

async fn stk_push(state: &AppState, headers: &HeaderMap, body: &str) -> Result<Response, AppError> {
    let body = parse_object(body)?;
    let explicit = text(&body, &["business_id"]);
    let (_, business) = authorize_business(state, headers, WRITE_SCOPE, explicit.as_deref()).await?;

    let environment = common::environment(&body)?;
    let phone_number = phone(&body, &["phone_number", "PhoneNumber", "phone"])?;
    let amount = amount(&body, &["amount", "Amount"])?;
    let account_reference: String = text(&body, &["account_reference", "AccountReference"])
        .unwrap_or_else(|| "Payment".to_string())
        .chars()
        .take(MAX_ACCOUNT_REFERENCE_LEN)
        .collect();
    let description: String = text(&body, &["transaction_desc", "TransactionDesc"])
        .unwrap_or_else(|| "Payment".to_string())
        .chars()
        .take(MAX_DESCRIPTION_LEN)
        .collect();

    let mut new = NewLedgerRow::new(LedgerKind::StkPush, Some(business.id), environment);
    new.amount = Some(amount.clone());
    new.phone_number = Some(phone_number.clone());
    new.account_reference = Some(account_reference.clone());

    info!(
        business_id = %business.id,
        environment = %environment,
        ledger_id = %new.id,
        phone = %mask_phone_number(&phone_number),
        "initiating STK push"
    );

    let shortcode = common::active_shortcode(
        state,
        &business,
        &[ShortcodeType::Paybill, ShortcodeType::Till],
    )
    .await?;
    let fallback = json!({
        "Amount": whole_amount(&amount),
        "PhoneNumber": phone_number,
        "AccountReference": account_reference,
    });

    let outcome = match shortcode {
        None => state.dispatcher.missing_credentials(new, fallback).await?,
        Some(shortcode) => {
            let timestamp = daraja_timestamp(Utc::now());
            let callback_url = state.callback_urls.stk();
            let request = stk_push_body(&StkPushRequest {
                shortcode: &shortcode,
                amount: &amount,
                phone_number: &phone_number,
                account_reference: &account_reference,
                description: &description,
                timestamp: &timestamp,
                callback_url: &callback_url,
            });
            common::dispatch(state, new, DarajaEndpoint::StkPush, request, fallback).await?
        }
    };

    Ok(dispatch_response(outcome, "stk_request"))
}

/// GET /api/v1/c2b/stk/{id}
pub async fn get_stk_push(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<BusinessQuery>,
) -> Response {
    let result = common::read_row(
        &state,
        &headers,
        READ_SCOPE,
        LedgerKind::StkPush,
        &id,
        query.business_id.as_deref(),
        "stk_request",
    )
    .await;
    respond(&headers, result)
}
