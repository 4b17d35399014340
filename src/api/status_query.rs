use super::common::{
    self, authorize_business, dispatch_response, parse_object, respond, text, BusinessQuery,
};
use super::AppState;
use crate::error::AppError;
use crate::ledger::{LedgerKind, NewLedgerRow};
use crate::payments::requests::{transaction_status_body, TransactionStatusRequest};
use crate::payments::types::{DarajaEndpoint, ShortcodeType};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Response,
};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

pub const WRITE_SCOPE: &str = "transaction_status:write";
pub const READ_SCOPE: &str = "transaction_status:read";

/// Shortcode identifier type
const DEFAULT_IDENTIFIER_TYPE: &str = "4";

/// POST /api/v1/mpesa/transaction-status
pub async fn query_transaction_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    respond(&headers, transaction_status(&state, &headers, &body).await)
}

async fn transaction_status(
    state: &AppState,
    headers: &HeaderMap,
    body: &str,
) -> Result<Response, AppError> {
    let body = parse_object(body)?;
    let explicit = text(&body, &["business_id"]);
    let (_, business) = authorize_business(state, headers, WRITE_SCOPE, explicit.as_deref()).await?;

    let environment = common::environment(&body)?;
    let transaction_id = common::required_text(&body, &["transaction_id", "TransactionID"])?;
    let identifier_type = text(&body, &["identifier_type", "IdentifierType"])
        .unwrap_or_else(|| DEFAULT_IDENTIFIER_TYPE.to_string());
    let remarks = text(&body, &["remarks", "Remarks"])
        .unwrap_or_else(|| "Transaction status query".to_string());
    let occasion = text(&body, &["occasion", "Occasion"]).unwrap_or_default();

    let originator_conversation_id = Uuid::new_v4().to_string();
    let mut new = NewLedgerRow::new(LedgerKind::TransactionStatus, Some(business.id), environment);
    new.transaction_id = Some(transaction_id.clone());
    new.correlation.originator_conversation_id = Some(originator_conversation_id.clone());

    info!(
        business_id = %business.id,
        environment = %environment,
        ledger_id = %new.id,
        transaction_id = %transaction_id,
        "querying transaction status"
    );

    let shortcode = common::active_shortcode(
        state,
        &business,
        &[
            ShortcodeType::B2c,
            ShortcodeType::Paybill,
            ShortcodeType::B2b,
            ShortcodeType::Till,
        ],
    )
    .await?;
    let fallback = json!({
        "TransactionID": transaction_id,
        "IdentifierType": identifier_type,
    });

    let outcome = match shortcode {
        None => state.dispatcher.missing_credentials(new, fallback).await?,
        Some(shortcode) => {
            let result_url = state.callback_urls.transaction_status_result();
            let timeout_url = state.callback_urls.transaction_status_timeout();
            let request = transaction_status_body(&TransactionStatusRequest {
                shortcode: &shortcode,
                originator_conversation_id: &originator_conversation_id,
                transaction_id: &transaction_id,
                identifier_type: &identifier_type,
                remarks: &remarks,
                occasion: &occasion,
                result_url: &result_url,
                timeout_url: &timeout_url,
            });
            common::dispatch(state, new, DarajaEndpoint::TransactionStatus, request, fallback)
                .await?
        }
    };

    Ok(dispatch_response(outcome, "status_query"))
}

/// GET /api/v1/mpesa/transaction-status/{id}
pub async fn get_transaction_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<BusinessQuery>,
) -> Response {
    let result = common::read_row(
        &state,
        &headers,
        READ_SCOPE,
        LedgerKind::TransactionStatus,
        &id,
        query.business_id.as_deref(),
        "status_query",
    )
    .await;
    respond(&headers, result)
}
