//! Daraja webhooks. These routes carry no auth; Safaricom posts to the URLs the
//! gateway handed out when the request was made.

use super::AppState;
use crate::middleware::error::webhook_error_response;
use crate::services::CallbackKind;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{error, info, warn};

#[derive(Debug, Deserialize)]
pub struct RatibaCallbackQuery {
    pub order_id: Option<String>,
}

async fn handle(state: &AppState, kind: CallbackKind, body: &str, order_id: Option<&str>) -> Response {
    let payload: JsonValue = match serde_json::from_str(body) {
        Ok(payload @ JsonValue::Object(_)) => payload,
        Ok(_) => {
            warn!(kind = kind.as_str(), "callback body is not a JSON object");
            return webhook_error_response(StatusCode::BAD_REQUEST, "Invalid JSON");
        }
        Err(e) => {
            error!(kind = kind.as_str(), error = %e, "Invalid JSON payload");
            return webhook_error_response(StatusCode::BAD_REQUEST, "Invalid JSON");
        }
    };

    match state.correlator.handle(kind, &payload, order_id).await {
        Ok(ack) => (StatusCode::OK, Json(ack.body)).into_response(),
        Err(e) => webhook_error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// POST /api/v1/c2b/stk/callback
pub async fn stk_callback(State(state): State<AppState>, body: String) -> Response {
    handle(&state, CallbackKind::Stk, &body, None).await
}

/// POST /api/v1/c2b/validation
///
/// Every C2B payment is accepted; nothing is recorded until confirmation.
pub async fn c2b_validation(body: String) -> Response {
    info!(bytes = body.len(), "C2B validation request accepted");
    (
        StatusCode::OK,
        Json(json!({"ResultCode": 0, "ResultDesc": "Accepted"})),
    )
        .into_response()
}

/// POST /api/v1/c2b/confirmation
pub async fn c2b_confirmation(State(state): State<AppState>, body: String) -> Response {
    handle(&state, CallbackKind::C2bConfirmation, &body, None).await
}

/// POST /api/v1/b2c/callback/result
pub async fn b2c_result(State(state): State<AppState>, body: String) -> Response {
    handle(&state, CallbackKind::B2cResult, &body, None).await
}

/// POST /api/v1/b2c/callback/timeout
pub async fn b2c_timeout(State(state): State<AppState>, body: String) -> Response {
    handle(&state, CallbackKind::B2cTimeout, &body, None).await
}

/// POST /api/v1/b2b/ussd/callback
pub async fn b2b_ussd_result(State(state): State<AppState>, body: String) -> Response {
    handle(&state, CallbackKind::B2bUssd, &body, None).await
}

/// POST /api/v1/mpesa/transaction-status/result
pub async fn transaction_status_result(State(state): State<AppState>, body: String) -> Response {
    handle(&state, CallbackKind::TransactionStatusResult, &body, None).await
}

/// POST /api/v1/mpesa/transaction-status/timeout
pub async fn transaction_status_timeout(State(state): State<AppState>, body: String) -> Response {
    handle(&state, CallbackKind::TransactionStatusTimeout, &body, None).await
}

/// POST /api/v1/ratiba/callback
pub async fn ratiba_callback(
    State(state): State<AppState>,
    Query(query): Query<RatibaCallbackQuery>,
    body: String,
) -> Response {
    handle(&state, CallbackKind::Ratiba, &body, query.order_id.as_deref()).await
}
