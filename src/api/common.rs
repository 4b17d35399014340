//! Request parsing and response shapes shared by the integrator handlers

use super::AppState;
use crate::auth::{authorize, Authorized};
use crate::error::{AppError, AppErrorKind, ValidationError};
use crate::ledger::{LedgerFilter, LedgerKind, NewLedgerRow};
use crate::middleware::error::get_request_id_from_headers;
use crate::payments::error::PaymentError;
use crate::payments::requests::normalize_msisdn;
use crate::payments::types::{DarajaEndpoint, Environment, MpesaShortcode, ShortcodeType};
use crate::services::request_dispatcher::{DispatchOutcome, DispatchResult};
use crate::services::tenancy::Business;
use crate::status_codes::code_from_json;
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bigdecimal::BigDecimal;
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use std::str::FromStr;
use uuid::Uuid;

pub(crate) type JsonObject = Map<String, JsonValue>;

/// `?business_id=` on reads, for callers without a client binding
#[derive(Debug, Deserialize)]
pub struct BusinessQuery {
    pub business_id: Option<String>,
}

/// `?business_id=&limit=` on history reads
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub business_id: Option<String>,
    pub limit: Option<String>,
}

pub(crate) const DEFAULT_HISTORY_LIMIT: i64 = 50;
pub(crate) const MAX_HISTORY_LIMIT: i64 = 200;

/// Render the handler result, tagging errors with the caller's request id
pub(crate) fn respond(headers: &HeaderMap, result: Result<Response, AppError>) -> Response {
    match result {
        Ok(response) => response,
        Err(err) => match get_request_id_from_headers(headers) {
            Some(request_id) => err.with_request_id(request_id).into_response(),
            None => err.into_response(),
        },
    }
}

pub(crate) fn invalid_payload(reason: impl Into<String>) -> AppError {
    AppError::new(AppErrorKind::Validation(ValidationError::InvalidPayload {
        reason: reason.into(),
    }))
}

fn missing_field(field: &str) -> AppError {
    AppError::new(AppErrorKind::Validation(ValidationError::MissingField {
        field: field.to_string(),
    }))
}

/// Request body as a JSON object
pub(crate) fn parse_object(body: &str) -> Result<JsonObject, AppError> {
    match serde_json::from_str::<JsonValue>(body) {
        Ok(JsonValue::Object(obj)) => Ok(obj),
        Ok(_) => Err(invalid_payload("Request body must be a JSON object")),
        Err(_) => Err(invalid_payload("Invalid JSON")),
    }
}

/// First non-empty value among `keys`, stringified
pub(crate) fn text(obj: &JsonObject, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| code_from_json(obj.get(*k)).filter(|v| !v.is_empty()))
}

pub(crate) fn required_text(obj: &JsonObject, keys: &[&str]) -> Result<String, AppError> {
    text(obj, keys).ok_or_else(|| missing_field(keys[0]))
}

pub(crate) fn amount(obj: &JsonObject, keys: &[&str]) -> Result<BigDecimal, AppError> {
    let raw = required_text(obj, keys)?;
    let value = BigDecimal::from_str(&raw).map_err(|_| AppError::new(
        AppErrorKind::Validation(ValidationError::InvalidAmount {
            amount: raw.clone(),
            reason: "amount must be a number".to_string(),
        }),
    ))?;
    if value <= BigDecimal::from(0) {
        return Err(AppError::new(AppErrorKind::Validation(
            ValidationError::InvalidAmount {
                amount: raw,
                reason: "amount must be > 0".to_string(),
            },
        )));
    }
    Ok(value)
}

pub(crate) fn phone(obj: &JsonObject, keys: &[&str]) -> Result<String, AppError> {
    let raw = required_text(obj, keys)?;
    normalize_msisdn(&raw).map_err(AppError::from)
}

pub(crate) fn environment(obj: &JsonObject) -> Result<Environment, AppError> {
    let raw = text(obj, &["environment"]).unwrap_or_default();
    Environment::from_str(&raw).map_err(AppError::from)
}

/// Limit query parameter clamped to `1..=max`
pub(crate) fn list_limit(raw: Option<&str>, default: i64, max: i64) -> i64 {
    match raw.and_then(|v| v.trim().parse::<i64>().ok()) {
        Some(limit) if limit > 0 => limit.min(max),
        _ => default,
    }
}

/// Guard plus tenancy: the caller's token must carry `scope`, and the business comes
/// from `business_id` or the client binding
pub(crate) async fn authorize_business(
    state: &AppState,
    headers: &HeaderMap,
    scope: &str,
    explicit_business_id: Option<&str>,
) -> Result<(Authorized, Business), AppError> {
    let authorized = authorize(headers, state.stores.tokens.as_ref(), scope).await?;
    let business = state
        .tenancy
        .resolve(&authorized.caller, explicit_business_id)
        .await?;
    Ok((authorized, business))
}

pub(crate) async fn active_shortcode(
    state: &AppState,
    business: &Business,
    types: &[ShortcodeType],
) -> Result<Option<MpesaShortcode>, AppError> {
    Ok(state
        .dispatcher
        .credentials()
        .active_shortcode(business.id, types)
        .await?)
}

/// Dispatch `body`, or record a missing-credentials row when no body could be built
pub(crate) async fn dispatch(
    state: &AppState,
    new: NewLedgerRow,
    endpoint: DarajaEndpoint,
    body: Result<JsonValue, PaymentError>,
    fallback_payload: JsonValue,
) -> Result<DispatchOutcome, AppError> {
    let outcome = match body {
        Ok(body) => state.dispatcher.dispatch(new, endpoint, body).await?,
        Err(e) => {
            tracing::warn!(kind = %new.kind, error = %e, "shortcode not usable for request");
            state
                .dispatcher
                .missing_credentials(new, fallback_payload)
                .await?
        }
    };
    Ok(outcome)
}

/// Integrator answer for a dispatched request
pub(crate) fn dispatch_response(outcome: DispatchOutcome, key: &str) -> Response {
    let status = StatusCode::from_u16(outcome.http_status()).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = match outcome.result {
        DispatchResult::Submitted | DispatchResult::Final => {
            let mut body = json!({
                "ok": true,
                "status_code": outcome.mapped.status_code,
                "status_message": outcome.mapped.status_message,
            });
            body[key] = json!(outcome.row);
            body
        }
        DispatchResult::MissingCredentials => json!({
            "error": "Daraja credentials not configured for this business",
            "status_code": outcome.mapped.status_code,
            "status_message": outcome.mapped.status_message,
        }),
        DispatchResult::VendorError => json!({
            "error": "Safaricom API error",
            "details": outcome.details,
            "status_code": outcome.mapped.status_code,
            "status_message": outcome.mapped.status_message,
        }),
        DispatchResult::TransportError => json!({
            "error": "Failed to submit",
            "details": outcome.details,
            "status_code": outcome.mapped.status_code,
            "status_message": outcome.mapped.status_message,
        }),
    };
    (status, Json(body)).into_response()
}

/// Read one ledger row on behalf of an integrator. Rows of other businesses are
/// reported as missing.
pub(crate) async fn read_row(
    state: &AppState,
    headers: &HeaderMap,
    scope: &str,
    kind: LedgerKind,
    id: &str,
    explicit_business_id: Option<&str>,
    key: &str,
) -> Result<Response, AppError> {
    let (_, business) = authorize_business(state, headers, scope, explicit_business_id).await?;

    let not_found = || AppError::not_found(kind.as_str(), id);
    let id = Uuid::parse_str(id.trim()).map_err(|_| not_found())?;
    let row = state
        .stores
        .ledger
        .get(kind, id)
        .await?
        .filter(|row| row.business_id == Some(business.id))
        .ok_or_else(not_found)?;

    let mut body = json!({
        "ok": true,
        "status_code": row.internal_status_code,
        "status_message": row.internal_status_message,
    });
    body[key] = json!(row);
    Ok((StatusCode::OK, Json(body)).into_response())
}

/// Most recent rows of one kind belonging to the caller's business
pub(crate) async fn list_rows(
    state: &AppState,
    headers: &HeaderMap,
    scope: &str,
    kind: LedgerKind,
    query: &HistoryQuery,
) -> Result<Response, AppError> {
    let (_, business) =
        authorize_business(state, headers, scope, query.business_id.as_deref()).await?;
    let limit = list_limit(
        query.limit.as_deref(),
        DEFAULT_HISTORY_LIMIT,
        MAX_HISTORY_LIMIT,
    );

    let rows = state
        .stores
        .ledger
        .list(kind, &LedgerFilter::business(business.id), limit)
        .await?;
    Ok(Json(json!({"ok": true, "results": rows})).into_response())
}
