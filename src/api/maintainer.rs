//! Maintainer operations: businesses, their Daraja credentials and shortcodes,
//! OAuth client bindings and the callback audit log.

use super::common::{invalid_payload, parse_object, required_text, respond, text, JsonObject};
use super::AppState;
use crate::error::AppError;
use crate::ledger::audit::clamp_limit;
use crate::logging::mask_secret;
use crate::payments::types::{Environment, ShortcodeType};
use crate::services::credentials::{NewCredential, NewShortcode};
use crate::services::tenancy::{Business, BusinessStatus};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<String>,
}

fn flag(obj: &JsonObject, keys: &[&str], default: bool) -> Result<bool, AppError> {
    match keys.iter().find_map(|k| obj.get(*k)) {
        None | Some(JsonValue::Null) => Ok(default),
        Some(JsonValue::Bool(value)) => Ok(*value),
        Some(_) => Err(invalid_payload(format!("{} must be a boolean", keys[0]))),
    }
}

async fn existing_business(state: &AppState, raw_id: &str) -> Result<Business, AppError> {
    let not_found = || AppError::not_found("business", raw_id);
    let id = Uuid::parse_str(raw_id.trim()).map_err(|_| not_found())?;
    state
        .tenancy
        .store()
        .get_business(id)
        .await?
        .ok_or_else(not_found)
}

/// POST /api/v1/maintainer/businesses
pub async fn create_business(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    respond(&headers, new_business(&state, &body).await)
}

async fn new_business(state: &AppState, body: &str) -> Result<Response, AppError> {
    let body = parse_object(body)?;
    let name = required_text(&body, &["name"])?;
    let business = state.tenancy.store().create_business(name.trim()).await?;
    info!(business_id = %business.id, name = %business.name, "business created");
    Ok((
        StatusCode::CREATED,
        Json(json!({"ok": true, "business": business})),
    )
        .into_response())
}

/// PUT /api/v1/maintainer/businesses/{id}/status
pub async fn set_business_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: String,
) -> Response {
    respond(&headers, business_status(&state, &id, &body).await)
}

async fn business_status(state: &AppState, raw_id: &str, body: &str) -> Result<Response, AppError> {
    let body = parse_object(body)?;
    let status = BusinessStatus::from_str(&required_text(&body, &["status"])?)
        .map_err(|_| invalid_payload("status must be active or suspended"))?;
    let business = existing_business(state, raw_id).await?;

    let updated = state
        .tenancy
        .store()
        .set_business_status(business.id, status)
        .await?
        .ok_or_else(|| AppError::not_found("business", raw_id))?;
    info!(business_id = %updated.id, status = %updated.status, "business status changed");
    Ok(Json(json!({"ok": true, "business": updated})).into_response())
}

/// PUT /api/v1/maintainer/businesses/{id}/credentials
pub async fn upsert_credential(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: String,
) -> Response {
    respond(&headers, credential(&state, &id, &body).await)
}

async fn credential(state: &AppState, raw_id: &str, body: &str) -> Result<Response, AppError> {
    let body = parse_object(body)?;
    let business = existing_business(state, raw_id).await?;
    let environment =
        Environment::from_str(&text(&body, &["environment"]).unwrap_or_default())?;

    let credential = state
        .dispatcher
        .credentials()
        .upsert_credential(NewCredential {
            business_id: business.id,
            environment,
            consumer_key: required_text(&body, &["consumer_key"])?,
            consumer_secret: required_text(&body, &["consumer_secret"])?,
            token_url: text(&body, &["token_url"]),
        })
        .await?;

    info!(
        business_id = %business.id,
        environment = %environment,
        credential_id = %credential.id,
        consumer_key = %mask_secret(&credential.consumer_key),
        "Daraja credential replaced"
    );
    Ok(Json(json!({"ok": true, "credential": credential})).into_response())
}

/// PUT /api/v1/maintainer/businesses/{id}/shortcodes
pub async fn upsert_shortcode(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: String,
) -> Response {
    respond(&headers, shortcode(&state, &id, &body).await)
}

async fn shortcode(state: &AppState, raw_id: &str, body: &str) -> Result<Response, AppError> {
    let body = parse_object(body)?;
    let business = existing_business(state, raw_id).await?;

    let code = required_text(&body, &["shortcode"])?;
    if !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid_payload("shortcode must be numeric"));
    }
    let shortcode_type = ShortcodeType::from_str(&required_text(&body, &["shortcode_type"])?)?;

    let shortcode = state
        .dispatcher
        .credentials()
        .upsert_shortcode(NewShortcode {
            business_id: business.id,
            shortcode: code,
            shortcode_type,
            lipa_passkey: text(&body, &["lipa_passkey"]),
            initiator_name: text(&body, &["initiator_name"]),
            security_credential: text(&body, &["security_credential"]),
            set_active: flag(&body, &["is_active", "set_active"], true)?,
        })
        .await?;

    info!(
        business_id = %business.id,
        shortcode = %shortcode.shortcode,
        shortcode_type = ?shortcode.shortcode_type,
        active = shortcode.is_active,
        "shortcode saved"
    );
    Ok(Json(json!({"ok": true, "shortcode": shortcode})).into_response())
}

/// PUT /api/v1/maintainer/clients/{client_id}/binding
pub async fn rebind_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(client_id): Path<String>,
    body: String,
) -> Response {
    respond(&headers, rebind(&state, &client_id, &body).await)
}

async fn rebind(state: &AppState, client_id: &str, body: &str) -> Result<Response, AppError> {
    let body = parse_object(body)?;
    let raw = required_text(&body, &["business_id"])?;
    let business_id = Uuid::parse_str(raw.trim())
        .map_err(|_| invalid_payload("Invalid business_id"))?;

    state.tenancy.rebind(client_id, business_id).await?;
    Ok(Json(json!({
        "ok": true,
        "client_id": client_id,
        "business_id": business_id,
    }))
    .into_response())
}

/// DELETE /api/v1/maintainer/clients/{client_id}/binding
pub async fn unbind_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(client_id): Path<String>,
) -> Response {
    let result = state
        .tenancy
        .unbind(&client_id)
        .await
        .map(|removed| Json(json!({"ok": true, "removed": removed})).into_response())
        .map_err(AppError::from);
    respond(&headers, result)
}

/// GET /api/v1/maintainer/callbacks
pub async fn list_callbacks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LimitQuery>,
) -> Response {
    let limit = clamp_limit(query.limit.as_deref());
    let result = state
        .stores
        .callback_log
        .list(limit)
        .await
        .map(|entries| Json(json!({"results": entries})).into_response())
        .map_err(AppError::from);
    respond(&headers, result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_defaults_and_rejects_non_booleans() {
        let body = json!({"set_active": false, "is_active": "yes"});
        let body = body.as_object().unwrap();
        assert!(flag(body, &["missing"], true).unwrap());
        assert!(!flag(body, &["set_active"], true).unwrap());
        assert!(flag(body, &["is_active"], true).is_err());
    }
}
