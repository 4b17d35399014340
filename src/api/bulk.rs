//! Internal bulk payout routes. B2C items are dispatched later by the bulk payout
//! worker, so creating a batch only queues them. B2B business payment batches are
//! recorded and listed but never dispatched.

use super::common::{self, invalid_payload, parse_object, respond, text};
use super::AppState;
use crate::error::AppError;
use crate::ledger::bulk::{parse_item, BulkProduct, NewBulkBatch, MAX_REFERENCE_LEN};
use crate::services::Caller;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::info;
use uuid::Uuid;

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<String>,
}

/// POST /api/v1/b2c/bulk
pub async fn create_b2c_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    respond(&headers, create(&state, BulkProduct::B2c, &body).await)
}

/// POST /api/v1/b2b/bulk
pub async fn create_b2b_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    respond(&headers, create(&state, BulkProduct::B2b, &body).await)
}

async fn create(state: &AppState, product: BulkProduct, body: &str) -> Result<Response, AppError> {
    let mut body = parse_object(body)?;

    let raw_items = match body.remove("items") {
        Some(JsonValue::Array(items)) if !items.is_empty() => items,
        _ => return Err(invalid_payload("items must be a non-empty list")),
    };

    let explicit = text(&body, &["business_id"]);
    let business = state
        .tenancy
        .resolve(&Caller::Internal, explicit.as_deref())
        .await?;
    let environment = common::environment(&body)?;

    let reference: String = text(&body, &["reference"])
        .unwrap_or_default()
        .trim()
        .chars()
        .take(MAX_REFERENCE_LEN)
        .collect();

    let items: Vec<_> = raw_items.iter().filter_map(parse_item).collect();
    if items.is_empty() {
        return Err(invalid_payload("No valid items provided"));
    }
    let skipped = raw_items.len() - items.len();

    let detail = state
        .stores
        .bulk
        .create_batch(NewBulkBatch {
            product,
            business_id: Some(business.id),
            environment,
            reference,
            meta: JsonValue::Object(body),
            items,
        })
        .await?;

    info!(
        batch_id = %detail.batch.id,
        %product,
        business_id = %business.id,
        items = detail.items.len(),
        skipped,
        "bulk batch created"
    );

    Ok((StatusCode::CREATED, Json(json!({"ok": true, "batch": detail}))).into_response())
}

/// GET /api/v1/b2c/bulk and /api/v1/b2c/bulk/list
pub async fn list_b2c_batches(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Response {
    respond(&headers, list(&state, BulkProduct::B2c, query).await)
}

/// GET /api/v1/b2b/bulk and /api/v1/b2b/bulk/list
pub async fn list_b2b_batches(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Response {
    respond(&headers, list(&state, BulkProduct::B2b, query).await)
}

async fn list(
    state: &AppState,
    product: BulkProduct,
    query: ListQuery,
) -> Result<Response, AppError> {
    let limit = common::list_limit(query.limit.as_deref(), DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT);
    let batches = state.stores.bulk.list_batches(product, limit).await?;
    Ok(Json(json!({"results": batches})).into_response())
}

/// GET /api/v1/b2c/bulk/{id}
pub async fn get_b2c_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    respond(&headers, batch_detail(&state, BulkProduct::B2c, &id).await)
}

/// GET /api/v1/b2b/bulk/{id}
pub async fn get_b2b_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    respond(&headers, batch_detail(&state, BulkProduct::B2b, &id).await)
}

async fn batch_detail(
    state: &AppState,
    product: BulkProduct,
    id: &str,
) -> Result<Response, AppError> {
    let not_found = || AppError::not_found("bulk_batch", id);
    let batch_id = Uuid::parse_str(id.trim()).map_err(|_| not_found())?;
    let detail = state
        .stores
        .bulk
        .get_batch(batch_id)
        .await?
        .filter(|detail| detail.batch.product == product)
        .ok_or_else(not_found)?;
    Ok(Json(json!({"ok": true, "batch": detail})).into_response())
}
