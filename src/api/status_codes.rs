use super::common::respond;
use super::AppState;
use crate::auth::authorize_any;
use crate::error::AppError;
use crate::status_codes::export::render_markdown;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;

/// GET /api/v1/status-codes
///
/// Open to any valid integrator token and to internal callers.
pub async fn list_status_codes(State(state): State<AppState>, headers: HeaderMap) -> Response {
    respond(&headers, list(&state, &headers).await)
}

async fn list(state: &AppState, headers: &HeaderMap) -> Result<Response, AppError> {
    authorize_any(
        headers,
        state.stores.tokens.as_ref(),
        state.internal_api_key.as_deref(),
    )
    .await?;
    let rows = state.registry.list().await?;
    Ok(Json(json!({"results": rows})).into_response())
}

/// GET /api/v1/status-codes/export.md
pub async fn export_status_codes(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let result = state
        .registry
        .list()
        .await
        .map(|rows| {
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
                render_markdown(&rows, Utc::now()),
            )
                .into_response()
        })
        .map_err(AppError::from);
    respond(&headers, result)
}
