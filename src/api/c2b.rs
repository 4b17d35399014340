//! Internal C2B transaction listings over the confirmation ledger. Confirmations are
//! not tied to a business, so these reads sit behind the internal key.

use super::common::{self, invalid_payload, respond};
use super::AppState;
use crate::error::AppError;
use crate::ledger::{LedgerFilter, LedgerKind, LedgerStatus};
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;

const DEFAULT_LIST_LIMIT: i64 = 200;
const MAX_LIST_LIMIT: i64 = 1000;

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    /// `dd/mm/yyyy`
    pub date: Option<String>,
    pub status: Option<String>,
    pub limit: Option<String>,
}

/// GET /api/v1/c2b/transactions/all
pub async fn all_transactions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TransactionsQuery>,
) -> Response {
    let result = transactions(&state, LedgerFilter::default(), &query).await;
    respond(&headers, result)
}

/// GET /api/v1/c2b/transactions/completed
///
/// Successful confirmations unless `status=failed` is asked for, optionally
/// narrowed to one day.
pub async fn completed_transactions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TransactionsQuery>,
) -> Response {
    let result = match completed_filter(&query) {
        Ok(filter) => transactions(&state, filter, &query).await,
        Err(e) => Err(e),
    };
    respond(&headers, result)
}

fn completed_filter(query: &TransactionsQuery) -> Result<LedgerFilter, AppError> {
    let created_on = match non_empty(&query.date) {
        Some(raw) => Some(
            NaiveDate::parse_from_str(raw, "%d/%m/%Y")
                .map_err(|_| invalid_payload("Invalid date format. Use dd/mm/yyyy."))?,
        ),
        None => None,
    };

    let status = match non_empty(&query.status).map(str::to_ascii_lowercase) {
        None => LedgerStatus::Successful,
        Some(s) if s == "successful" => LedgerStatus::Successful,
        Some(s) if s == "failed" => LedgerStatus::Failed,
        Some(_) => return Err(invalid_payload("Invalid status. Use 'failed' or 'successful'.")),
    };

    Ok(LedgerFilter {
        business_id: None,
        status: Some(status),
        created_on,
    })
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

async fn transactions(
    state: &AppState,
    filter: LedgerFilter,
    query: &TransactionsQuery,
) -> Result<Response, AppError> {
    let limit = common::list_limit(query.limit.as_deref(), DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT);
    let rows = state
        .stores
        .ledger
        .list(LedgerKind::C2bPayment, &filter, limit)
        .await?;
    Ok(Json(json!({"transactions": rows})).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(date: Option<&str>, status: Option<&str>) -> TransactionsQuery {
        TransactionsQuery {
            date: date.map(str::to_string),
            status: status.map(str::to_string),
            limit: None,
        }
    }

    #[test]
    fn completed_defaults_to_successful_any_day() {
        let filter = completed_filter(&query(None, Some("  "))).unwrap();
        assert_eq!(filter.status, Some(LedgerStatus::Successful));
        assert_eq!(filter.created_on, None);
        assert_eq!(filter.business_id, None);
    }

    #[test]
    fn completed_accepts_day_and_failed() {
        let filter = completed_filter(&query(Some("05/03/2026"), Some("FAILED"))).unwrap();
        assert_eq!(filter.status, Some(LedgerStatus::Failed));
        assert_eq!(filter.created_on, NaiveDate::from_ymd_opt(2026, 3, 5));
    }

    #[test]
    fn completed_rejects_bad_filters() {
        let err = completed_filter(&query(Some("2026-03-05"), None)).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.user_message(), "Invalid date format. Use dd/mm/yyyy.");

        let err = completed_filter(&query(None, Some("pending"))).unwrap_err();
        assert_eq!(
            err.user_message(),
            "Invalid status. Use 'failed' or 'successful'."
        );
    }
}
