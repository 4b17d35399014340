use crate::database::bulk_payout_repository::update_item_in;
use crate::database::error::DatabaseError;
use crate::database::parse_column;
use crate::ledger::bulk::item_result;
use crate::ledger::{
    CallbackUpdate, CorrelationIds, CorrelationKey, LedgerFilter, LedgerKind, LedgerRow,
    LedgerStore, SettleOutcome, SubmissionUpdate,
};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::debug;
use uuid::Uuid;

const COLUMNS: &str = "id, business_id, environment, checkout_request_id, merchant_request_id, \
    originator_conversation_id, conversation_id, request_ref_id, account_reference, status, \
    transaction_id, amount, phone_number, result_code, result_desc, internal_status_code, \
    internal_status_message, request_payload, response_payload, error_payload, callback_payload, \
    bulk_item_id, resolved_at, created_at, updated_at";

/// Non-terminal rows first, then the most recent
const PREFERRED_ORDER: &str =
    "ORDER BY (status NOT IN ('queued', 'submitted')) ASC, created_at DESC LIMIT 1";

#[derive(Debug, FromRow)]
struct LedgerRecord {
    id: Uuid,
    business_id: Option<Uuid>,
    environment: String,
    checkout_request_id: Option<String>,
    merchant_request_id: Option<String>,
    originator_conversation_id: Option<String>,
    conversation_id: Option<String>,
    request_ref_id: Option<String>,
    account_reference: Option<String>,
    status: String,
    transaction_id: Option<String>,
    amount: Option<BigDecimal>,
    phone_number: Option<String>,
    result_code: Option<String>,
    result_desc: Option<String>,
    internal_status_code: Option<i64>,
    internal_status_message: Option<String>,
    request_payload: JsonValue,
    response_payload: Option<JsonValue>,
    error_payload: Option<JsonValue>,
    callback_payload: Option<JsonValue>,
    bulk_item_id: Option<Uuid>,
    resolved_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl LedgerRecord {
    fn into_row(self, kind: LedgerKind) -> Result<LedgerRow, DatabaseError> {
        Ok(LedgerRow {
            id: self.id,
            kind,
            business_id: self.business_id,
            environment: parse_column("environment", &self.environment)?,
            correlation: CorrelationIds {
                checkout_request_id: self.checkout_request_id,
                merchant_request_id: self.merchant_request_id,
                originator_conversation_id: self.originator_conversation_id,
                conversation_id: self.conversation_id,
                request_ref_id: self.request_ref_id,
            },
            account_reference: self.account_reference,
            status: parse_column("status", &self.status)?,
            transaction_id: self.transaction_id,
            amount: self.amount,
            phone_number: self.phone_number,
            result_code: self.result_code,
            result_desc: self.result_desc,
            internal_status_code: self.internal_status_code,
            internal_status_message: self.internal_status_message,
            request_payload: self.request_payload,
            response_payload: self.response_payload,
            error_payload: self.error_payload,
            callback_payload: self.callback_payload,
            bulk_item_id: self.bulk_item_id,
            resolved_at: self.resolved_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Postgres ledger over the per-product request tables.
///
/// Table and column names are interpolated from [`LedgerKind::table`] and
/// [`crate::ledger::CorrelationField::column`], never from input.
pub struct LedgerRepository {
    pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn select_listing(kind: LedgerKind) -> String {
    format!(
        "SELECT {} FROM {}
         WHERE ($1::uuid IS NULL OR business_id = $1)
           AND ($2::text IS NULL OR status = $2)
           AND ($3::date IS NULL OR (created_at AT TIME ZONE 'UTC')::date = $3)
         ORDER BY created_at DESC LIMIT $4",
        COLUMNS,
        kind.table()
    )
}

fn select_by_key(kind: LedgerKind, key: &CorrelationKey, lock: bool) -> String {
    let filter = match key {
        CorrelationKey::Id(_) => "id = $1".to_string(),
        CorrelationKey::Field { field, .. } => format!("{} = $1", field.column()),
    };
    format!(
        "SELECT {} FROM {} WHERE {} {}{}",
        COLUMNS,
        kind.table(),
        filter,
        PREFERRED_ORDER,
        if lock { " FOR UPDATE" } else { "" }
    )
}

async fn fetch_by_key(
    conn: &mut PgConnection,
    kind: LedgerKind,
    key: &CorrelationKey,
    lock: bool,
) -> Result<Option<LedgerRow>, DatabaseError> {
    let sql = select_by_key(kind, key, lock);
    let query = sqlx::query_as::<_, LedgerRecord>(&sql);
    let query = match key {
        CorrelationKey::Id(id) => query.bind(*id),
        CorrelationKey::Field { value, .. } => query.bind(value.clone()),
    };

    query
        .fetch_optional(conn)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .map(|r| r.into_row(kind))
        .transpose()
}

async fn fetch_first(
    conn: &mut PgConnection,
    kind: LedgerKind,
    keys: &[CorrelationKey],
    lock: bool,
) -> Result<Option<LedgerRow>, DatabaseError> {
    for key in keys {
        if let Some(row) = fetch_by_key(conn, kind, key, lock).await? {
            return Ok(Some(row));
        }
    }
    Ok(None)
}

/// Write back every mutable column of `row`
async fn write_row(conn: &mut PgConnection, row: &LedgerRow) -> Result<(), DatabaseError> {
    sqlx::query(&format!(
        "UPDATE {} SET
            checkout_request_id = $2, merchant_request_id = $3, originator_conversation_id = $4,
            conversation_id = $5, request_ref_id = $6, status = $7, transaction_id = $8,
            amount = $9, phone_number = $10, result_code = $11, result_desc = $12,
            internal_status_code = $13, internal_status_message = $14, response_payload = $15,
            error_payload = $16, callback_payload = $17, resolved_at = $18, updated_at = $19
         WHERE id = $1",
        row.kind.table()
    ))
    .bind(row.id)
    .bind(&row.correlation.checkout_request_id)
    .bind(&row.correlation.merchant_request_id)
    .bind(&row.correlation.originator_conversation_id)
    .bind(&row.correlation.conversation_id)
    .bind(&row.correlation.request_ref_id)
    .bind(row.status.as_str())
    .bind(&row.transaction_id)
    .bind(&row.amount)
    .bind(&row.phone_number)
    .bind(&row.result_code)
    .bind(&row.result_desc)
    .bind(row.internal_status_code)
    .bind(&row.internal_status_message)
    .bind(&row.response_payload)
    .bind(&row.error_payload)
    .bind(&row.callback_payload)
    .bind(row.resolved_at)
    .bind(row.updated_at)
    .execute(conn)
    .await
    .map_err(DatabaseError::from_sqlx)?;

    Ok(())
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    async fn insert(&self, row: LedgerRow) -> Result<LedgerRow, DatabaseError> {
        let kind = row.kind;
        let record = sqlx::query_as::<_, LedgerRecord>(&format!(
            "INSERT INTO {} ({cols})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                     $18, $19, $20, $21, $22, $23, $24, $25)
             RETURNING {cols}",
            kind.table(),
            cols = COLUMNS
        ))
        .bind(row.id)
        .bind(row.business_id)
        .bind(row.environment.as_str())
        .bind(&row.correlation.checkout_request_id)
        .bind(&row.correlation.merchant_request_id)
        .bind(&row.correlation.originator_conversation_id)
        .bind(&row.correlation.conversation_id)
        .bind(&row.correlation.request_ref_id)
        .bind(&row.account_reference)
        .bind(row.status.as_str())
        .bind(&row.transaction_id)
        .bind(&row.amount)
        .bind(&row.phone_number)
        .bind(&row.result_code)
        .bind(&row.result_desc)
        .bind(row.internal_status_code)
        .bind(&row.internal_status_message)
        .bind(&row.request_payload)
        .bind(&row.response_payload)
        .bind(&row.error_payload)
        .bind(&row.callback_payload)
        .bind(row.bulk_item_id)
        .bind(row.resolved_at)
        .bind(row.created_at)
        .bind(row.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        record.into_row(kind)
    }

    async fn get(&self, kind: LedgerKind, id: Uuid) -> Result<Option<LedgerRow>, DatabaseError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from_sqlx)?;
        fetch_by_key(&mut conn, kind, &CorrelationKey::Id(id), false).await
    }

    async fn list(
        &self,
        kind: LedgerKind,
        filter: &LedgerFilter,
        limit: i64,
    ) -> Result<Vec<LedgerRow>, DatabaseError> {
        sqlx::query_as::<_, LedgerRecord>(&select_listing(kind))
            .bind(filter.business_id)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.created_on)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .into_iter()
            .map(|r| r.into_row(kind))
            .collect()
    }

    async fn find(
        &self,
        kind: LedgerKind,
        keys: &[CorrelationKey],
    ) -> Result<Option<LedgerRow>, DatabaseError> {
        let mut conn = self.pool.acquire().await.map_err(DatabaseError::from_sqlx)?;
        fetch_first(&mut conn, kind, keys, false).await
    }

    async fn record_submission(
        &self,
        kind: LedgerKind,
        id: Uuid,
        update: SubmissionUpdate,
    ) -> Result<Option<LedgerRow>, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let Some(mut row) = fetch_by_key(&mut tx, kind, &CorrelationKey::Id(id), true).await?
        else {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(None);
        };

        if !row.apply_submission(&update) {
            debug!(
                kind = %kind,
                ledger_id = %id,
                status = %row.status,
                "late submission on terminal row, keeping status"
            );
        }
        write_row(&mut tx, &row).await?;
        tx.commit().await.map_err(DatabaseError::from_sqlx)?;

        Ok(Some(row))
    }

    async fn settle(
        &self,
        kind: LedgerKind,
        keys: &[CorrelationKey],
        update: CallbackUpdate,
    ) -> Result<SettleOutcome, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let Some(mut row) = fetch_first(&mut tx, kind, keys, true).await? else {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(SettleOutcome::Unmatched);
        };

        if !row.apply_callback(&update) {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(SettleOutcome::IgnoredTerminal(row));
        }

        write_row(&mut tx, &row).await?;

        if let Some(item_id) = row.bulk_item_id {
            let result = item_result(
                row.status,
                row.id,
                row.internal_status_code,
                row.internal_status_message.as_deref(),
                row.result_code.as_deref(),
                row.result_desc.as_deref(),
                row.transaction_id.as_deref(),
            );
            update_item_in(&mut tx, item_id, row.status, &result).await?;
        }

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(SettleOutcome::Applied(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::CorrelationField;

    #[test]
    fn locked_lookup_prefers_open_rows() {
        let sql = select_by_key(
            LedgerKind::StkPush,
            &CorrelationKey::field(CorrelationField::CheckoutRequestId, "ws_CO_1"),
            true,
        );
        assert!(sql.contains("FROM stk_push_requests WHERE checkout_request_id = $1"));
        assert!(sql.contains("ORDER BY (status NOT IN ('queued', 'submitted')) ASC"));
        assert!(sql.ends_with("FOR UPDATE"));
    }

    #[test]
    fn listing_filters_are_optional() {
        let sql = select_listing(LedgerKind::QrCode);
        assert!(sql.contains("FROM qr_code_requests"));
        assert!(sql.contains("($1::uuid IS NULL OR business_id = $1)"));
        assert!(sql.contains("($2::text IS NULL OR status = $2)"));
        assert!(sql.contains("($3::date IS NULL OR (created_at AT TIME ZONE 'UTC')::date = $3)"));
        assert!(sql.ends_with("ORDER BY created_at DESC LIMIT $4"));
    }

    #[test]
    fn id_lookup_targets_kind_table() {
        let sql = select_by_key(
            LedgerKind::RatibaOrder,
            &CorrelationKey::Id(Uuid::new_v4()),
            false,
        );
        assert!(sql.contains("FROM ratiba_orders WHERE id = $1"));
        assert!(!sql.contains("FOR UPDATE"));
    }
}
