use crate::database::error::DatabaseError;
use crate::database::parse_column;
use crate::ledger::audit::{CallbackLogEntry, CallbackLogStore, NewCallbackLog};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

const COLUMNS: &str =
    "id, kind, correlation_id, ledger_id, outcome, result_code, result_desc, content, created_at";

#[derive(Debug, FromRow)]
struct CallbackRecord {
    id: i64,
    kind: String,
    correlation_id: Option<String>,
    ledger_id: Option<Uuid>,
    outcome: String,
    result_code: Option<String>,
    result_desc: Option<String>,
    content: JsonValue,
    created_at: DateTime<Utc>,
}

impl TryFrom<CallbackRecord> for CallbackLogEntry {
    type Error = DatabaseError;

    fn try_from(r: CallbackRecord) -> Result<Self, Self::Error> {
        Ok(CallbackLogEntry {
            id: r.id,
            kind: r.kind,
            correlation_id: r.correlation_id,
            ledger_id: r.ledger_id,
            outcome: parse_column("outcome", &r.outcome)?,
            result_code: r.result_code,
            result_desc: r.result_desc,
            content: r.content,
            created_at: r.created_at,
        })
    }
}

/// Repository for the `mpesa_callbacks` audit table
pub struct CallbackLogRepository {
    pool: PgPool,
}

impl CallbackLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CallbackLogStore for CallbackLogRepository {
    async fn record(&self, entry: NewCallbackLog) -> Result<CallbackLogEntry, DatabaseError> {
        sqlx::query_as::<_, CallbackRecord>(&format!(
            "INSERT INTO mpesa_callbacks (kind, correlation_id, ledger_id, outcome, result_code, result_desc, content)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {}",
            COLUMNS
        ))
        .bind(&entry.kind)
        .bind(&entry.correlation_id)
        .bind(entry.ledger_id)
        .bind(entry.outcome.as_str())
        .bind(&entry.result_code)
        .bind(&entry.result_desc)
        .bind(&entry.content)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .try_into()
    }

    async fn list(&self, limit: i64) -> Result<Vec<CallbackLogEntry>, DatabaseError> {
        sqlx::query_as::<_, CallbackRecord>(&format!(
            "SELECT {} FROM mpesa_callbacks ORDER BY created_at DESC, id DESC LIMIT $1",
            COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .into_iter()
        .map(CallbackLogEntry::try_from)
        .collect()
    }
}
