use crate::database::error::DatabaseError;
use crate::database::parse_column;
use crate::status_codes::{
    ExternalSystem, NewStatusCode, StatusCodeMapping, StatusCodeStore, SUCCESS_EXTERNAL_CODE,
    SUCCESS_INTERNAL_CODE, SUCCESS_MESSAGE,
};
use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use tracing::debug;

/// Key of the transaction-scoped advisory lock serializing code allocation.
/// Postgres refuses `FOR UPDATE` on aggregates, so `MAX(internal_code)` is guarded this way.
const ALLOCATION_LOCK_KEY: i64 = 0x6d70_6573_615f_7363;

const COLUMNS: &str = "external_system, external_code, internal_code, default_message, is_success";

#[derive(Debug, FromRow)]
struct StatusCodeRecord {
    external_system: String,
    external_code: String,
    internal_code: i64,
    default_message: String,
    is_success: bool,
}

impl TryFrom<StatusCodeRecord> for StatusCodeMapping {
    type Error = DatabaseError;

    fn try_from(record: StatusCodeRecord) -> Result<Self, Self::Error> {
        Ok(StatusCodeMapping {
            external_system: parse_column("external_system", &record.external_system)?,
            external_code: record.external_code,
            internal_code: record.internal_code,
            default_message: record.default_message,
            is_success: record.is_success,
        })
    }
}

/// Repository for the `status_code_mappings` table
pub struct StatusCodeRepository {
    pool: PgPool,
}

impl StatusCodeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StatusCodeStore for StatusCodeRepository {
    async fn find(
        &self,
        system: ExternalSystem,
        code: &str,
    ) -> Result<Option<StatusCodeMapping>, DatabaseError> {
        let record = sqlx::query_as::<_, StatusCodeRecord>(&format!(
            "SELECT {} FROM status_code_mappings WHERE external_system = $1 AND external_code = $2",
            COLUMNS
        ))
        .bind(system.as_str())
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        record.map(StatusCodeMapping::try_from).transpose()
    }

    async fn allocate(&self, request: NewStatusCode) -> Result<StatusCodeMapping, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(ALLOCATION_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        // Self-heal the success row; a concurrent creator is fine
        sqlx::query(
            "INSERT INTO status_code_mappings (external_system, external_code, internal_code, default_message, is_success)
             VALUES ('safaricom', $1, $2, $3, TRUE)
             ON CONFLICT DO NOTHING",
        )
        .bind(SUCCESS_EXTERNAL_CODE)
        .bind(SUCCESS_INTERNAL_CODE)
        .bind(SUCCESS_MESSAGE)
        .execute(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let existing = sqlx::query_as::<_, StatusCodeRecord>(&format!(
            "SELECT {} FROM status_code_mappings
             WHERE external_system = $1 AND external_code = $2
             FOR UPDATE",
            COLUMNS
        ))
        .bind(request.external_system.as_str())
        .bind(&request.external_code)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if let Some(record) = existing {
            tx.commit().await.map_err(DatabaseError::from_sqlx)?;
            return StatusCodeMapping::try_from(record);
        }

        let internal_code: i64 = if request.is_success_pair() {
            SUCCESS_INTERNAL_CODE
        } else {
            sqlx::query_scalar(
                "SELECT COALESCE(MAX(internal_code), 0) + 1 FROM status_code_mappings",
            )
            .fetch_one(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?
        };

        let record = sqlx::query_as::<_, StatusCodeRecord>(&format!(
            "INSERT INTO status_code_mappings (external_system, external_code, internal_code, default_message, is_success)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {}",
            COLUMNS
        ))
        .bind(request.external_system.as_str())
        .bind(&request.external_code)
        .bind(internal_code)
        .bind(&request.default_message)
        .bind(request.is_success)
        .fetch_one(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;

        debug!(
            external_system = %request.external_system,
            external_code = %request.external_code,
            internal_code,
            "allocated internal status code"
        );
        StatusCodeMapping::try_from(record)
    }

    async fn list(&self) -> Result<Vec<StatusCodeMapping>, DatabaseError> {
        sqlx::query_as::<_, StatusCodeRecord>(&format!(
            "SELECT {} FROM status_code_mappings ORDER BY internal_code ASC",
            COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .into_iter()
        .map(StatusCodeMapping::try_from)
        .collect()
    }

    async fn upsert_exact(&self, mapping: StatusCodeMapping) -> Result<bool, DatabaseError> {
        // xmax is 0 only for freshly inserted tuples
        let inserted: bool = sqlx::query_scalar(
            "INSERT INTO status_code_mappings (external_system, external_code, internal_code, default_message, is_success)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (external_system, external_code) DO UPDATE
             SET internal_code = EXCLUDED.internal_code,
                 default_message = EXCLUDED.default_message,
                 is_success = EXCLUDED.is_success,
                 updated_at = NOW()
             RETURNING (xmax = 0)",
        )
        .bind(mapping.external_system.as_str())
        .bind(&mapping.external_code)
        .bind(mapping.internal_code)
        .bind(&mapping.default_message)
        .bind(mapping.is_success)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(inserted)
    }

    async fn backfill_message(
        &self,
        system: ExternalSystem,
        code: &str,
        message: &str,
        is_success: bool,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE status_code_mappings
             SET default_message = btrim($3), is_success = $4, updated_at = NOW()
             WHERE external_system = $1 AND external_code = $2
               AND btrim(default_message) = '' AND btrim($3) <> ''",
        )
        .bind(system.as_str())
        .bind(code)
        .bind(message)
        .bind(is_success)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_system(&self, system: ExternalSystem) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM status_code_mappings WHERE external_system = $1")
            .bind(system.as_str())
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected())
    }
}
