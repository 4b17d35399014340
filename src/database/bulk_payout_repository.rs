use crate::database::error::DatabaseError;
use crate::database::parse_column;
use crate::ledger::bulk::{
    BulkBatch, BulkBatchDetail, BulkItem, BulkPayoutStore, BulkProduct, ClaimedItem,
    NewBulkBatch,
};
use crate::ledger::LedgerStatus;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

const BATCH_COLUMNS: &str = "id, product, business_id, environment, reference, status, meta, \
    last_error, created_at, updated_at";
const ITEM_COLUMNS: &str = "id, batch_id, recipient, amount, currency, item_reference, \
    product_type, status, result, created_at, updated_at";

#[derive(Debug, FromRow)]
struct BatchRecord {
    id: Uuid,
    product: String,
    business_id: Option<Uuid>,
    environment: String,
    reference: String,
    status: String,
    meta: JsonValue,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BatchRecord> for BulkBatch {
    type Error = DatabaseError;

    fn try_from(r: BatchRecord) -> Result<Self, Self::Error> {
        Ok(BulkBatch {
            id: r.id,
            product: parse_column("product", &r.product)?,
            business_id: r.business_id,
            environment: parse_column("environment", &r.environment)?,
            reference: r.reference,
            status: parse_column("status", &r.status)?,
            meta: r.meta,
            last_error: r.last_error,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ItemRecord {
    id: Uuid,
    batch_id: Uuid,
    recipient: String,
    amount: BigDecimal,
    currency: String,
    item_reference: String,
    product_type: String,
    status: String,
    result: JsonValue,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ItemRecord> for BulkItem {
    type Error = DatabaseError;

    fn try_from(r: ItemRecord) -> Result<Self, Self::Error> {
        Ok(BulkItem {
            id: r.id,
            batch_id: r.batch_id,
            recipient: r.recipient,
            amount: r.amount,
            currency: r.currency,
            item_reference: r.item_reference,
            product_type: r.product_type,
            status: parse_column("status", &r.status)?,
            result: r.result,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ClaimedRecord {
    #[sqlx(flatten)]
    item: ItemRecord,
    batch_business_id: Option<Uuid>,
    batch_environment: String,
}

/// Update a bulk item on `conn` unless it is terminal, then close the batch once no
/// open items remain. Shared with the ledger's callback transaction.
pub(crate) async fn update_item_in(
    conn: &mut PgConnection,
    item_id: Uuid,
    status: LedgerStatus,
    result: &JsonValue,
) -> Result<bool, DatabaseError> {
    let batch_id: Option<Uuid> = sqlx::query_scalar(
        "UPDATE bulk_payout_items
         SET status = CASE WHEN $2 = 'queued' THEN status ELSE $2 END,
             result = $3,
             updated_at = NOW()
         WHERE id = $1 AND status IN ('queued', 'submitted')
         RETURNING batch_id",
    )
    .bind(item_id)
    .bind(status.as_str())
    .bind(result)
    .fetch_optional(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?;

    let Some(batch_id) = batch_id else {
        return Ok(false);
    };

    sqlx::query(
        "UPDATE bulk_payout_batches
         SET status = 'completed', updated_at = NOW()
         WHERE id = $1 AND status <> 'completed'
           AND NOT EXISTS (
               SELECT 1 FROM bulk_payout_items
               WHERE batch_id = $1 AND status IN ('queued', 'submitted')
           )",
    )
    .bind(batch_id)
    .execute(&mut *conn)
    .await
    .map_err(DatabaseError::from_sqlx)?;

    Ok(true)
}

/// Repository for `bulk_payout_batches` and `bulk_payout_items`
pub struct BulkPayoutRepository {
    pool: PgPool,
}

impl BulkPayoutRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn items_of(&self, batch_id: Uuid) -> Result<Vec<BulkItem>, DatabaseError> {
        sqlx::query_as::<_, ItemRecord>(&format!(
            "SELECT {} FROM bulk_payout_items WHERE batch_id = $1 ORDER BY created_at ASC, id ASC",
            ITEM_COLUMNS
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .into_iter()
        .map(BulkItem::try_from)
        .collect()
    }
}

#[async_trait]
impl BulkPayoutStore for BulkPayoutRepository {
    async fn create_batch(&self, new: NewBulkBatch) -> Result<BulkBatchDetail, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let batch = sqlx::query_as::<_, BatchRecord>(&format!(
            "INSERT INTO bulk_payout_batches (id, product, business_id, environment, reference, status, meta)
             VALUES ($1, $2, $3, $4, $5, 'queued', $6)
             RETURNING {}",
            BATCH_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(new.product.as_str())
        .bind(new.business_id)
        .bind(new.environment.as_str())
        .bind(&new.reference)
        .bind(&new.meta)
        .fetch_one(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        let batch = BulkBatch::try_from(batch)?;

        let mut items = Vec::with_capacity(new.items.len());
        for item in new.items {
            let record = sqlx::query_as::<_, ItemRecord>(&format!(
                "INSERT INTO bulk_payout_items
                     (id, batch_id, recipient, amount, currency, item_reference, product_type, status)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, 'queued')
                 RETURNING {}",
                ITEM_COLUMNS
            ))
            .bind(Uuid::new_v4())
            .bind(batch.id)
            .bind(&item.recipient)
            .bind(&item.amount)
            .bind(&item.currency)
            .bind(&item.item_reference)
            .bind(&item.product_type)
            .fetch_one(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            items.push(BulkItem::try_from(record)?);
        }

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(BulkBatchDetail { batch, items })
    }

    async fn list_batches(
        &self,
        product: BulkProduct,
        limit: i64,
    ) -> Result<Vec<BulkBatch>, DatabaseError> {
        sqlx::query_as::<_, BatchRecord>(&format!(
            "SELECT {} FROM bulk_payout_batches WHERE product = $1 ORDER BY created_at DESC LIMIT $2",
            BATCH_COLUMNS
        ))
        .bind(product.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .into_iter()
        .map(BulkBatch::try_from)
        .collect()
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<BulkBatchDetail>, DatabaseError> {
        let record = sqlx::query_as::<_, BatchRecord>(&format!(
            "SELECT {} FROM bulk_payout_batches WHERE id = $1",
            BATCH_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let Some(record) = record else {
            return Ok(None);
        };
        let batch = BulkBatch::try_from(record)?;
        let items = self.items_of(id).await?;
        Ok(Some(BulkBatchDetail { batch, items }))
    }

    async fn claim_queued_items(&self, limit: i64) -> Result<Vec<ClaimedItem>, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT i.id FROM bulk_payout_items i
             JOIN bulk_payout_batches b ON b.id = i.batch_id
             WHERE i.status = 'queued' AND b.product = $2
             ORDER BY i.created_at ASC
             LIMIT $1
             FOR UPDATE OF i SKIP LOCKED",
        )
        .bind(limit)
        .bind(BulkProduct::B2c.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if ids.is_empty() {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(Vec::new());
        }

        let records = sqlx::query_as::<_, ClaimedRecord>(
            "WITH claimed AS (
                 UPDATE bulk_payout_items
                 SET status = 'submitted', updated_at = NOW()
                 WHERE id = ANY($1)
                 RETURNING *
             )
             SELECT c.id, c.batch_id, c.recipient, c.amount, c.currency, c.item_reference,
                    c.product_type, c.status, c.result, c.created_at, c.updated_at,
                    b.business_id AS batch_business_id, b.environment AS batch_environment
             FROM claimed c
             JOIN bulk_payout_batches b ON b.id = c.batch_id
             ORDER BY c.created_at ASC",
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        sqlx::query(
            "UPDATE bulk_payout_batches SET status = 'processing', updated_at = NOW()
             WHERE status = 'queued'
               AND id IN (SELECT batch_id FROM bulk_payout_items WHERE id = ANY($1))",
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;

        records
            .into_iter()
            .map(|r| {
                Ok(ClaimedItem {
                    business_id: r.batch_business_id,
                    environment: parse_column("environment", &r.batch_environment)?,
                    item: BulkItem::try_from(r.item)?,
                })
            })
            .collect()
    }

    async fn update_item(
        &self,
        item_id: Uuid,
        status: LedgerStatus,
        result: JsonValue,
    ) -> Result<bool, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;
        let changed = update_item_in(&mut tx, item_id, status, &result).await?;
        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(changed)
    }

    async fn record_batch_error(&self, batch_id: Uuid, error: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE bulk_payout_batches SET last_error = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(batch_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }
}
