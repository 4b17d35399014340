//! In-process ledger and bulk payout stores for tests and local runs.
//!
//! Each store serializes its writes through one mutex, which gives `settle` and
//! `claim_queued_items` the same atomicity as their Postgres transactions.

use super::bulk::{
    item_result, BatchStatus, BulkBatch, BulkBatchDetail, BulkItem, BulkPayoutStore,
    BulkProduct, ClaimedItem, NewBulkBatch,
};
use super::{
    preferred_match, CallbackUpdate, CorrelationKey, LedgerFilter, LedgerKind, LedgerRow,
    LedgerStatus, LedgerStore, SettleOutcome, SubmissionUpdate,
};
use crate::database::error::{DatabaseError, DatabaseErrorKind};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryLedgerStore {
    rows: Mutex<Vec<LedgerRow>>,
    bulk: Option<Arc<InMemoryBulkPayoutStore>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settled rows linked to a bulk item propagate into `bulk`
    pub fn with_bulk(bulk: Arc<InMemoryBulkPayoutStore>) -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            bulk: Some(bulk),
        }
    }

    pub async fn all(&self, kind: LedgerKind) -> Vec<LedgerRow> {
        self.rows
            .lock()
            .await
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }
}

fn find_index(rows: &[LedgerRow], kind: LedgerKind, keys: &[CorrelationKey]) -> Option<usize> {
    for key in keys {
        let picked = preferred_match(rows.iter().filter(|r| r.kind == kind && key.matches(r)));
        if let Some(row) = picked {
            return rows.iter().position(|r| r.id == row.id);
        }
    }
    None
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn insert(&self, row: LedgerRow) -> Result<LedgerRow, DatabaseError> {
        let mut rows = self.rows.lock().await;
        if rows.iter().any(|r| r.kind == row.kind && r.id == row.id) {
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                constraint: format!("{}_pkey", row.kind.table()),
            }));
        }
        rows.push(row.clone());
        Ok(row)
    }

    async fn get(&self, kind: LedgerKind, id: Uuid) -> Result<Option<LedgerRow>, DatabaseError> {
        let rows = self.rows.lock().await;
        Ok(rows.iter().find(|r| r.kind == kind && r.id == id).cloned())
    }

    async fn list(
        &self,
        kind: LedgerKind,
        filter: &LedgerFilter,
        limit: i64,
    ) -> Result<Vec<LedgerRow>, DatabaseError> {
        let rows = self.rows.lock().await;
        let mut listed: Vec<LedgerRow> = rows
            .iter()
            .filter(|r| r.kind == kind && filter.matches(r))
            .cloned()
            .collect();
        listed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        listed.truncate(limit.max(0) as usize);
        Ok(listed)
    }

    async fn find(
        &self,
        kind: LedgerKind,
        keys: &[CorrelationKey],
    ) -> Result<Option<LedgerRow>, DatabaseError> {
        let rows = self.rows.lock().await;
        Ok(find_index(&rows, kind, keys).map(|i| rows[i].clone()))
    }

    async fn record_submission(
        &self,
        kind: LedgerKind,
        id: Uuid,
        update: SubmissionUpdate,
    ) -> Result<Option<LedgerRow>, DatabaseError> {
        let mut rows = self.rows.lock().await;
        match rows.iter_mut().find(|r| r.kind == kind && r.id == id) {
            Some(row) => {
                row.apply_submission(&update);
                Ok(Some(row.clone()))
            }
            None => Ok(None),
        }
    }

    async fn settle(
        &self,
        kind: LedgerKind,
        keys: &[CorrelationKey],
        update: CallbackUpdate,
    ) -> Result<SettleOutcome, DatabaseError> {
        let mut rows = self.rows.lock().await;
        let Some(index) = find_index(&rows, kind, keys) else {
            return Ok(SettleOutcome::Unmatched);
        };

        let row = &mut rows[index];
        if !row.apply_callback(&update) {
            return Ok(SettleOutcome::IgnoredTerminal(row.clone()));
        }

        let settled = row.clone();
        if let (Some(item_id), Some(bulk)) = (settled.bulk_item_id, &self.bulk) {
            let result = item_result(
                settled.status,
                settled.id,
                settled.internal_status_code,
                settled.internal_status_message.as_deref(),
                settled.result_code.as_deref(),
                settled.result_desc.as_deref(),
                settled.transaction_id.as_deref(),
            );
            bulk.update_item(item_id, settled.status, result).await?;
        }

        Ok(SettleOutcome::Applied(settled))
    }
}

#[derive(Default)]
struct BulkState {
    batches: Vec<BulkBatch>,
    items: Vec<BulkItem>,
}

#[derive(Default)]
pub struct InMemoryBulkPayoutStore {
    state: Mutex<BulkState>,
}

impl InMemoryBulkPayoutStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn complete_if_done(state: &mut BulkState, batch_id: Uuid) {
    let open = state
        .items
        .iter()
        .any(|i| i.batch_id == batch_id && !i.status.is_terminal());
    if open {
        return;
    }
    if let Some(batch) = state.batches.iter_mut().find(|b| b.id == batch_id) {
        batch.status = BatchStatus::Completed;
        batch.updated_at = Utc::now();
    }
}

#[async_trait]
impl BulkPayoutStore for InMemoryBulkPayoutStore {
    async fn create_batch(&self, new: NewBulkBatch) -> Result<BulkBatchDetail, DatabaseError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let batch = BulkBatch {
            id: Uuid::new_v4(),
            product: new.product,
            business_id: new.business_id,
            environment: new.environment,
            reference: new.reference,
            status: BatchStatus::Queued,
            meta: new.meta,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        let items: Vec<BulkItem> = new
            .items
            .into_iter()
            .map(|item| BulkItem {
                id: Uuid::new_v4(),
                batch_id: batch.id,
                recipient: item.recipient,
                amount: item.amount,
                currency: item.currency,
                item_reference: item.item_reference,
                product_type: item.product_type,
                status: LedgerStatus::Queued,
                result: JsonValue::Object(Default::default()),
                created_at: now,
                updated_at: now,
            })
            .collect();

        state.batches.push(batch.clone());
        state.items.extend(items.iter().cloned());
        Ok(BulkBatchDetail { batch, items })
    }

    async fn list_batches(
        &self,
        product: BulkProduct,
        limit: i64,
    ) -> Result<Vec<BulkBatch>, DatabaseError> {
        let state = self.state.lock().await;
        let mut batches: Vec<BulkBatch> = state
            .batches
            .iter()
            .filter(|b| b.product == product)
            .cloned()
            .collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        batches.truncate(limit.max(0) as usize);
        Ok(batches)
    }

    async fn get_batch(&self, id: Uuid) -> Result<Option<BulkBatchDetail>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state
            .batches
            .iter()
            .find(|b| b.id == id)
            .map(|batch| BulkBatchDetail {
                batch: batch.clone(),
                items: state
                    .items
                    .iter()
                    .filter(|i| i.batch_id == id)
                    .cloned()
                    .collect(),
            }))
    }

    async fn claim_queued_items(&self, limit: i64) -> Result<Vec<ClaimedItem>, DatabaseError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut claimed = Vec::new();

        let BulkState { batches, items } = &mut *state;
        for item in items.iter_mut().filter(|i| i.status == LedgerStatus::Queued) {
            if claimed.len() >= limit.max(0) as usize {
                break;
            }
            let Some(batch) = batches
                .iter_mut()
                .find(|b| b.id == item.batch_id && b.product.is_dispatched())
            else {
                continue;
            };

            item.status = LedgerStatus::Submitted;
            item.updated_at = now;
            if batch.status == BatchStatus::Queued {
                batch.status = BatchStatus::Processing;
                batch.updated_at = now;
            }
            claimed.push(ClaimedItem {
                item: item.clone(),
                business_id: batch.business_id,
                environment: batch.environment,
            });
        }

        Ok(claimed)
    }

    async fn update_item(
        &self,
        item_id: Uuid,
        status: LedgerStatus,
        result: JsonValue,
    ) -> Result<bool, DatabaseError> {
        let mut state = self.state.lock().await;
        let Some(item) = state.items.iter_mut().find(|i| i.id == item_id) else {
            return Ok(false);
        };
        if item.status.is_terminal() {
            return Ok(false);
        }

        item.status = item.status.transition(status);
        item.result = result;
        item.updated_at = Utc::now();
        let batch_id = item.batch_id;

        complete_if_done(&mut state, batch_id);
        Ok(true)
    }

    async fn record_batch_error(&self, batch_id: Uuid, error: &str) -> Result<(), DatabaseError> {
        let mut state = self.state.lock().await;
        if let Some(batch) = state.batches.iter_mut().find(|b| b.id == batch_id) {
            batch.last_error = Some(error.to_string());
            batch.updated_at = Utc::now();
        }
        Ok(())
    }
}
