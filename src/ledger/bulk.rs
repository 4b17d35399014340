//! Bulk payouts: a batch of items. B2C items are each dispatched as their own B2C
//! ledger row; B2B business payment batches are recorded for the maintainer only.

use super::LedgerStatus;
use crate::database::error::DatabaseError;
use crate::payments::types::Environment;
use crate::status_codes::code_from_json;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const DEFAULT_CURRENCY: &str = "KES";
pub const MAX_REFERENCE_LEN: usize = 64;
pub const MAX_PRODUCT_TYPE_LEN: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkProduct {
    B2c,
    B2b,
}

impl BulkProduct {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkProduct::B2c => "b2c",
            BulkProduct::B2b => "b2b",
        }
    }

    /// Whether the bulk payout worker dispatches items of this product
    pub fn is_dispatched(&self) -> bool {
        matches!(self, BulkProduct::B2c)
    }
}

impl fmt::Display for BulkProduct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BulkProduct {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "b2c" => Ok(BulkProduct::B2c),
            "b2b" => Ok(BulkProduct::B2b),
            other => Err(format!("unknown bulk product: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    Processing,
    Completed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Queued => "queued",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "queued" => Ok(BatchStatus::Queued),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            other => Err(format!("unknown batch status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkBatch {
    pub id: Uuid,
    pub product: BulkProduct,
    pub business_id: Option<Uuid>,
    pub environment: Environment,
    pub reference: String,
    pub status: BatchStatus,
    pub meta: JsonValue,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItem {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub recipient: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub item_reference: String,
    pub product_type: String,
    pub status: LedgerStatus,
    pub result: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkBatchDetail {
    #[serde(flatten)]
    pub batch: BulkBatch,
    pub items: Vec<BulkItem>,
}

#[derive(Debug, Clone)]
pub struct NewBulkItem {
    pub recipient: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub item_reference: String,
    pub product_type: String,
}

#[derive(Debug, Clone)]
pub struct NewBulkBatch {
    pub product: BulkProduct,
    pub business_id: Option<Uuid>,
    pub environment: Environment,
    pub reference: String,
    pub meta: JsonValue,
    pub items: Vec<NewBulkItem>,
}

/// A claimed item together with what the worker needs to dispatch it
#[derive(Debug, Clone)]
pub struct ClaimedItem {
    pub item: BulkItem,
    pub business_id: Option<Uuid>,
    pub environment: Environment,
}

/// Parse one raw item of a create request; invalid items are skipped (`None`)
pub fn parse_item(raw: &JsonValue) -> Option<NewBulkItem> {
    let obj = raw.as_object()?;

    let recipient = ["recipient", "phone_number", "party_b", "account"]
        .iter()
        .find_map(|k| code_from_json(obj.get(*k)))?;

    let amount_raw = code_from_json(obj.get("amount"))?;
    let amount = BigDecimal::from_str(&amount_raw).ok()?;
    if amount <= BigDecimal::from(0) {
        return None;
    }

    let currency = obj
        .get("currency")
        .and_then(|v| v.as_str())
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
        .map(|c| c.chars().take(3).collect::<String>())
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

    let truncated = |key: &str, max: usize| {
        obj.get(key)
            .and_then(|v| v.as_str())
            .map(|r| r.trim().chars().take(max).collect::<String>())
            .unwrap_or_default()
    };
    let item_reference = truncated("reference", MAX_REFERENCE_LEN);
    let product_type = truncated("product_type", MAX_PRODUCT_TYPE_LEN);

    Some(NewBulkItem {
        recipient,
        amount,
        currency,
        item_reference,
        product_type,
    })
}

/// Item result document written on every status change
pub fn item_result(
    status: LedgerStatus,
    ledger_id: Uuid,
    status_code: Option<i64>,
    status_message: Option<&str>,
    result_code: Option<&str>,
    result_desc: Option<&str>,
    transaction_id: Option<&str>,
) -> JsonValue {
    serde_json::json!({
        "status": status,
        "ledger_id": ledger_id,
        "status_code": status_code,
        "status_message": status_message,
        "result_code": result_code,
        "result_desc": result_desc,
        "transaction_id": transaction_id,
    })
}

#[async_trait]
pub trait BulkPayoutStore: Send + Sync {
    async fn create_batch(&self, batch: NewBulkBatch) -> Result<BulkBatchDetail, DatabaseError>;

    /// Batches of one product, most recent first
    async fn list_batches(
        &self,
        product: BulkProduct,
        limit: i64,
    ) -> Result<Vec<BulkBatch>, DatabaseError>;

    async fn get_batch(&self, id: Uuid) -> Result<Option<BulkBatchDetail>, DatabaseError>;

    /// Move up to `limit` queued items of dispatched products to `submitted` and hand
    /// them out. Concurrent workers never receive the same item.
    async fn claim_queued_items(&self, limit: i64) -> Result<Vec<ClaimedItem>, DatabaseError>;

    /// Update an item unless it is already terminal, then complete the batch when no
    /// open items remain. Returns `true` when the item changed.
    async fn update_item(
        &self,
        item_id: Uuid,
        status: LedgerStatus,
        result: JsonValue,
    ) -> Result<bool, DatabaseError>;

    async fn record_batch_error(&self, batch_id: Uuid, error: &str) -> Result<(), DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn item_parsing_skips_invalid_rows() {
        assert!(parse_item(&json!("junk")).is_none());
        assert!(parse_item(&json!({"amount": 10})).is_none());
        assert!(parse_item(&json!({"recipient": "254700000001", "amount": "abc"})).is_none());
        assert!(parse_item(&json!({"recipient": "254700000001", "amount": 0})).is_none());

        let item = parse_item(&json!({
            "phone_number": "254700000001",
            "amount": "150.50",
            "currency": "kes",
            "reference": "inv-1"
        }))
        .unwrap();
        assert_eq!(item.recipient, "254700000001");
        assert_eq!(item.amount, BigDecimal::from_str("150.50").unwrap());
        assert_eq!(item.currency, "KES");
        assert_eq!(item.item_reference, "inv-1");
    }

    #[test]
    fn business_items_accept_party_b_and_product_type() {
        let item = parse_item(&json!({
            "party_b": "600000",
            "amount": 2500,
            "product_type": "BusinessPayBill",
            "reference": "supplier-7"
        }))
        .unwrap();
        assert_eq!(item.recipient, "600000");
        assert_eq!(item.product_type, "BusinessPayBill");
        assert_eq!(item.item_reference, "supplier-7");

        let item = parse_item(&json!({"account": "600111", "amount": 1})).unwrap();
        assert_eq!(item.recipient, "600111");
        assert_eq!(item.product_type, "");
    }

    #[test]
    fn only_b2c_batches_are_dispatched() {
        assert!(BulkProduct::B2c.is_dispatched());
        assert!(!BulkProduct::B2b.is_dispatched());
        assert_eq!(BulkProduct::from_str("b2b").unwrap(), BulkProduct::B2b);
        assert!(BulkProduct::from_str("c2b").is_err());
    }

    #[test]
    fn currency_defaults_to_kes() {
        let item = parse_item(&json!({"recipient": "254700000001", "amount": 5})).unwrap();
        assert_eq!(item.currency, DEFAULT_CURRENCY);
    }
}
