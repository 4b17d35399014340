//! Request ledger
//!
//! One row per outbound Daraja call, in one table per product. All tables share the
//! shape of [`LedgerRow`] and the state machine of [`LedgerStatus`]:
//!
//! ```text
//! queued ──► submitted ──► successful | failed | cancelled | timeout
//!   │
//!   ├──► error                       (local failure, upstream non-2xx, transport error)
//!   └──► successful | failed         (synchronously final responses, e.g. QR)
//! ```
//!
//! Terminal rows never change status or result fields again.

pub mod audit;
pub mod bulk;
pub mod memory;

use crate::database::error::DatabaseError;
use crate::payments::types::Environment;
use crate::status_codes::StatusTarget;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    StkPush,
    B2cPayment,
    B2bUssd,
    TransactionStatus,
    RatibaOrder,
    QrCode,
    C2bPayment,
}

impl LedgerKind {
    pub const ALL: [LedgerKind; 7] = [
        LedgerKind::StkPush,
        LedgerKind::B2cPayment,
        LedgerKind::B2bUssd,
        LedgerKind::TransactionStatus,
        LedgerKind::RatibaOrder,
        LedgerKind::QrCode,
        LedgerKind::C2bPayment,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            LedgerKind::StkPush => "stk_push_requests",
            LedgerKind::B2cPayment => "b2c_payment_requests",
            LedgerKind::B2bUssd => "b2b_ussd_requests",
            LedgerKind::TransactionStatus => "transaction_status_queries",
            LedgerKind::RatibaOrder => "ratiba_orders",
            LedgerKind::QrCode => "qr_code_requests",
            LedgerKind::C2bPayment => "c2b_payments",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::StkPush => "stk_push",
            LedgerKind::B2cPayment => "b2c_payment",
            LedgerKind::B2bUssd => "b2b_ussd",
            LedgerKind::TransactionStatus => "transaction_status",
            LedgerKind::RatibaOrder => "ratiba_order",
            LedgerKind::QrCode => "qr_code",
            LedgerKind::C2bPayment => "c2b_payment",
        }
    }
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Queued,
    Submitted,
    #[serde(alias = "completed", alias = "success")]
    Successful,
    Failed,
    Cancelled,
    Timeout,
    Error,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Queued => "queued",
            LedgerStatus::Submitted => "submitted",
            LedgerStatus::Successful => "successful",
            LedgerStatus::Failed => "failed",
            LedgerStatus::Cancelled => "cancelled",
            LedgerStatus::Timeout => "timeout",
            LedgerStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, LedgerStatus::Queued | LedgerStatus::Submitted)
    }

    /// Next status when `event` is applied. Terminal statuses absorb every event.
    pub fn transition(self, event: LedgerStatus) -> LedgerStatus {
        if self.is_terminal() {
            return self;
        }
        match event {
            // Submission never moves a row backwards from submitted to queued
            LedgerStatus::Queued => self,
            other => other,
        }
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(LedgerStatus::Queued),
            "submitted" => Ok(LedgerStatus::Submitted),
            "successful" | "completed" | "success" => Ok(LedgerStatus::Successful),
            "failed" => Ok(LedgerStatus::Failed),
            "cancelled" => Ok(LedgerStatus::Cancelled),
            "timeout" => Ok(LedgerStatus::Timeout),
            "error" => Ok(LedgerStatus::Error),
            other => Err(format!("unknown ledger status: {}", other)),
        }
    }
}

/// Columns a callback can be matched on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrelationField {
    CheckoutRequestId,
    MerchantRequestId,
    OriginatorConversationId,
    ConversationId,
    RequestRefId,
    AccountReference,
    TransactionId,
}

impl CorrelationField {
    pub fn column(&self) -> &'static str {
        match self {
            CorrelationField::CheckoutRequestId => "checkout_request_id",
            CorrelationField::MerchantRequestId => "merchant_request_id",
            CorrelationField::OriginatorConversationId => "originator_conversation_id",
            CorrelationField::ConversationId => "conversation_id",
            CorrelationField::RequestRefId => "request_ref_id",
            CorrelationField::AccountReference => "account_reference",
            CorrelationField::TransactionId => "transaction_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationKey {
    /// Row id, e.g. the `order_id` carried on Ratiba callback URLs
    Id(Uuid),
    Field {
        field: CorrelationField,
        value: String,
    },
}

impl CorrelationKey {
    pub fn field(field: CorrelationField, value: impl Into<String>) -> Self {
        CorrelationKey::Field {
            field,
            value: value.into(),
        }
    }

    pub fn matches(&self, row: &LedgerRow) -> bool {
        match self {
            CorrelationKey::Id(id) => row.id == *id,
            CorrelationKey::Field { field, value } => {
                row.correlation_value(*field) == Some(value.as_str())
            }
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationKey::Id(id) => write!(f, "id:{}", id),
            CorrelationKey::Field { field, value } => write!(f, "{}:{}", field.column(), value),
        }
    }
}

/// Upstream identifiers, any of which may be unknown at a given point
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationIds {
    pub checkout_request_id: Option<String>,
    pub merchant_request_id: Option<String>,
    pub originator_conversation_id: Option<String>,
    pub conversation_id: Option<String>,
    pub request_ref_id: Option<String>,
}

impl CorrelationIds {
    /// Fill gaps from `other`, never overwriting a known id
    pub fn fill_from(&mut self, other: &CorrelationIds) {
        fn fill(slot: &mut Option<String>, value: &Option<String>) {
            if slot.is_none() {
                slot.clone_from(value);
            }
        }
        fill(&mut self.checkout_request_id, &other.checkout_request_id);
        fill(&mut self.merchant_request_id, &other.merchant_request_id);
        fill(
            &mut self.originator_conversation_id,
            &other.originator_conversation_id,
        );
        fill(&mut self.conversation_id, &other.conversation_id);
        fill(&mut self.request_ref_id, &other.request_ref_id);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRow {
    pub id: Uuid,
    pub kind: LedgerKind,
    pub business_id: Option<Uuid>,
    pub environment: Environment,
    #[serde(flatten)]
    pub correlation: CorrelationIds,
    pub account_reference: Option<String>,
    pub status: LedgerStatus,
    pub transaction_id: Option<String>,
    pub amount: Option<BigDecimal>,
    pub phone_number: Option<String>,
    pub result_code: Option<String>,
    pub result_desc: Option<String>,
    pub internal_status_code: Option<i64>,
    pub internal_status_message: Option<String>,
    pub request_payload: JsonValue,
    pub response_payload: Option<JsonValue>,
    pub error_payload: Option<JsonValue>,
    pub callback_payload: Option<JsonValue>,
    pub bulk_item_id: Option<Uuid>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields known before the outbound call is made
#[derive(Debug, Clone)]
pub struct NewLedgerRow {
    pub id: Uuid,
    pub kind: LedgerKind,
    pub business_id: Option<Uuid>,
    pub environment: Environment,
    pub correlation: CorrelationIds,
    pub account_reference: Option<String>,
    pub transaction_id: Option<String>,
    pub amount: Option<BigDecimal>,
    pub phone_number: Option<String>,
    pub request_payload: JsonValue,
    pub bulk_item_id: Option<Uuid>,
}

impl NewLedgerRow {
    pub fn new(kind: LedgerKind, business_id: Option<Uuid>, environment: Environment) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            business_id,
            environment,
            correlation: CorrelationIds::default(),
            account_reference: None,
            transaction_id: None,
            amount: None,
            phone_number: None,
            request_payload: JsonValue::Object(Default::default()),
            bulk_item_id: None,
        }
    }
}

impl LedgerRow {
    /// A fresh `queued` row
    pub fn queued(new: NewLedgerRow) -> Self {
        let now = Utc::now();
        Self {
            id: new.id,
            kind: new.kind,
            business_id: new.business_id,
            environment: new.environment,
            correlation: new.correlation,
            account_reference: new.account_reference,
            status: LedgerStatus::Queued,
            transaction_id: new.transaction_id,
            amount: new.amount,
            phone_number: new.phone_number,
            result_code: None,
            result_desc: None,
            internal_status_code: None,
            internal_status_message: None,
            request_payload: new.request_payload,
            response_payload: None,
            error_payload: None,
            callback_payload: None,
            bulk_item_id: new.bulk_item_id,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn correlation_value(&self, field: CorrelationField) -> Option<&str> {
        match field {
            CorrelationField::CheckoutRequestId => self.correlation.checkout_request_id.as_deref(),
            CorrelationField::MerchantRequestId => self.correlation.merchant_request_id.as_deref(),
            CorrelationField::OriginatorConversationId => {
                self.correlation.originator_conversation_id.as_deref()
            }
            CorrelationField::ConversationId => self.correlation.conversation_id.as_deref(),
            CorrelationField::RequestRefId => self.correlation.request_ref_id.as_deref(),
            CorrelationField::AccountReference => self.account_reference.as_deref(),
            CorrelationField::TransactionId => self.transaction_id.as_deref(),
        }
    }

    /// Apply the synchronous outcome of the outbound call. Terminal rows only pick up
    /// correlation ids they did not know yet.
    pub fn apply_submission(&mut self, update: &SubmissionUpdate) -> bool {
        self.correlation.fill_from(&update.correlation);
        if self.transaction_id.is_none() {
            self.transaction_id.clone_from(&update.transaction_id);
        }
        self.updated_at = Utc::now();

        if self.is_terminal() {
            return false;
        }

        self.status = self.status.transition(update.status);
        self.result_code.clone_from(&update.result_code);
        self.result_desc.clone_from(&update.result_desc);
        if let Some(code) = update.internal_status_code {
            self.internal_status_code = Some(code);
            self.internal_status_message = update.internal_status_message.clone();
        }
        if update.response_payload.is_some() {
            self.response_payload.clone_from(&update.response_payload);
        }
        if update.error_payload.is_some() {
            self.error_payload.clone_from(&update.error_payload);
        }
        if self.is_terminal() {
            self.resolved_at = Some(self.updated_at);
        }
        true
    }

    /// Apply a callback. Returns `false` and leaves the row alone when it is terminal.
    pub fn apply_callback(&mut self, update: &CallbackUpdate) -> bool {
        if self.is_terminal() {
            return false;
        }

        let now = Utc::now();
        self.status = self.status.transition(update.status);
        self.result_code.clone_from(&update.result_code);
        self.result_desc.clone_from(&update.result_desc);
        self.internal_status_code = Some(update.internal_status_code);
        self.internal_status_message = Some(update.internal_status_message.clone());
        if self.transaction_id.is_none() {
            self.transaction_id.clone_from(&update.transaction_id);
        }
        if update.amount.is_some() {
            self.amount.clone_from(&update.amount);
        }
        if update.phone_number.is_some() {
            self.phone_number.clone_from(&update.phone_number);
        }
        self.correlation.fill_from(&update.correlation);
        self.callback_payload = Some(update.callback_payload.clone());
        self.resolved_at = Some(now);
        self.updated_at = now;
        true
    }
}

impl StatusTarget for LedgerRow {
    fn set_internal_status(&mut self, code: i64, message: String) {
        self.internal_status_code = Some(code);
        self.internal_status_message = Some(message);
    }
}

/// Result of the outbound call
#[derive(Debug, Clone)]
pub struct SubmissionUpdate {
    pub status: LedgerStatus,
    pub correlation: CorrelationIds,
    pub transaction_id: Option<String>,
    pub result_code: Option<String>,
    pub result_desc: Option<String>,
    pub internal_status_code: Option<i64>,
    pub internal_status_message: Option<String>,
    pub response_payload: Option<JsonValue>,
    pub error_payload: Option<JsonValue>,
}

impl SubmissionUpdate {
    pub fn new(status: LedgerStatus) -> Self {
        Self {
            status,
            correlation: CorrelationIds::default(),
            transaction_id: None,
            result_code: None,
            result_desc: None,
            internal_status_code: None,
            internal_status_message: None,
            response_payload: None,
            error_payload: None,
        }
    }
}

/// Terminal outcome carried by a vendor callback
#[derive(Debug, Clone)]
pub struct CallbackUpdate {
    pub status: LedgerStatus,
    pub result_code: Option<String>,
    pub result_desc: Option<String>,
    pub internal_status_code: i64,
    pub internal_status_message: String,
    pub transaction_id: Option<String>,
    pub amount: Option<BigDecimal>,
    pub phone_number: Option<String>,
    pub correlation: CorrelationIds,
    pub callback_payload: JsonValue,
}

#[derive(Debug, Clone)]
pub enum SettleOutcome {
    Applied(LedgerRow),
    IgnoredTerminal(LedgerRow),
    Unmatched,
}

impl SettleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettleOutcome::Applied(_) => "applied",
            SettleOutcome::IgnoredTerminal(_) => "ignored_terminal",
            SettleOutcome::Unmatched => "unmatched",
        }
    }

    pub fn row(&self) -> Option<&LedgerRow> {
        match self {
            SettleOutcome::Applied(row) | SettleOutcome::IgnoredTerminal(row) => Some(row),
            SettleOutcome::Unmatched => None,
        }
    }
}

/// Narrows a ledger listing. Unset fields match every row.
#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    pub business_id: Option<Uuid>,
    pub status: Option<LedgerStatus>,
    /// UTC calendar day of `created_at`
    pub created_on: Option<NaiveDate>,
}

impl LedgerFilter {
    pub fn business(business_id: Uuid) -> Self {
        Self {
            business_id: Some(business_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, row: &LedgerRow) -> bool {
        self.business_id.map_or(true, |id| row.business_id == Some(id))
            && self.status.map_or(true, |status| row.status == status)
            && self
                .created_on
                .map_or(true, |day| row.created_at.date_naive() == day)
    }
}

/// Durable storage for ledger rows.
///
/// `settle` is the callback write path: it locks the first row matched by `keys` (tried
/// in order, non-terminal rows preferred, then the most recent), applies `update` unless
/// the row is terminal, and propagates the outcome to a linked bulk payout item, all as
/// one atomic unit.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert(&self, row: LedgerRow) -> Result<LedgerRow, DatabaseError>;

    async fn get(&self, kind: LedgerKind, id: Uuid) -> Result<Option<LedgerRow>, DatabaseError>;

    /// Rows of one kind matching `filter`, most recent first
    async fn list(
        &self,
        kind: LedgerKind,
        filter: &LedgerFilter,
        limit: i64,
    ) -> Result<Vec<LedgerRow>, DatabaseError>;

    async fn find(
        &self,
        kind: LedgerKind,
        keys: &[CorrelationKey],
    ) -> Result<Option<LedgerRow>, DatabaseError>;

    /// Returns the row after the update, or `None` when it does not exist
    async fn record_submission(
        &self,
        kind: LedgerKind,
        id: Uuid,
        update: SubmissionUpdate,
    ) -> Result<Option<LedgerRow>, DatabaseError>;

    async fn settle(
        &self,
        kind: LedgerKind,
        keys: &[CorrelationKey],
        update: CallbackUpdate,
    ) -> Result<SettleOutcome, DatabaseError>;
}

/// Pick the row a callback belongs to among candidates matching one key
pub(crate) fn preferred_match<'a, I>(candidates: I) -> Option<&'a LedgerRow>
where
    I: IntoIterator<Item = &'a LedgerRow>,
{
    candidates
        .into_iter()
        .min_by(|a, b| {
            a.is_terminal()
                .cmp(&b.is_terminal())
                .then_with(|| b.created_at.cmp(&a.created_at))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> LedgerRow {
        LedgerRow::queued(NewLedgerRow::new(
            LedgerKind::StkPush,
            None,
            Environment::Sandbox,
        ))
    }

    fn callback(status: LedgerStatus) -> CallbackUpdate {
        CallbackUpdate {
            status,
            result_code: Some("0".to_string()),
            result_desc: Some("ok".to_string()),
            internal_status_code: 0,
            internal_status_message: "Success".to_string(),
            transaction_id: Some("RCV1".to_string()),
            amount: None,
            phone_number: None,
            correlation: CorrelationIds::default(),
            callback_payload: json!({"ResultCode": 0}),
        }
    }

    #[test]
    fn completed_is_an_alias_of_successful() {
        assert_eq!(
            LedgerStatus::from_str("completed").unwrap(),
            LedgerStatus::Successful
        );
        let parsed: LedgerStatus = serde_json::from_value(json!("completed")).unwrap();
        assert_eq!(parsed, LedgerStatus::Successful);
        assert_eq!(
            serde_json::to_value(LedgerStatus::Successful).unwrap(),
            json!("successful")
        );
    }

    #[test]
    fn terminal_statuses_absorb_events() {
        for terminal in [
            LedgerStatus::Successful,
            LedgerStatus::Failed,
            LedgerStatus::Cancelled,
            LedgerStatus::Timeout,
            LedgerStatus::Error,
        ] {
            assert!(terminal.is_terminal());
            assert_eq!(terminal.transition(LedgerStatus::Successful), terminal);
            assert_eq!(terminal.transition(LedgerStatus::Submitted), terminal);
        }
        assert_eq!(
            LedgerStatus::Queued.transition(LedgerStatus::Submitted),
            LedgerStatus::Submitted
        );
        assert_eq!(
            LedgerStatus::Submitted.transition(LedgerStatus::Queued),
            LedgerStatus::Submitted
        );
    }

    #[test]
    fn callback_on_queued_row_is_applied() {
        let mut row = row();
        assert!(row.apply_callback(&callback(LedgerStatus::Successful)));
        assert_eq!(row.status, LedgerStatus::Successful);
        assert_eq!(row.internal_status_code, Some(0));
        assert_eq!(row.transaction_id.as_deref(), Some("RCV1"));
        assert!(row.resolved_at.is_some());
    }

    #[test]
    fn late_submission_does_not_regress_terminal_row() {
        let mut row = row();
        row.apply_callback(&callback(LedgerStatus::Successful));

        let mut update = SubmissionUpdate::new(LedgerStatus::Submitted);
        update.correlation.checkout_request_id = Some("ws_CO_1".to_string());
        update.result_code = Some("0".to_string());

        assert!(!row.apply_submission(&update));
        assert_eq!(row.status, LedgerStatus::Successful);
        assert_eq!(
            row.correlation.checkout_request_id.as_deref(),
            Some("ws_CO_1")
        );
    }

    #[test]
    fn second_callback_is_ignored() {
        let mut row = row();
        row.apply_callback(&callback(LedgerStatus::Successful));

        let mut failed = callback(LedgerStatus::Failed);
        failed.result_code = Some("1032".to_string());
        assert!(!row.apply_callback(&failed));
        assert_eq!(row.status, LedgerStatus::Successful);
        assert_eq!(row.result_code.as_deref(), Some("0"));
    }

    #[test]
    fn filter_narrows_by_business_and_status() {
        let business = Uuid::new_v4();
        let mut mine = LedgerRow::queued(NewLedgerRow::new(
            LedgerKind::StkPush,
            Some(business),
            Environment::Sandbox,
        ));
        assert!(LedgerFilter::default().matches(&mine));
        assert!(LedgerFilter::business(business).matches(&mine));
        assert!(!LedgerFilter::business(Uuid::new_v4()).matches(&mine));
        assert!(!LedgerFilter::business(business).matches(&row()));

        let completed = LedgerFilter {
            status: Some(LedgerStatus::Successful),
            ..LedgerFilter::default()
        };
        assert!(!completed.matches(&mine));
        mine.apply_callback(&callback(LedgerStatus::Successful));
        assert!(completed.matches(&mine));

        let today = LedgerFilter {
            created_on: Some(mine.created_at.date_naive()),
            ..LedgerFilter::default()
        };
        assert!(today.matches(&mine));
        let yesterday = LedgerFilter {
            created_on: mine.created_at.date_naive().pred_opt(),
            ..LedgerFilter::default()
        };
        assert!(!yesterday.matches(&mine));
    }

    #[test]
    fn preferred_match_favours_open_then_recent_rows() {
        let mut closed = row();
        closed.status = LedgerStatus::Failed;
        let older_open = row();
        let mut newer_open = row();
        newer_open.created_at = older_open.created_at + chrono::Duration::seconds(5);

        let rows = [closed, older_open, newer_open.clone()];
        let picked = preferred_match(rows.iter()).unwrap();
        assert_eq!(picked.id, newer_open.id);
    }
}
