use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::database::error::DatabaseError;
use crate::ledger::audit::{CallbackLogStore, CallbackOutcome, NewCallbackLog};
use crate::ledger::{
    CallbackUpdate, CorrelationField, CorrelationIds, CorrelationKey, LedgerKind, LedgerRow,
    LedgerStatus, LedgerStore, NewLedgerRow, SettleOutcome,
};
use crate::payments::types::Environment;
use crate::services::callback_payloads::{self, ExtractedCallback, PayloadError};
use crate::status_codes::{ExternalSystem, MappedStatus, StatusRegistry, SUCCESS_EXTERNAL_CODE};

pub const TIMEOUT_EXTERNAL_CODE: &str = "TIMEOUT";
pub const STK_CANCELLED_CODE: &str = "1032";
pub const USSD_CANCELLED_CODE: &str = "4001";

/// Inbound asynchronous deliveries from Daraja
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Stk,
    B2cResult,
    B2cTimeout,
    B2bUssd,
    TransactionStatusResult,
    TransactionStatusTimeout,
    Ratiba,
    C2bConfirmation,
}

impl CallbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackKind::Stk => "stk_callback",
            CallbackKind::B2cResult => "b2c_result",
            CallbackKind::B2cTimeout => "b2c_timeout",
            CallbackKind::B2bUssd => "b2b_ussd_callback",
            CallbackKind::TransactionStatusResult => "transaction_status_result",
            CallbackKind::TransactionStatusTimeout => "transaction_status_timeout",
            CallbackKind::Ratiba => "ratiba_callback",
            CallbackKind::C2bConfirmation => "c2b_confirmation",
        }
    }

    pub fn ledger_kind(&self) -> LedgerKind {
        match self {
            CallbackKind::Stk => LedgerKind::StkPush,
            CallbackKind::B2cResult | CallbackKind::B2cTimeout => LedgerKind::B2cPayment,
            CallbackKind::B2bUssd => LedgerKind::B2bUssd,
            CallbackKind::TransactionStatusResult | CallbackKind::TransactionStatusTimeout => {
                LedgerKind::TransactionStatus
            }
            CallbackKind::Ratiba => LedgerKind::RatibaOrder,
            CallbackKind::C2bConfirmation => LedgerKind::C2bPayment,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CallbackKind::B2cTimeout | CallbackKind::TransactionStatusTimeout
        )
    }

    fn cancellation_code(&self) -> Option<&'static str> {
        match self {
            CallbackKind::Stk => Some(STK_CANCELLED_CODE),
            CallbackKind::B2bUssd => Some(USSD_CANCELLED_CODE),
            _ => None,
        }
    }

    /// Body Daraja expects back
    pub fn ack_body(&self) -> JsonValue {
        match self {
            CallbackKind::Stk => json!({"ResultCode": 0, "ResultDesc": "Received Successfully"}),
            CallbackKind::B2bUssd => json!({"ok": true}),
            _ => json!({"ResultCode": 0, "ResultDesc": "Accepted"}),
        }
    }
}

/// Final status a callback result moves a pending row to
pub fn classify(kind: CallbackKind, result_code: Option<&str>) -> LedgerStatus {
    if kind.is_timeout() {
        return LedgerStatus::Timeout;
    }
    match result_code.map(str::trim) {
        Some(SUCCESS_EXTERNAL_CODE) => LedgerStatus::Successful,
        Some(code) if Some(code) == kind.cancellation_code() => LedgerStatus::Cancelled,
        _ => LedgerStatus::Failed,
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallbackError {
    #[error("Invalid JSON")]
    InvalidPayload,

    #[error("missing correlation id")]
    MissingCorrelationId,
}

impl From<PayloadError> for CallbackError {
    fn from(err: PayloadError) -> Self {
        match err {
            PayloadError::NotAnObject => CallbackError::InvalidPayload,
            PayloadError::MissingCorrelationId => CallbackError::MissingCorrelationId,
        }
    }
}

/// What the webhook route answers with. `outcome` is `None` when the store failed.
#[derive(Debug, Clone)]
pub struct CallbackAck {
    pub outcome: Option<CallbackOutcome>,
    pub ledger_id: Option<Uuid>,
    pub body: JsonValue,
}

/// Ties Daraja callbacks back to the ledger rows that caused them
pub struct CallbackCorrelator {
    registry: StatusRegistry,
    ledger: Arc<dyn LedgerStore>,
    log: Arc<dyn CallbackLogStore>,
}

impl CallbackCorrelator {
    pub fn new(
        registry: StatusRegistry,
        ledger: Arc<dyn LedgerStore>,
        log: Arc<dyn CallbackLogStore>,
    ) -> Self {
        Self {
            registry,
            ledger,
            log,
        }
    }

    /// Correlate and apply one callback.
    ///
    /// Only structurally invalid payloads are errors. Misses and store failures are
    /// logged and still acknowledged.
    pub async fn handle(
        &self,
        kind: CallbackKind,
        payload: &JsonValue,
        order_id: Option<&str>,
    ) -> Result<CallbackAck, CallbackError> {
        let extracted = match kind {
            CallbackKind::C2bConfirmation => return self.confirm_c2b(payload).await,
            CallbackKind::Stk => callback_payloads::extract_stk(payload),
            CallbackKind::B2cResult | CallbackKind::B2cTimeout => {
                callback_payloads::extract_b2c_result(payload)
            }
            CallbackKind::B2bUssd => callback_payloads::extract_b2b_ussd(payload),
            CallbackKind::TransactionStatusResult | CallbackKind::TransactionStatusTimeout => {
                callback_payloads::extract_transaction_status(payload)
            }
            CallbackKind::Ratiba => callback_payloads::extract_ratiba(payload, order_id),
        }
        .map_err(|e| {
            warn!(kind = kind.as_str(), error = %e, "rejected callback payload");
            CallbackError::from(e)
        })?;

        let outcome = match self.settle(kind, &extracted, payload).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(
                    kind = kind.as_str(),
                    correlation_id = ?extracted.correlation_id,
                    error = %e,
                    "failed to apply callback"
                );
                None
            }
        };

        let ledger_id = outcome.as_ref().and_then(|o| o.row()).map(|row| row.id);
        let audit_outcome = outcome.as_ref().map(CallbackOutcome::from);
        match &outcome {
            Some(SettleOutcome::Applied(row)) => info!(
                kind = kind.as_str(),
                correlation_id = ?extracted.correlation_id,
                ledger_id = %row.id,
                status = %row.status,
                "callback applied"
            ),
            Some(SettleOutcome::IgnoredTerminal(row)) => info!(
                kind = kind.as_str(),
                correlation_id = ?extracted.correlation_id,
                ledger_id = %row.id,
                status = %row.status,
                "callback for terminal row ignored"
            ),
            Some(SettleOutcome::Unmatched) => warn!(
                kind = kind.as_str(),
                correlation_id = ?extracted.correlation_id,
                "callback matched no request"
            ),
            None => {}
        }

        if let Some(audit_outcome) = audit_outcome {
            self.audit(
                kind,
                extracted.correlation_id.clone(),
                ledger_id,
                audit_outcome,
                extracted.result_code.clone(),
                extracted.result_desc.clone(),
                payload,
            )
            .await;
        }

        Ok(CallbackAck {
            outcome: audit_outcome,
            ledger_id,
            body: kind.ack_body(),
        })
    }

    async fn settle(
        &self,
        kind: CallbackKind,
        extracted: &ExtractedCallback,
        payload: &JsonValue,
    ) -> Result<SettleOutcome, DatabaseError> {
        // Codes are only allocated for callbacks that will change a row
        match self.ledger.find(kind.ledger_kind(), &extracted.keys).await? {
            None => return Ok(SettleOutcome::Unmatched),
            Some(row) if row.is_terminal() => return Ok(SettleOutcome::IgnoredTerminal(row)),
            Some(_) => {}
        }

        let status = classify(kind, extracted.result_code.as_deref());
        let mapped = self.map_result(kind, extracted).await?;

        let update = CallbackUpdate {
            status,
            result_code: extracted.result_code.clone(),
            result_desc: extracted.result_desc.clone(),
            internal_status_code: mapped.status_code,
            internal_status_message: mapped.status_message,
            transaction_id: extracted.transaction_id.clone(),
            amount: extracted.amount.clone(),
            phone_number: extracted.phone_number.clone(),
            correlation: extracted.correlation.clone(),
            callback_payload: payload.clone(),
        };

        self.ledger
            .settle(kind.ledger_kind(), &extracted.keys, update)
            .await
    }

    async fn map_result(
        &self,
        kind: CallbackKind,
        extracted: &ExtractedCallback,
    ) -> Result<MappedStatus, DatabaseError> {
        let desc = extracted.result_desc.as_deref();
        match extracted.result_code.as_deref() {
            None if kind.is_timeout() => {
                self.registry
                    .map(ExternalSystem::Gateway, TIMEOUT_EXTERNAL_CODE, desc, None)
                    .await
            }
            code => {
                self.registry
                    .map_vendor_status(code.unwrap_or_default(), desc)
                    .await
            }
        }
    }

    /// C2B confirmations create their own row, already successful. A repeated `TransID`
    /// leaves the existing row alone.
    async fn confirm_c2b(&self, payload: &JsonValue) -> Result<CallbackAck, CallbackError> {
        let kind = CallbackKind::C2bConfirmation;
        let confirmation = callback_payloads::extract_c2b_confirmation(payload)?;
        let transaction_id = confirmation.transaction_id.clone();

        let result: Result<(CallbackOutcome, LedgerRow), DatabaseError> = async {
            let key = CorrelationKey::field(CorrelationField::TransactionId, transaction_id.clone());
            if let Some(existing) = self
                .ledger
                .find(LedgerKind::C2bPayment, std::slice::from_ref(&key))
                .await?
            {
                return Ok((CallbackOutcome::IgnoredTerminal, existing));
            }

            let mapped = self
                .registry
                .map_vendor_status(SUCCESS_EXTERNAL_CODE, None)
                .await?;

            let mut new = NewLedgerRow::new(LedgerKind::C2bPayment, None, Environment::default());
            new.transaction_id = Some(transaction_id.clone());
            new.amount = confirmation.amount.clone();
            new.phone_number = confirmation.phone_number.clone();
            new.account_reference = confirmation.account_reference.clone();
            new.request_payload = payload.clone();

            let mut row = LedgerRow::queued(new);
            row.apply_callback(&CallbackUpdate {
                status: LedgerStatus::Successful,
                result_code: Some(SUCCESS_EXTERNAL_CODE.to_string()),
                result_desc: Some("C2B Confirmation".to_string()),
                internal_status_code: mapped.status_code,
                internal_status_message: mapped.status_message,
                transaction_id: Some(transaction_id.clone()),
                amount: confirmation.amount.clone(),
                phone_number: confirmation.phone_number.clone(),
                correlation: CorrelationIds::default(),
                callback_payload: payload.clone(),
            });

            match self.ledger.insert(row).await {
                Ok(row) => Ok((CallbackOutcome::Applied, row)),
                Err(e) if e.is_unique_violation() => {
                    // Concurrent delivery of the same TransID won
                    match self
                        .ledger
                        .find(LedgerKind::C2bPayment, std::slice::from_ref(&key))
                        .await?
                    {
                        Some(existing) => Ok((CallbackOutcome::IgnoredTerminal, existing)),
                        None => Err(e),
                    }
                }
                Err(e) => Err(e),
            }
        }
        .await;

        let (outcome, ledger_id) = match result {
            Ok((outcome, row)) => {
                info!(
                    kind = kind.as_str(),
                    correlation_id = %transaction_id,
                    ledger_id = %row.id,
                    outcome = outcome.as_str(),
                    "c2b confirmation recorded"
                );
                (Some(outcome), Some(row.id))
            }
            Err(e) => {
                error!(
                    kind = kind.as_str(),
                    correlation_id = %transaction_id,
                    error = %e,
                    "failed to record c2b confirmation"
                );
                (None, None)
            }
        };

        if let Some(outcome) = outcome {
            self.audit(
                kind,
                Some(transaction_id),
                ledger_id,
                outcome,
                Some(SUCCESS_EXTERNAL_CODE.to_string()),
                Some("C2B Confirmation".to_string()),
                payload,
            )
            .await;
        }

        Ok(CallbackAck {
            outcome,
            ledger_id,
            body: kind.ack_body(),
        })
    }

    async fn audit(
        &self,
        kind: CallbackKind,
        correlation_id: Option<String>,
        ledger_id: Option<Uuid>,
        outcome: CallbackOutcome,
        result_code: Option<String>,
        result_desc: Option<String>,
        payload: &JsonValue,
    ) {
        let entry = NewCallbackLog {
            kind: kind.as_str().to_string(),
            correlation_id,
            ledger_id,
            outcome,
            result_code,
            result_desc,
            content: payload.clone(),
        };
        if let Err(e) = self.log.record(entry).await {
            error!(kind = kind.as_str(), error = %e, "failed to write callback audit entry");
        }
    }
}
