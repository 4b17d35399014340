//! Outbound request lifecycle: record a `queued` row, call Daraja, store the
//! synchronous answer.

use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tracing::{info, warn};

use crate::database::error::DatabaseError;
use crate::ledger::{
    CorrelationIds, LedgerKind, LedgerRow, LedgerStatus, LedgerStore, NewLedgerRow,
    SubmissionUpdate,
};
use crate::payments::error::PaymentError;
use crate::payments::types::{DarajaCredential, DarajaEndpoint, VendorResponse};
use crate::payments::DarajaGateway;
use crate::services::credentials::CredentialStore;
use crate::status_codes::{code_from_json, ExternalSystem, MappedStatus, StatusRegistry};

pub const MISSING_CREDENTIALS_CODE: &str = "MISSING_CREDENTIALS";
pub const TIMEOUT_CODE: &str = "TIMEOUT";
pub const NETWORK_ERROR_CODE: &str = "NETWORK_ERROR";
pub const TOKEN_ERROR_CODE: &str = "TOKEN_ERROR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// Accepted upstream, waiting for a callback
    Submitted,
    /// Upstream answered with a final result (QR)
    Final,
    /// No active credential or shortcode for the business
    MissingCredentials,
    /// Upstream answered non-2xx
    VendorError,
    /// Timeout, connection failure or token failure
    TransportError,
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub row: LedgerRow,
    pub mapped: MappedStatus,
    pub result: DispatchResult,
    /// Upstream body or error description handed back to the integrator
    pub details: JsonValue,
}

impl DispatchOutcome {
    pub fn http_status(&self) -> u16 {
        match self.result {
            DispatchResult::Submitted | DispatchResult::Final => 201,
            DispatchResult::MissingCredentials => 400,
            DispatchResult::VendorError | DispatchResult::TransportError => 502,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(
            self.result,
            DispatchResult::Submitted | DispatchResult::Final
        )
    }
}

/// Decides whether a 2xx upstream answer is already final. Only QR generation is.
fn final_status(kind: LedgerKind, code: Option<&str>) -> Option<LedgerStatus> {
    if kind != LedgerKind::QrCode {
        return None;
    }
    match code {
        Some("00") | Some("0") => Some(LedgerStatus::Successful),
        _ => Some(LedgerStatus::Failed),
    }
}

/// Code and description of a 2xx answer; key names differ per product
fn response_code(body: &JsonValue) -> (Option<String>, Option<String>) {
    let code = ["ResponseCode", "responseCode", "code"]
        .iter()
        .find_map(|k| code_from_json(body.get(*k)))
        .or_else(|| code_from_json(body.get("ResponseHeader").and_then(|h| h.get("responseCode"))));
    let desc = [
        "ResponseDescription",
        "responseDescription",
        "CustomerMessage",
        "status",
    ]
    .iter()
    .find_map(|k| code_from_json(body.get(*k)))
    .or_else(|| {
        code_from_json(
            body.get("ResponseHeader")
                .and_then(|h| h.get("responseDescription")),
        )
    });
    (code, desc)
}

fn response_correlation(body: &JsonValue) -> CorrelationIds {
    let field = |keys: &[&str]| keys.iter().find_map(|k| code_from_json(body.get(*k)));
    CorrelationIds {
        checkout_request_id: field(&["CheckoutRequestID"]),
        merchant_request_id: field(&["MerchantRequestID"]),
        originator_conversation_id: field(&["OriginatorConversationID", "OriginatorConverstionID"]),
        conversation_id: field(&["ConversationID", "conversationID"]),
        request_ref_id: None,
    }
}

pub struct RequestDispatcher {
    gateway: Arc<dyn DarajaGateway>,
    registry: StatusRegistry,
    ledger: Arc<dyn LedgerStore>,
    credentials: Arc<dyn CredentialStore>,
}

impl RequestDispatcher {
    pub fn new(
        gateway: Arc<dyn DarajaGateway>,
        registry: StatusRegistry,
        ledger: Arc<dyn LedgerStore>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            gateway,
            registry,
            ledger,
            credentials,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn DarajaGateway> {
        &self.gateway
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    /// Record the request, call `endpoint` with `payload` and store the synchronous
    /// outcome. Only store failures are errors; upstream failures are outcomes.
    pub async fn dispatch(
        &self,
        mut new: NewLedgerRow,
        endpoint: DarajaEndpoint,
        payload: JsonValue,
    ) -> Result<DispatchOutcome, DatabaseError> {
        new.request_payload = payload.clone();
        let row = self.ledger.insert(LedgerRow::queued(new)).await?;

        let credential = match row.business_id {
            Some(business_id) => {
                self.credentials
                    .active_credential(business_id, row.environment)
                    .await?
            }
            None => None,
        };
        let Some(credential) = credential else {
            return self.missing_credentials_for(row).await;
        };

        self.submit(row, &credential, endpoint, &payload).await
    }

    /// Record a request that cannot be sent because the business lacks a credential or
    /// shortcode
    pub async fn missing_credentials(
        &self,
        mut new: NewLedgerRow,
        payload: JsonValue,
    ) -> Result<DispatchOutcome, DatabaseError> {
        new.request_payload = payload;
        let row = self.ledger.insert(LedgerRow::queued(new)).await?;
        self.missing_credentials_for(row).await
    }

    async fn missing_credentials_for(
        &self,
        row: LedgerRow,
    ) -> Result<DispatchOutcome, DatabaseError> {
        warn!(
            kind = %row.kind,
            ledger_id = %row.id,
            business_id = ?row.business_id,
            environment = %row.environment,
            "Daraja credentials not configured"
        );
        let details = json!({"error": "Daraja credentials not configured for this business"});
        self.fail(
            row,
            ExternalSystem::Gateway,
            MISSING_CREDENTIALS_CODE,
            Some("Daraja credentials not configured for this business"),
            details,
            DispatchResult::MissingCredentials,
        )
        .await
    }

    async fn submit(
        &self,
        row: LedgerRow,
        credential: &DarajaCredential,
        endpoint: DarajaEndpoint,
        payload: &JsonValue,
    ) -> Result<DispatchOutcome, DatabaseError> {
        match self.gateway.post(credential, endpoint, payload).await {
            Ok(response) if response.is_success() => self.accepted(row, response).await,
            Ok(response) => self.rejected(row, response).await,
            Err(e) => self.transport_failed(row, e).await,
        }
    }

    async fn accepted(
        &self,
        row: LedgerRow,
        response: VendorResponse,
    ) -> Result<DispatchOutcome, DatabaseError> {
        let body = response.body_object();
        let (code, desc) = response_code(&body);
        let final_status = final_status(row.kind, code.as_deref());

        let mut update = SubmissionUpdate::new(final_status.unwrap_or(LedgerStatus::Submitted));
        update.correlation = response_correlation(&body);
        update.result_code = code.clone();
        update.result_desc = desc.clone();
        update.response_payload = Some(body.clone());

        let mapped = match self
            .registry
            .map_vendor_status(code.as_deref().unwrap_or_default(), desc.as_deref())
            .await
        {
            Ok(mapped) => mapped,
            Err(e) => return self.store_unmapped(row, update, e).await,
        };
        update.internal_status_code = Some(mapped.status_code);
        update.internal_status_message = Some(mapped.status_message.clone());

        let row = self.store_submission(row, update).await?;
        info!(
            kind = %row.kind,
            ledger_id = %row.id,
            status = %row.status,
            status_code = mapped.status_code,
            "Daraja request accepted"
        );

        Ok(DispatchOutcome {
            row,
            mapped,
            result: if final_status.is_some() {
                DispatchResult::Final
            } else {
                DispatchResult::Submitted
            },
            details: body,
        })
    }

    async fn rejected(
        &self,
        row: LedgerRow,
        response: VendorResponse,
    ) -> Result<DispatchOutcome, DatabaseError> {
        let body = response.body_object();
        let error_code = code_from_json(body.get("errorCode"));
        let error_message = code_from_json(body.get("errorMessage"));

        warn!(
            kind = %row.kind,
            ledger_id = %row.id,
            http_status = response.status,
            error_code = ?error_code,
            "Daraja rejected request"
        );

        match error_code {
            Some(code) => {
                self.fail(
                    row,
                    ExternalSystem::Safaricom,
                    &code,
                    error_message.as_deref(),
                    body,
                    DispatchResult::VendorError,
                )
                .await
            }
            None => {
                let code = format!("HTTP_{}", response.status);
                self.fail(
                    row,
                    ExternalSystem::Gateway,
                    &code,
                    error_message.as_deref(),
                    body,
                    DispatchResult::VendorError,
                )
                .await
            }
        }
    }

    async fn transport_failed(
        &self,
        row: LedgerRow,
        error: PaymentError,
    ) -> Result<DispatchOutcome, DatabaseError> {
        let code = match &error {
            PaymentError::Timeout { .. } => TIMEOUT_CODE,
            PaymentError::AuthenticationError { .. } => TOKEN_ERROR_CODE,
            _ => NETWORK_ERROR_CODE,
        };
        warn!(
            kind = %row.kind,
            ledger_id = %row.id,
            error = %error,
            "Daraja request failed"
        );
        let details = json!({"error": error.to_string()});
        self.fail(
            row,
            ExternalSystem::Gateway,
            code,
            Some(&error.user_message()),
            details,
            DispatchResult::TransportError,
        )
        .await
    }

    async fn fail(
        &self,
        row: LedgerRow,
        system: ExternalSystem,
        code: &str,
        message: Option<&str>,
        details: JsonValue,
        result: DispatchResult,
    ) -> Result<DispatchOutcome, DatabaseError> {
        let mut update = SubmissionUpdate::new(LedgerStatus::Error);
        update.result_code = Some(code.to_string());
        update.result_desc = message.map(str::to_string);
        update.error_payload = Some(details.clone());

        let mapped = match self.registry.map(system, code, message, None).await {
            Ok(mapped) => mapped,
            Err(e) => return self.store_unmapped(row, update, e).await,
        };
        update.internal_status_code = Some(mapped.status_code);
        update.internal_status_message = Some(mapped.status_message.clone());

        let row = self.store_submission(row, update).await?;
        Ok(DispatchOutcome {
            row,
            mapped,
            result,
            details,
        })
    }

    /// The registry failed: store the outcome without an internal code so the row does
    /// not stay `queued`, then report the registry error.
    async fn store_unmapped(
        &self,
        row: LedgerRow,
        update: SubmissionUpdate,
        error: DatabaseError,
    ) -> Result<DispatchOutcome, DatabaseError> {
        warn!(
            kind = %row.kind,
            ledger_id = %row.id,
            status = %update.status,
            error = %error,
            "status mapping failed, storing outcome without internal code"
        );
        let ledger_id = row.id;
        if let Err(e) = self.store_submission(row, update).await {
            warn!(ledger_id = %ledger_id, error = %e, "failed to store unmapped outcome");
        }
        Err(error)
    }

    async fn store_submission(
        &self,
        row: LedgerRow,
        update: SubmissionUpdate,
    ) -> Result<LedgerRow, DatabaseError> {
        let mut local = row.clone();
        let stored = self
            .ledger
            .record_submission(row.kind, row.id, update.clone())
            .await?;
        // Only reachable if the row vanished between insert and update
        Ok(stored.unwrap_or_else(|| {
            local.apply_submission(&update);
            local
        }))
    }
}
