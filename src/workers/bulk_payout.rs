use crate::database::error::DatabaseError;
use crate::ledger::bulk::{item_result, BulkPayoutStore, ClaimedItem};
use crate::ledger::{LedgerKind, LedgerStatus, NewLedgerRow};
use crate::payments::requests::{
    b2c_payment_body, normalize_msisdn, whole_amount, B2cPaymentRequest, CallbackUrls,
};
use crate::payments::types::{DarajaEndpoint, ShortcodeType};
use crate::services::request_dispatcher::{DispatchOutcome, RequestDispatcher};
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const BULK_COMMAND_ID: &str = "BusinessPayment";

#[derive(Debug, Clone)]
pub struct BulkPayoutWorkerConfig {
    /// How often the worker looks for queued items
    pub poll_interval: Duration,
    /// Maximum number of items claimed per cycle
    pub batch_size: i64,
    /// Items of one cycle dispatched at the same time
    pub concurrency: usize,
}

impl Default for BulkPayoutWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 50,
            concurrency: 4,
        }
    }
}

impl BulkPayoutWorkerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.poll_interval = Duration::from_secs(
            std::env::var("BULK_PAYOUT_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(cfg.poll_interval.as_secs()),
        );
        cfg.batch_size = std::env::var("BULK_PAYOUT_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(cfg.batch_size);
        cfg.concurrency = std::env::var("BULK_PAYOUT_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(cfg.concurrency);
        cfg
    }
}

/// Dispatches queued bulk payout items as individual B2C requests
pub struct BulkPayoutWorker {
    store: Arc<dyn BulkPayoutStore>,
    dispatcher: Arc<RequestDispatcher>,
    callback_urls: CallbackUrls,
    config: BulkPayoutWorkerConfig,
}

impl BulkPayoutWorker {
    pub fn new(
        store: Arc<dyn BulkPayoutStore>,
        dispatcher: Arc<RequestDispatcher>,
        callback_urls: CallbackUrls,
        config: BulkPayoutWorkerConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            callback_urls,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            "bulk payout worker started"
        );

        loop {
            if *shutdown_rx.borrow() {
                info!("bulk payout worker stopping (shutdown signal)");
                break;
            }

            match self.run_cycle().await {
                Ok(0) => {}
                Ok(n) => info!(items = n, "bulk payout cycle dispatched items"),
                Err(e) => warn!(error = %e, "bulk payout cycle failed"),
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("bulk payout worker stopping (shutdown signal)");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Claim and dispatch one round of items. Returns how many were claimed.
    pub async fn run_cycle(&self) -> Result<usize, DatabaseError> {
        let claimed = self.store.claim_queued_items(self.config.batch_size).await?;
        let count = claimed.len();

        stream::iter(claimed)
            .for_each_concurrent(self.config.concurrency, |claimed_item| async move {
                let item_id = claimed_item.item.id;
                let batch_id = claimed_item.item.batch_id;
                if let Err(e) = self.process_item(claimed_item).await {
                    error!(item_id = %item_id, batch_id = %batch_id, error = %e, "bulk item dispatch failed");
                    if let Err(record_err) =
                        self.store.record_batch_error(batch_id, &e.to_string()).await
                    {
                        warn!(batch_id = %batch_id, error = %record_err, "failed to record batch error");
                    }
                }
            })
            .await;

        Ok(count)
    }

    async fn process_item(&self, claimed: ClaimedItem) -> Result<(), DatabaseError> {
        let ClaimedItem {
            item,
            business_id,
            environment,
        } = claimed;

        let phone = match normalize_msisdn(&item.recipient) {
            Ok(phone) => phone,
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "bulk item rejected");
                self.store
                    .update_item(
                        item.id,
                        LedgerStatus::Error,
                        json!({"status": LedgerStatus::Error, "error": e.user_message()}),
                    )
                    .await?;
                return Ok(());
            }
        };

        let originator_conversation_id = Uuid::new_v4().to_string();
        let mut new = NewLedgerRow::new(LedgerKind::B2cPayment, business_id, environment);
        new.bulk_item_id = Some(item.id);
        new.amount = Some(item.amount.clone());
        new.phone_number = Some(phone.clone());
        new.account_reference = Some(item.item_reference.clone()).filter(|r| !r.is_empty());
        new.correlation.originator_conversation_id = Some(originator_conversation_id.clone());

        let shortcode = match business_id {
            Some(business_id) => {
                self.dispatcher
                    .credentials()
                    .active_shortcode(business_id, &[ShortcodeType::B2c])
                    .await?
            }
            None => None,
        };

        let outcome = match shortcode {
            None => {
                let payload = json!({
                    "Amount": whole_amount(&item.amount),
                    "PartyB": phone,
                    "Remarks": item.item_reference,
                });
                self.dispatcher.missing_credentials(new, payload).await?
            }
            Some(shortcode) => {
                let result_url = self.callback_urls.b2c_result();
                let timeout_url = self.callback_urls.b2c_timeout();
                let remarks = if item.item_reference.is_empty() {
                    "Bulk payout".to_string()
                } else {
                    item.item_reference.clone()
                };
                let body = b2c_payment_body(&B2cPaymentRequest {
                    shortcode: &shortcode,
                    originator_conversation_id: &originator_conversation_id,
                    command_id: BULK_COMMAND_ID,
                    amount: &item.amount,
                    phone_number: &phone,
                    remarks: &remarks,
                    occasion: "",
                    result_url: &result_url,
                    timeout_url: &timeout_url,
                });
                match body {
                    Ok(body) => {
                        self.dispatcher
                            .dispatch(new, DarajaEndpoint::B2cPayment, body)
                            .await?
                    }
                    Err(e) => {
                        warn!(item_id = %item.id, error = %e, "B2C shortcode incomplete");
                        self.dispatcher
                            .missing_credentials(new, json!({"error": e.user_message()}))
                            .await?
                    }
                }
            }
        };

        self.record_outcome(item.id, &outcome).await
    }

    /// Link the item to its ledger row. Items already settled by a fast callback keep
    /// their terminal status.
    async fn record_outcome(
        &self,
        item_id: Uuid,
        outcome: &DispatchOutcome,
    ) -> Result<(), DatabaseError> {
        let row = &outcome.row;
        let result = item_result(
            row.status,
            row.id,
            Some(outcome.mapped.status_code),
            Some(&outcome.mapped.status_message),
            row.result_code.as_deref(),
            row.result_desc.as_deref(),
            row.transaction_id.as_deref(),
        );
        self.store.update_item(item_id, row.status, result).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::bulk::{BulkProduct, NewBulkBatch, NewBulkItem};
    use crate::ledger::memory::{InMemoryBulkPayoutStore, InMemoryLedgerStore};
    use crate::ledger::LedgerStore;
    use crate::payments::error::PaymentResult;
    use crate::payments::types::{DarajaCredential, Environment, VendorResponse};
    use crate::payments::DarajaGateway;
    use crate::services::credentials::{
        CredentialStore, InMemoryCredentialStore, NewCredential, NewShortcode,
    };
    use crate::status_codes::memory::InMemoryStatusCodeStore;
    use crate::status_codes::StatusRegistry;
    use async_trait::async_trait;
    use bigdecimal::BigDecimal;
    use serde_json::Value as JsonValue;

    struct AcceptingGateway;

    #[async_trait]
    impl DarajaGateway for AcceptingGateway {
        async fn access_token(&self, _credential: &DarajaCredential) -> PaymentResult<String> {
            Ok("token".to_string())
        }

        async fn post(
            &self,
            _credential: &DarajaCredential,
            _endpoint: DarajaEndpoint,
            body: &JsonValue,
        ) -> PaymentResult<VendorResponse> {
            Ok(VendorResponse {
                status: 200,
                body: json!({
                    "ConversationID": "AG_1",
                    "OriginatorConversationID": body["OriginatorConversationID"],
                    "ResponseCode": "0",
                    "ResponseDescription": "Accept the service request successfully.",
                }),
            })
        }

        fn environment_base_url(&self, _environment: Environment) -> String {
            "https://sandbox.example".to_string()
        }
    }

    async fn setup(
        configure: bool,
    ) -> (BulkPayoutWorker, Arc<InMemoryBulkPayoutStore>, Arc<InMemoryLedgerStore>, Uuid) {
        let bulk = Arc::new(InMemoryBulkPayoutStore::new());
        let ledger = Arc::new(InMemoryLedgerStore::with_bulk(bulk.clone()));
        let credentials = Arc::new(InMemoryCredentialStore::new());
        let business_id = Uuid::new_v4();
        if configure {
            credentials
                .upsert_credential(NewCredential {
                    business_id,
                    environment: Environment::Sandbox,
                    consumer_key: "key".to_string(),
                    consumer_secret: "secret".to_string(),
                    token_url: None,
                })
                .await
                .unwrap();
            credentials
                .upsert_shortcode(NewShortcode {
                    business_id,
                    shortcode: "600000".to_string(),
                    shortcode_type: ShortcodeType::B2c,
                    lipa_passkey: None,
                    initiator_name: Some("testapi".to_string()),
                    security_credential: Some("cred".to_string()),
                    set_active: true,
                })
                .await
                .unwrap();
        }
        let registry = StatusRegistry::new(Arc::new(InMemoryStatusCodeStore::new()));
        let dispatcher = Arc::new(RequestDispatcher::new(
            Arc::new(AcceptingGateway),
            registry,
            ledger.clone(),
            credentials,
        ));
        let worker = BulkPayoutWorker::new(
            bulk.clone(),
            dispatcher,
            CallbackUrls::new("https://gw.example.com"),
            BulkPayoutWorkerConfig::default(),
        );
        (worker, bulk, ledger, business_id)
    }

    async fn batch(store: &InMemoryBulkPayoutStore, business_id: Uuid, recipients: &[&str]) -> Uuid {
        let detail = store
            .create_batch(NewBulkBatch {
                product: BulkProduct::B2c,
                business_id: Some(business_id),
                environment: Environment::Sandbox,
                reference: "payroll".to_string(),
                meta: json!({}),
                items: recipients
                    .iter()
                    .map(|r| NewBulkItem {
                        recipient: r.to_string(),
                        amount: BigDecimal::from(100),
                        currency: "KES".to_string(),
                        item_reference: String::new(),
                        product_type: String::new(),
                    })
                    .collect(),
            })
            .await
            .unwrap();
        detail.batch.id
    }

    #[tokio::test]
    async fn cycle_dispatches_items_as_linked_b2c_rows() {
        let (worker, bulk, ledger, business_id) = setup(true).await;
        let batch_id = batch(&bulk, business_id, &["0708374149"]).await;

        assert_eq!(worker.run_cycle().await.unwrap(), 1);
        assert_eq!(worker.run_cycle().await.unwrap(), 0);

        let detail = bulk.get_batch(batch_id).await.unwrap().unwrap();
        let item = &detail.items[0];
        assert_eq!(item.status, LedgerStatus::Submitted);
        let ledger_id: Uuid = serde_json::from_value(item.result["ledger_id"].clone()).unwrap();

        let row = ledger
            .get(LedgerKind::B2cPayment, ledger_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.bulk_item_id, Some(item.id));
        assert_eq!(row.phone_number.as_deref(), Some("254708374149"));
        assert_eq!(row.correlation.conversation_id.as_deref(), Some("AG_1"));
    }

    #[tokio::test]
    async fn missing_shortcode_fails_item_with_error() {
        let (worker, bulk, _ledger, business_id) = setup(false).await;
        let batch_id = batch(&bulk, business_id, &["254708374149"]).await;

        worker.run_cycle().await.unwrap();

        let detail = bulk.get_batch(batch_id).await.unwrap().unwrap();
        assert_eq!(detail.items[0].status, LedgerStatus::Error);
        assert!(detail.items[0].result["status_code"].as_i64().is_some());
        assert_eq!(detail.batch.status, crate::ledger::bulk::BatchStatus::Completed);
    }

    #[tokio::test]
    async fn invalid_recipient_is_marked_error() {
        let (worker, bulk, _ledger, business_id) = setup(true).await;
        let batch_id = batch(&bulk, business_id, &["not-a-phone"]).await;

        worker.run_cycle().await.unwrap();

        let detail = bulk.get_batch(batch_id).await.unwrap().unwrap();
        assert_eq!(detail.items[0].status, LedgerStatus::Error);
        assert!(detail.items[0].result["error"]
            .as_str()
            .unwrap()
            .contains("invalid phone number"));
    }

    #[test]
    fn config_defaults() {
        let cfg = BulkPayoutWorkerConfig::default();
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.batch_size, 50);
        assert_eq!(cfg.concurrency, 4);
    }
}
