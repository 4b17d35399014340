//! HTTP surface: Daraja webhooks, integrator routes and internal routes

pub mod b2b;
pub mod b2c;
pub mod bulk;
pub mod c2b;
pub mod callbacks;
mod common;
pub mod maintainer;
pub mod qr;
pub mod ratiba;
pub mod status_codes;
pub mod status_query;
pub mod stk;

use crate::auth::{require_internal_api_key, InMemoryTokenIntrospector, TokenIntrospector};
use crate::database::bulk_payout_repository::BulkPayoutRepository;
use crate::database::business_repository::BusinessRepository;
use crate::database::callback_log_repository::CallbackLogRepository;
use crate::database::ledger_repository::LedgerRepository;
use crate::database::oauth_token_repository::OAuthTokenRepository;
use crate::database::status_code_repository::StatusCodeRepository;
use crate::ledger::audit::{CallbackLogStore, InMemoryCallbackLog};
use crate::ledger::bulk::BulkPayoutStore;
use crate::ledger::memory::{InMemoryBulkPayoutStore, InMemoryLedgerStore};
use crate::ledger::LedgerStore;
use crate::payments::{CallbackUrls, DarajaGateway};
use crate::services::credentials::{CredentialStore, InMemoryCredentialStore};
use crate::services::tenancy::{InMemoryTenancyStore, TenancyStore};
use crate::services::{CallbackCorrelator, RequestDispatcher, TenancyResolver};
use crate::status_codes::memory::InMemoryStatusCodeStore;
use crate::status_codes::{StatusCodeStore, StatusRegistry};
use axum::{
    middleware::from_fn_with_state,
    routing::{get, post, put},
    Router,
};
use sqlx::PgPool;
use std::sync::Arc;

/// Every durable store the gateway talks to
#[derive(Clone)]
pub struct Stores {
    pub status_codes: Arc<dyn StatusCodeStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub bulk: Arc<dyn BulkPayoutStore>,
    pub callback_log: Arc<dyn CallbackLogStore>,
    pub tenancy: Arc<dyn TenancyStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub tokens: Arc<dyn TokenIntrospector>,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        let business = Arc::new(BusinessRepository::new(pool.clone()));
        Self {
            status_codes: Arc::new(StatusCodeRepository::new(pool.clone())),
            ledger: Arc::new(LedgerRepository::new(pool.clone())),
            bulk: Arc::new(BulkPayoutRepository::new(pool.clone())),
            callback_log: Arc::new(CallbackLogRepository::new(pool.clone())),
            tenancy: business.clone(),
            credentials: business,
            tokens: Arc::new(OAuthTokenRepository::new(pool)),
        }
    }

    /// Process-local stores for tests and demos. `tokens` is returned separately so
    /// callers can register bearer tokens.
    pub fn in_memory() -> (Self, Arc<InMemoryTokenIntrospector>) {
        let bulk = Arc::new(InMemoryBulkPayoutStore::new());
        let tokens = Arc::new(InMemoryTokenIntrospector::new());
        let stores = Self {
            status_codes: Arc::new(InMemoryStatusCodeStore::new()),
            ledger: Arc::new(InMemoryLedgerStore::with_bulk(bulk.clone())),
            bulk,
            callback_log: Arc::new(InMemoryCallbackLog::new()),
            tenancy: Arc::new(InMemoryTenancyStore::new()),
            credentials: Arc::new(InMemoryCredentialStore::new()),
            tokens: tokens.clone(),
        };
        (stores, tokens)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    pub registry: StatusRegistry,
    pub tenancy: Arc<TenancyResolver>,
    pub correlator: Arc<CallbackCorrelator>,
    pub dispatcher: Arc<RequestDispatcher>,
    pub callback_urls: CallbackUrls,
    pub internal_api_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        stores: Stores,
        gateway: Arc<dyn DarajaGateway>,
        callback_urls: CallbackUrls,
        internal_api_key: Option<String>,
    ) -> Self {
        let registry = StatusRegistry::new(stores.status_codes.clone());
        let correlator = CallbackCorrelator::new(
            registry.clone(),
            stores.ledger.clone(),
            stores.callback_log.clone(),
        );
        let dispatcher = RequestDispatcher::new(
            gateway,
            registry.clone(),
            stores.ledger.clone(),
            stores.credentials.clone(),
        );
        let internal_api_key = internal_api_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .map(Arc::from);

        Self {
            tenancy: Arc::new(TenancyResolver::new(stores.tenancy.clone())),
            correlator: Arc::new(correlator),
            dispatcher: Arc::new(dispatcher),
            registry,
            stores,
            callback_urls,
            internal_api_key,
        }
    }
}

fn webhook_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/c2b/stk/callback", post(callbacks::stk_callback))
        .route("/api/v1/c2b/validation", post(callbacks::c2b_validation))
        .route("/api/v1/c2b/confirmation", post(callbacks::c2b_confirmation))
        .route("/api/v1/b2c/callback/result", post(callbacks::b2c_result))
        .route("/api/v1/b2c/callback/timeout", post(callbacks::b2c_timeout))
        .route("/api/v1/b2b/ussd/callback", post(callbacks::b2b_ussd_result))
        .route(
            "/api/v1/mpesa/transaction-status/result",
            post(callbacks::transaction_status_result),
        )
        .route(
            "/api/v1/mpesa/transaction-status/timeout",
            post(callbacks::transaction_status_timeout),
        )
        .route("/api/v1/ratiba/callback", post(callbacks::ratiba_callback))
}

fn integrator_routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/c2b/stk/push", post(stk::initiate_stk_push))
        .route("/api/v1/c2b/stk/{id}", get(stk::get_stk_push))
        .route("/api/v1/b2c/single", post(b2c::initiate_b2c_payment))
        .route("/api/v1/b2c/single/list", get(b2c::list_b2c_payments))
        .route("/api/v1/b2c/single/{id}", get(b2c::get_b2c_payment))
        .route("/api/v1/b2b/ussd/push", post(b2b::initiate_ussd_push))
        .route("/api/v1/b2b/ussd/{id}", get(b2b::get_ussd_push))
        .route(
            "/api/v1/mpesa/transaction-status",
            post(status_query::query_transaction_status),
        )
        .route(
            "/api/v1/mpesa/transaction-status/{id}",
            get(status_query::get_transaction_status),
        )
        .route("/api/v1/ratiba/orders", post(ratiba::create_standing_order))
        .route("/api/v1/ratiba/orders/{id}", get(ratiba::get_standing_order))
        .route("/api/v1/ratiba/history", get(ratiba::ratiba_history))
        .route("/api/v1/qr/generate", post(qr::generate_qr_code))
        .route("/api/v1/qr/history", get(qr::qr_history))
        .route("/api/v1/qr/{id}", get(qr::get_qr_code))
        .route("/api/v1/status-codes", get(status_codes::list_status_codes))
}

fn internal_routes(internal_api_key: Option<Arc<str>>) -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/b2c/bulk",
            post(bulk::create_b2c_batch).get(bulk::list_b2c_batches),
        )
        .route("/api/v1/b2c/bulk/list", get(bulk::list_b2c_batches))
        .route("/api/v1/b2c/bulk/{id}", get(bulk::get_b2c_batch))
        .route(
            "/api/v1/b2b/bulk",
            post(bulk::create_b2b_batch).get(bulk::list_b2b_batches),
        )
        .route("/api/v1/b2b/bulk/list", get(bulk::list_b2b_batches))
        .route("/api/v1/b2b/bulk/{id}", get(bulk::get_b2b_batch))
        .route(
            "/api/v1/c2b/transactions/all",
            get(c2b::all_transactions),
        )
        .route(
            "/api/v1/c2b/transactions/completed",
            get(c2b::completed_transactions),
        )
        .route(
            "/api/v1/status-codes/export.md",
            get(status_codes::export_status_codes),
        )
        .route(
            "/api/v1/maintainer/businesses",
            post(maintainer::create_business),
        )
        .route(
            "/api/v1/maintainer/businesses/{id}/status",
            put(maintainer::set_business_status),
        )
        .route(
            "/api/v1/maintainer/businesses/{id}/credentials",
            put(maintainer::upsert_credential),
        )
        .route(
            "/api/v1/maintainer/businesses/{id}/shortcodes",
            put(maintainer::upsert_shortcode),
        )
        .route(
            "/api/v1/maintainer/clients/{client_id}/binding",
            put(maintainer::rebind_client).delete(maintainer::unbind_client),
        )
        .route(
            "/api/v1/maintainer/callbacks",
            get(maintainer::list_callbacks),
        )
        .route_layer(from_fn_with_state(
            internal_api_key,
            require_internal_api_key,
        ))
}

/// All gateway routes. Health, request ids and tracing layers are added by the binary.
pub fn router(state: AppState) -> Router {
    let internal_api_key = state.internal_api_key.clone();
    Router::new()
        .merge(webhook_routes())
        .merge(integrator_routes())
        .merge(internal_routes(internal_api_key))
        .with_state(state)
}
