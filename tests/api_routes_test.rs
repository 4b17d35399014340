//! Integration tests for the HTTP routes
//!
//! Tests cover:
//! - Webhook parsing and acknowledgements
//! - Internal API key guard
//! - Bearer token scopes on integrator routes
//! - Business resolution for integrator reads and writes
//! - History listings and bulk batch routes
//! - Maintainer business and binding management

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use mpesa_gateway::api::{self, AppState, Stores};
use mpesa_gateway::auth::InMemoryTokenIntrospector;
use mpesa_gateway::ledger::{LedgerKind, LedgerRow, NewLedgerRow};
use mpesa_gateway::payments::types::ShortcodeType;
use mpesa_gateway::payments::{
    CallbackUrls, DarajaCredential, DarajaEndpoint, DarajaGateway, Environment, PaymentResult,
    VendorResponse,
};
use mpesa_gateway::services::credentials::{NewCredential, NewShortcode};
use mpesa_gateway::services::Business;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const INTERNAL_KEY: &str = "internal-secret";

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
        _body: &Value,
    ) -> PaymentResult<VendorResponse> {
        Ok(VendorResponse {
            status: 200,
            body: json!({
                "MerchantRequestID": "29115-9",
                "CheckoutRequestID": "ws_CO_api",
                "ResponseCode": "0",
                "ResponseDescription": "Success. Request accepted for processing",
                "CustomerMessage": "Success. Request accepted for processing"
            }),
        })
    }

    fn environment_base_url(&self, _environment: Environment) -> String {
        "https://sandbox.example".to_string()
    }
}

struct TestApp {
    router: Router,
    state: AppState,
    tokens: Arc<InMemoryTokenIntrospector>,
}

fn create_test_app(internal_key: Option<&str>) -> TestApp {
    let (stores, tokens) = Stores::in_memory();
    let state = AppState::new(
        stores,
        Arc::new(AcceptingGateway),
        CallbackUrls::new("https://gw.example.com"),
        internal_key.map(str::to_string),
    );
    TestApp {
        router: api::router(state.clone()),
        state,
        tokens,
    }
}

/// A business with sandbox credentials and a Paybill shortcode
async fn configured_business(state: &AppState, name: &str) -> Business {
    let business = state.tenancy.store().create_business(name).await.unwrap();
    let credentials = state.dispatcher.credentials();
    credentials
        .upsert_credential(NewCredential {
            business_id: business.id,
            environment: Environment::Sandbox,
            consumer_key: "key".to_string(),
            consumer_secret: "secret".to_string(),
            token_url: None,
        })
        .await
        .unwrap();
    credentials
        .upsert_shortcode(NewShortcode {
            business_id: business.id,
            shortcode: "174379".to_string(),
            shortcode_type: ShortcodeType::Paybill,
            lipa_passkey: Some("passkey".to_string()),
            initiator_name: None,
            security_credential: None,
            set_active: true,
        })
        .await
        .unwrap();
    business
}

async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    auth: Option<(&str, &str)>,
    body: &str,
) -> (StatusCode, Value) {
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some((name, value)) = auth {
        request = request.header(name, value);
    }
    let response = router
        .clone()
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

#[tokio::test]
async fn test_webhook_rejects_invalid_json() {
    let app = create_test_app(None);

    let (status, body) = send(&app.router, Method::POST, "/api/v1/c2b/stk/callback", None, "{").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "Invalid JSON"}));

    let (status, body) = send(&app.router, Method::POST, "/api/v1/b2c/callback/result", None, "[]").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "Invalid JSON"}));
}

#[tokio::test]
async fn test_webhook_acknowledges_unknown_request() {
    let app = create_test_app(None);
    let callback = json!({"Body": {"stkCallback": {
        "MerchantRequestID": "nope",
        "CheckoutRequestID": "ws_CO_nope",
        "ResultCode": 0,
        "ResultDesc": "Processed"
    }}});

    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/v1/c2b/stk/callback",
        None,
        &callback.to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ResultCode": 0, "ResultDesc": "Received Successfully"}));

    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/v1/c2b/stk/callback",
        None,
        r#"{"Body": {"stkCallback": {"ResultCode": 0}}}"#,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "missing correlation id"}));
}

#[tokio::test]
async fn test_c2b_validation_always_accepts() {
    let app = create_test_app(None);

    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/v1/c2b/validation",
        None,
        r#"{"TransID": "RKTQDM7W6S", "TransAmount": "10"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ResultCode": 0, "ResultDesc": "Accepted"}));
}

#[tokio::test]
async fn test_internal_routes_require_api_key() {
    let app = create_test_app(Some(INTERNAL_KEY));

    let (status, _) = send(&app.router, Method::GET, "/api/v1/b2c/bulk", None, "").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app.router,
        Method::GET,
        "/api/v1/b2c/bulk",
        Some(("x-api-key", "wrong")),
        "",
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        &app.router,
        Method::GET,
        "/api/v1/b2c/bulk",
        Some(("x-api-key", INTERNAL_KEY)),
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"results": []}));

    let unset = create_test_app(None);
    let (status, _) = send(
        &unset.router,
        Method::GET,
        "/api/v1/b2c/bulk",
        Some(("x-api-key", INTERNAL_KEY)),
        "",
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_stk_push_requires_scope() {
    let app = create_test_app(None);
    let business = configured_business(&app.state, "Duka").await;
    app.tokens.insert("read-only", "client-a", &["c2b:read"]).await;

    let request = json!({"business_id": business.id, "phone_number": "0708374149", "amount": 10});
    let (status, _) = send(
        &app.router,
        Method::POST,
        "/api/v1/c2b/stk/push",
        None,
        &request.to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app.router,
        Method::POST,
        "/api/v1/c2b/stk/push",
        Some(("authorization", &bearer("read-only"))),
        &request.to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_stk_push_then_callback_then_read() {
    let app = create_test_app(None);
    let business = configured_business(&app.state, "Duka").await;
    app.tokens
        .insert("tok-a", "client-a", &["c2b:write", "c2b:read"])
        .await;
    let auth = bearer("tok-a");

    let request = json!({
        "business_id": business.id,
        "phone_number": "0708374149",
        "amount": "10.40",
        "account_reference": "INV-000000000001"
    });
    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/v1/c2b/stk/push",
        Some(("authorization", &auth)),
        &request.to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["ok"], true);
    assert_eq!(body["status_code"], 0);
    let row = &body["stk_request"];
    assert_eq!(row["status"], "submitted");
    assert_eq!(row["phone_number"], "254708374149");
    assert_eq!(row["account_reference"], "INV-00000000");
    assert_eq!(row["checkout_request_id"], "ws_CO_api");
    let id = row["id"].as_str().unwrap().to_string();

    let callback = json!({"Body": {"stkCallback": {
        "MerchantRequestID": "29115-9",
        "CheckoutRequestID": "ws_CO_api",
        "ResultCode": 1032,
        "ResultDesc": "Request cancelled by user"
    }}});
    let (status, _) = send(
        &app.router,
        Method::POST,
        "/api/v1/c2b/stk/callback",
        None,
        &callback.to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // The first write bound client-a to the business, so no business_id is needed
    let (status, body) = send(
        &app.router,
        Method::GET,
        &format!("/api/v1/c2b/stk/{}", id),
        Some(("authorization", &auth)),
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stk_request"]["status"], "cancelled");
    assert!(body["status_code"].as_i64().unwrap() > 0);
    assert_eq!(body["status_message"], "Request cancelled by user");
}

#[tokio::test]
async fn test_rows_of_other_businesses_are_not_found() {
    let app = create_test_app(None);
    let duka = configured_business(&app.state, "Duka").await;
    let soko = configured_business(&app.state, "Soko").await;
    app.tokens.insert("tok-a", "client-a", &["c2b:write", "c2b:read"]).await;
    app.tokens.insert("tok-b", "client-b", &["c2b:read"]).await;

    let request = json!({"business_id": duka.id, "phone_number": "254708374149", "amount": 5});
    let (_, body) = send(
        &app.router,
        Method::POST,
        "/api/v1/c2b/stk/push",
        Some(("authorization", &bearer("tok-a"))),
        &request.to_string(),
    )
    .await;
    let id = body["stk_request"]["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app.router,
        Method::GET,
        &format!("/api/v1/c2b/stk/{}?business_id={}", id, soko.id),
        Some(("authorization", &bearer("tok-b"))),
        "",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // client-a is bound to Duka and may not switch
    let (status, body) = send(
        &app.router,
        Method::GET,
        &format!("/api/v1/c2b/stk/{}?business_id={}", id, soko.id),
        Some(("authorization", &bearer("tok-a"))),
        "",
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Client is not allowed to access this business");

    let (status, body) = send(
        &app.router,
        Method::GET,
        &format!("/api/v1/c2b/stk/{}?business_id=not-a-uuid", id),
        Some(("authorization", &bearer("tok-b"))),
        "",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Invalid business_id");
}

#[tokio::test]
async fn test_missing_credentials_answers_400() {
    let app = create_test_app(Some(INTERNAL_KEY));
    app.tokens.insert("tok-a", "client-a", &["c2b:write"]).await;

    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/v1/maintainer/businesses",
        Some(("x-api-key", INTERNAL_KEY)),
        r#"{"name": "Unconfigured"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["business"]["status"], "active");
    let business_id = body["business"]["id"].as_str().unwrap().to_string();

    let request = json!({"business_id": business_id, "phone_number": "254708374149", "amount": 5});
    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/v1/c2b/stk/push",
        Some(("authorization", &bearer("tok-a"))),
        &request.to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Daraja credentials not configured for this business");
    assert!(body["status_code"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_maintainer_suspends_and_rebinds() {
    let app = create_test_app(Some(INTERNAL_KEY));
    let duka = configured_business(&app.state, "Duka").await;
    let soko = configured_business(&app.state, "Soko").await;
    app.tokens.insert("tok-a", "client-a", &["c2b:write"]).await;
    let key = Some(("x-api-key", INTERNAL_KEY));

    let (status, body) = send(
        &app.router,
        Method::PUT,
        "/api/v1/maintainer/clients/client-a/binding",
        key,
        &json!({"business_id": duka.id}).to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["client_id"], "client-a");

    let (status, _) = send(
        &app.router,
        Method::PUT,
        &format!("/api/v1/maintainer/businesses/{}/status", duka.id),
        key,
        r#"{"status": "suspended"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let request = json!({"phone_number": "254708374149", "amount": 5}).to_string();
    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/v1/c2b/stk/push",
        Some(("authorization", &bearer("tok-a"))),
        &request,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Business is suspended");

    let (status, _) = send(
        &app.router,
        Method::PUT,
        "/api/v1/maintainer/clients/client-a/binding",
        key,
        &json!({"business_id": soko.id}).to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/v1/c2b/stk/push",
        Some(("authorization", &bearer("tok-a"))),
        &request,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["stk_request"]["business_id"], json!(soko.id));

    let (status, body) = send(
        &app.router,
        Method::DELETE,
        "/api/v1/maintainer/clients/client-a/binding",
        key,
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], true);

    let (status, _) = send(
        &app.router,
        Method::POST,
        "/api/v1/c2b/stk/push",
        Some(("authorization", &bearer("tok-a"))),
        &request,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

async fn seed_rows(state: &AppState, kind: LedgerKind, business: &Business, count: usize) {
    for _ in 0..count {
        let new = NewLedgerRow::new(kind, Some(business.id), Environment::Sandbox);
        state.stores.ledger.insert(LedgerRow::queued(new)).await.unwrap();
    }
}

#[tokio::test]
async fn test_history_lists_only_the_callers_rows() {
    let app = create_test_app(None);
    let duka = configured_business(&app.state, "Duka").await;
    let soko = configured_business(&app.state, "Soko").await;
    seed_rows(&app.state, LedgerKind::QrCode, &duka, 3).await;
    seed_rows(&app.state, LedgerKind::QrCode, &soko, 1).await;
    seed_rows(&app.state, LedgerKind::RatibaOrder, &duka, 1).await;
    app.tokens
        .insert("tok-a", "client-a", &["qr:read", "ratiba:read", "b2c:read"])
        .await;
    app.tokens.insert("tok-c", "client-c", &["c2b:read"]).await;
    let auth = bearer("tok-a");

    let (status, body) = send(
        &app.router,
        Method::GET,
        &format!("/api/v1/qr/history?business_id={}", duka.id),
        Some(("authorization", &auth)),
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rows = body["results"].as_array().unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r["business_id"] == json!(duka.id)));

    // Bound to Duka by the first read
    let (status, body) = send(
        &app.router,
        Method::GET,
        "/api/v1/qr/history?limit=2",
        Some(("authorization", &auth)),
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"].as_array().unwrap().len(), 2);

    let (_, body) = send(
        &app.router,
        Method::GET,
        "/api/v1/ratiba/history",
        Some(("authorization", &auth)),
        "",
    )
    .await;
    assert_eq!(body["results"].as_array().unwrap().len(), 1);

    let (status, body) = send(
        &app.router,
        Method::GET,
        "/api/v1/b2c/single/list",
        Some(("authorization", &auth)),
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true, "results": []}));

    let (status, _) = send(
        &app.router,
        Method::GET,
        &format!("/api/v1/qr/history?business_id={}", soko.id),
        Some(("authorization", &bearer("tok-c"))),
        "",
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_c2b_transactions_are_internal_and_filtered() {
    let app = create_test_app(Some(INTERNAL_KEY));
    for trans_id in ["RKTQDM7W6S", "RKTQDM7W6T"] {
        let payload = json!({
            "TransactionType": "Pay Bill",
            "TransID": trans_id,
            "TransAmount": "10.00",
            "BillRefNumber": "INV-9",
            "MSISDN": "254708374149"
        });
        let (status, _) = send(
            &app.router,
            Method::POST,
            "/api/v1/c2b/confirmation",
            None,
            &payload.to_string(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    let key = Some(("x-api-key", INTERNAL_KEY));

    let (status, _) = send(&app.router, Method::GET, "/api/v1/c2b/transactions/all", None, "").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) =
        send(&app.router, Method::GET, "/api/v1/c2b/transactions/all", key, "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["transactions"].as_array().unwrap().len(), 2);

    let (_, body) = send(
        &app.router,
        Method::GET,
        "/api/v1/c2b/transactions/completed?limit=1",
        key,
        "",
    )
    .await;
    let rows = body["transactions"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["status"], "successful");

    let (_, body) = send(
        &app.router,
        Method::GET,
        "/api/v1/c2b/transactions/completed?status=failed",
        key,
        "",
    )
    .await;
    assert_eq!(body, json!({"transactions": []}));

    let (status, body) = send(
        &app.router,
        Method::GET,
        "/api/v1/c2b/transactions/completed?date=2026-01-01",
        key,
        "",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Invalid date format. Use dd/mm/yyyy.");
}

#[tokio::test]
async fn test_b2b_bulk_batches_are_kept_apart_from_b2c() {
    let app = create_test_app(Some(INTERNAL_KEY));
    let business = configured_business(&app.state, "Duka").await;
    let key = Some(("x-api-key", INTERNAL_KEY));

    let request = json!({
        "business_id": business.id,
        "reference": "suppliers",
        "items": [
            {"party_b": "600000", "amount": 2500, "product_type": "BusinessPayBill"},
            {"amount": 10}
        ]
    });
    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/v1/b2b/bulk",
        key,
        &request.to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let batch = &body["batch"];
    assert_eq!(batch["product"], "b2b");
    assert_eq!(batch["status"], "queued");
    assert_eq!(batch["items"].as_array().unwrap().len(), 1);
    assert_eq!(batch["items"][0]["product_type"], "BusinessPayBill");
    let id = batch["id"].as_str().unwrap().to_string();

    let (_, body) = send(&app.router, Method::GET, "/api/v1/b2b/bulk/list", key, "").await;
    assert_eq!(body["results"].as_array().unwrap().len(), 1);
    let (_, body) = send(&app.router, Method::GET, "/api/v1/b2c/bulk/list", key, "").await;
    assert_eq!(body, json!({"results": []}));

    let (status, body) = send(
        &app.router,
        Method::GET,
        &format!("/api/v1/b2b/bulk/{}", id),
        key,
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["batch"]["reference"], "suppliers");

    let (status, _) = send(
        &app.router,
        Method::GET,
        &format!("/api/v1/b2c/bulk/{}", id),
        key,
        "",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
